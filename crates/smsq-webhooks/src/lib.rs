//! HTTP surface: carrier webhooks plus the operator boundary for queueing and
//! controlling campaign runs.

pub mod api;
pub mod callbacks;
pub mod error;

use std::{future::Future, net::SocketAddr, sync::Arc};

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use smsq_core::{
    control::ControlChannel, conversation::Conversations, correlator::Correlator, errors::Error,
    ports::Store, Result,
};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub control: Arc<ControlChannel>,
    pub correlator: Arc<Correlator>,
    pub conversations: Arc<Conversations>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/messages/status", get(callbacks::delivery_status))
        .route("/messages/inbound", get(callbacks::inbound_reply))
        .route("/campaigns", post(api::create_campaign))
        .route("/queue", get(api::list_queue).post(api::enqueue))
        .route("/queue/{id}", get(api::get_entry))
        .route("/queue/{id}/pause", post(api::pause))
        .route("/queue/{id}/cancel", post(api::cancel))
        .route("/queue/{id}/resume", post(api::resume))
        .route(
            "/campaigns/{campaign}/threads/{phone}",
            get(api::thread).post(api::reply),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "http server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(Error::Io)
}
