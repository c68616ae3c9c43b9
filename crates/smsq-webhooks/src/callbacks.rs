//! Carrier callbacks. The carrier retries on non-2xx, so only malformed requests
//! are rejected; correlation misses still answer 200.

use std::collections::HashMap;

use axum::{
    extract::{Query, State},
    http::StatusCode,
};

use smsq_core::correlator::{InboundReply, StatusCallback};

use crate::{error::ApiResult, AppState};

pub async fn delivery_status(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<StatusCode> {
    let cb = StatusCallback::from_params(&params)?;
    state.correlator.on_status(cb).await?;
    Ok(StatusCode::OK)
}

pub async fn inbound_reply(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<StatusCode> {
    let reply = InboundReply::from_params(&params)?;
    state.correlator.on_inbound(reply).await?;
    Ok(StatusCode::OK)
}
