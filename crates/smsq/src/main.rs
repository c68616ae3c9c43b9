use std::sync::Arc;

use anyhow::Context;

use smsq_core::{
    config::Config,
    control::ControlChannel,
    conversation::Conversations,
    correlator::Correlator,
    dispatch::DispatchWorker,
    messaging::{port::MessagingGateway, throttled::ThrottledGateway},
    ports::Store,
    runtime::LocalTaskRuntime,
};
use smsq_sqlite::SqliteStore;
use smsq_vonage::{VonageConfig, VonageGateway};
use smsq_webhooks::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    smsq_core::logging::init("smsq")?;

    let cfg = Config::load().context("loading configuration")?;

    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::open(&cfg.database_path)
            .with_context(|| format!("opening database {}", cfg.database_path.display()))?,
    );

    let vonage = VonageGateway::new(VonageConfig::from(&cfg.carrier))?;
    let gateway: Arc<dyn MessagingGateway> = Arc::new(ThrottledGateway::new(
        Arc::new(vonage),
        cfg.account_min_send_interval,
    ));

    let runtime = LocalTaskRuntime::new(cfg.runtime);
    let worker = Arc::new(DispatchWorker::new(
        store.clone(),
        gateway.clone(),
        cfg.dispatch.clone(),
    ));

    let state = AppState {
        store: store.clone(),
        control: Arc::new(ControlChannel::new(
            store.clone(),
            Arc::new(runtime.clone()),
            worker,
        )),
        correlator: Arc::new(Correlator::new(store.clone(), cfg.correlator.clone())),
        conversations: Arc::new(Conversations::new(store, gateway)),
    };

    smsq_webhooks::serve(cfg.listen_addr, state, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown requested");
    })
    .await
    .context("http server failed")?;

    runtime.shutdown().await;
    Ok(())
}
