use std::sync::Arc;

use crawlgrid_broker::{
    BackendStatus, FailoverBroker, http::client::CoordinatorConnection, peer::PeerFactory,
};
use crawlgrid_models::errors::{RuntimeError, SendableError};
use crawlgrid_utilities::startup;
use crawlgrid_worker::{
    ConsumerPool, HandlerRegistry, PassThroughHandler,
    config::{Config, parse_config},
};
use log::{error, info};

#[tokio::main]
async fn main() -> Result<(), SendableError> {
    let config = parse_config()?;
    startup::startup("Crawlgrid Worker", config.workdir.as_deref())?;
    info!(
        "Service {} with {} worker(s)",
        config.service, config.pool.workers
    );

    let broker = build_broker(&config).await?;
    let registry = HandlerRegistry::new().register(
        config.service,
        Arc::new(PassThroughHandler::new(config.service)),
    );
    let pool = Arc::new(ConsumerPool::new(
        Arc::clone(&broker),
        config.service,
        &registry,
        config.pool.clone(),
    )?);

    let pool_task = tokio::spawn(Arc::clone(&pool).run());

    tokio::signal::ctrl_c()
        .await
        .map_err(|err| RuntimeError::boxed("worker.signal", err.to_string()))?;
    info!("Shutdown signal received. Stopping worker...");
    pool.terminate();

    if let Err(err) = pool_task.await {
        if !err.is_cancelled() {
            error!("Consumer pool join error: {}", err);
        }
    }
    broker.close().await;

    Ok(())
}

async fn build_broker(config: &Config) -> Result<Arc<FailoverBroker>, SendableError> {
    let mut broker = FailoverBroker::new(
        config.broker.clone(),
        PeerFactory::open(config.peer_store.clone()),
    );
    if !config.coordinators.is_empty() {
        let connection = CoordinatorConnection::new(config.coordinators.clone())
            .map_err(|err| RuntimeError::boxed("worker.broker.coordinator", err.to_string()))?;
        broker = broker.with_backend(Arc::new(connection));
    }
    broker.connect().await;
    for status in broker.backends() {
        log_backend(&status);
    }
    Ok(Arc::new(broker))
}

fn log_backend(status: &BackendStatus) {
    info!(
        "Broker backend {}: {} ({})",
        status.kind,
        if status.connected { "connected" } else { "offline" },
        status.url.as_deref().unwrap_or("-")
    );
}
