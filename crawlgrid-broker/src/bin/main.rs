use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use crawlgrid_broker::{http::server::run_server, peer::PeerFactory, BrokerConfig, FailoverBroker};
use crawlgrid_models::errors::{RuntimeError, SendableError};
use crawlgrid_utilities::startup;
use log::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Crawl grid coordinator node", long_about = None)]
struct CliArgs {
    #[arg(long, env = "CRAWLGRID_COORDINATOR_ADDR", default_value = "0.0.0.0:8100")]
    bind: SocketAddr,

    /// Directory holding the peer queue store.
    #[arg(long, default_value = "data/peer")]
    peer_store: PathBuf,

    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Depth at which sends are refused with quota_exceeded; 0 disables the check.
    #[arg(long, default_value_t = 0)]
    queue_limit: u64,

    #[arg(long, default_value_t = 10)]
    failure_threshold: u32,

    #[arg(long, default_value_t = 40)]
    retry_attempts: u32,

    #[arg(long, default_value_t = 500)]
    retry_backoff_ms: u64,

    #[arg(long, default_value_t = 60)]
    reconnect_interval_seconds: u64,
}

#[tokio::main]
async fn main() -> Result<(), SendableError> {
    let args = CliArgs::parse();
    startup::startup("Crawlgrid Coordinator", args.workdir.as_deref())?;

    let config = BrokerConfig {
        failure_threshold: args.failure_threshold,
        retry_attempts: args.retry_attempts,
        retry_backoff: Duration::from_millis(args.retry_backoff_ms),
        reconnect_interval: Duration::from_secs(args.reconnect_interval_seconds),
        queue_limit: args.queue_limit,
    };
    let broker = Arc::new(FailoverBroker::new(config, PeerFactory::open(args.peer_store.clone())));
    broker.connect().await;

    let server = {
        let broker = Arc::clone(&broker);
        tokio::spawn(run_server(args.bind, broker))
    };

    tokio::select! {
        result = server => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!("Coordinator server stopped: {}", err);
                    broker.close().await;
                    return Err(RuntimeError::boxed("coordinator.server", err.to_string()));
                }
                Err(err) => error!("Coordinator server task failed: {}", err),
            }
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown signal received. Stopping coordinator...");
        }
    }

    broker.close().await;
    Ok(())
}
