use std::{path::PathBuf, time::Duration};

use clap::Parser;
use crawlgrid_broker::BrokerConfig;
use crawlgrid_models::{
    Service,
    errors::{RuntimeError, SendableError},
};

use crate::throttle::MAX_THROTTLE;

/// Settings of one consumer pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    pub source_queues: Vec<String>,
    /// Aggregate downstream depth at which throttling reaches its cap; 0 disables it.
    pub throttling_limit: u64,
    pub throttle_cap: Duration,
    pub receive_timeout: Duration,
    pub auto_ack: bool,
    /// Resident size in MiB above which handler caches are dropped; 0 disables it.
    pub short_memory_mib: u64,
    pub error_backoff: Duration,
    pub follow_on_backoff: Duration,
    pub caretaker_interval: Duration,
}

impl PoolConfig {
    pub fn for_service(service: Service) -> Self {
        Self {
            workers: 1,
            source_queues: service.default_source_queues(),
            throttling_limit: 0,
            throttle_cap: MAX_THROTTLE,
            receive_timeout: Duration::from_secs(10),
            auto_ack: false,
            short_memory_mib: 0,
            error_backoff: Duration::from_secs(10),
            follow_on_backoff: Duration::from_secs(10),
            caretaker_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub service: Service,
    pub coordinators: Vec<String>,
    pub peer_store: PathBuf,
    pub workdir: Option<PathBuf>,
    pub pool: PoolConfig,
    pub broker: BrokerConfig,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Crawl grid worker", long_about = None)]
struct CliArgs {
    /// Service this worker executes actions for.
    #[arg(long)]
    service: String,

    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Source queues of the service; defaults to the service's own list.
    #[arg(long, value_delimiter = ',', default_value = "")]
    queues: Vec<String>,

    /// Coordinator nodes in priority order.
    #[arg(long, value_delimiter = ',', default_value = "")]
    coordinators: Vec<String>,

    #[arg(long, default_value = "data/peer")]
    peer_store: PathBuf,

    #[arg(long)]
    workdir: Option<PathBuf>,

    #[arg(long, default_value_t = 0)]
    throttling_limit: u64,

    #[arg(long, default_value_t = 0)]
    queue_limit: u64,

    #[arg(long, default_value_t = false)]
    auto_ack: bool,

    #[arg(long, default_value_t = 0)]
    short_memory_mib: u64,

    #[arg(long, default_value_t = 10)]
    receive_timeout_seconds: u64,

    #[arg(long, default_value_t = 10)]
    failure_threshold: u32,

    #[arg(long, default_value_t = 40)]
    retry_attempts: u32,

    #[arg(long, default_value_t = 500)]
    retry_backoff_ms: u64,

    #[arg(long, default_value_t = 60)]
    reconnect_interval_seconds: u64,
}

pub fn parse_config() -> Result<Config, SendableError> {
    into_config(CliArgs::parse())
}

fn non_empty(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

fn into_config(args: CliArgs) -> Result<Config, SendableError> {
    let service: Service = args.service.parse().map_err(|err| {
        RuntimeError::boxed("worker.config.service", format!("{err}"))
    })?;
    if args.workers == 0 {
        return Err(RuntimeError::boxed(
            "worker.config.workers",
            "at least one worker is required",
        ));
    }

    let mut pool = PoolConfig::for_service(service);
    let queues = non_empty(args.queues);
    if !queues.is_empty() {
        pool.source_queues = queues;
    }
    pool.workers = args.workers;
    pool.throttling_limit = args.throttling_limit;
    pool.auto_ack = args.auto_ack;
    pool.short_memory_mib = args.short_memory_mib;
    pool.receive_timeout = Duration::from_secs(args.receive_timeout_seconds);

    let broker = BrokerConfig {
        failure_threshold: args.failure_threshold,
        retry_attempts: args.retry_attempts,
        retry_backoff: Duration::from_millis(args.retry_backoff_ms),
        reconnect_interval: Duration::from_secs(args.reconnect_interval_seconds),
        queue_limit: args.queue_limit,
    };

    Ok(Config {
        service,
        coordinators: non_empty(args.coordinators),
        peer_store: args.peer_store,
        workdir: args.workdir,
        pool,
        broker,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config, SendableError> {
        let argv = std::iter::once("crawlgrid-worker").chain(args.iter().copied());
        into_config(CliArgs::try_parse_from(argv)?)
    }

    #[test]
    fn defaults_follow_the_service() {
        let config = parse(&["--service", "parser"]).unwrap();
        assert_eq!(config.service, Service::Parser);
        assert_eq!(config.pool.source_queues, vec!["default".to_string()]);
        assert!(config.coordinators.is_empty());
        assert_eq!(config.broker.retry_attempts, 40);
        assert_eq!(config.broker.failure_threshold, 10);
        assert_eq!(config.pool.receive_timeout, Duration::from_secs(10));
    }

    #[test]
    fn lists_are_split_and_trimmed() {
        let config = parse(&[
            "--service",
            "crawler",
            "--queues",
            "a, b",
            "--coordinators",
            "10.0.0.1:8100,10.0.0.2:8100",
            "--workers",
            "4",
            "--queue-limit",
            "5000",
        ])
        .unwrap();
        assert_eq!(config.pool.source_queues, vec!["a", "b"]);
        assert_eq!(config.coordinators.len(), 2);
        assert_eq!(config.pool.workers, 4);
        assert_eq!(config.broker.queue_limit, 5000);
    }

    #[test]
    fn unknown_service_is_rejected() {
        assert!(parse(&["--service", "search"]).is_err());
        assert!(parse(&["--service", "parser", "--workers", "0"]).is_err());
    }
}
