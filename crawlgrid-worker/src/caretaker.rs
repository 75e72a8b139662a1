use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use crawlgrid_broker::FailoverBroker;
use crawlgrid_models::{QueueIdentity, Service};
use log::{debug, info};
use tokio::sync::Notify;

use crate::{pool::pause, throughput};

/// Periodically samples the depth of the queues a service feeds and publishes
/// it as the throttling input of the pool's workers. It is the only writer of
/// `target_fill`.
pub struct Caretaker {
    broker: Arc<FailoverBroker>,
    service: Service,
    targets: Vec<QueueIdentity>,
    target_fill: Arc<AtomicU64>,
    throughput: Vec<Arc<AtomicUsize>>,
    interval: Duration,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl Caretaker {
    pub fn new(
        broker: Arc<FailoverBroker>,
        service: Service,
        target_fill: Arc<AtomicU64>,
        throughput: Vec<Arc<AtomicUsize>>,
        interval: Duration,
        running: Arc<AtomicBool>,
        shutdown: Arc<Notify>,
    ) -> Self {
        let targets = service
            .target_services()
            .iter()
            .flat_map(|target| {
                target
                    .default_source_queues()
                    .into_iter()
                    .map(move |queue| QueueIdentity::new(*target, queue))
            })
            .collect();
        Self {
            broker,
            service,
            targets,
            target_fill,
            throughput,
            interval,
            running,
            shutdown,
        }
    }

    pub fn targets(&self) -> &[QueueIdentity] {
        &self.targets
    }

    /// One sampling pass. A target whose depth cannot be read counts as empty.
    pub async fn sample(&self) -> u64 {
        let mut fill = 0;
        for target in &self.targets {
            match self.broker.available(target.service, &target.queue).await {
                Ok(snapshot) => fill += snapshot.available,
                Err(err) => debug!("Caretaker could not sample {}: {}", target, err),
            }
        }
        self.target_fill.store(fill, Ordering::SeqCst);
        info!(
            "Caretaker {}: {} message(s)/minute, downstream fill {}",
            self.service,
            throughput::aggregate(&self.throughput),
            fill
        );
        fill
    }

    pub async fn run(self) {
        while self.running.load(Ordering::SeqCst) {
            self.sample().await;
            pause(&self.running, &self.shutdown, self.interval).await;
        }
        debug!("Caretaker {} stopped", self.service);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crawlgrid_broker::{BrokerConfig, peer::PeerFactory};

    fn caretaker(broker: &Arc<FailoverBroker>, service: Service) -> (Caretaker, Arc<AtomicU64>) {
        let fill = Arc::new(AtomicU64::new(0));
        let caretaker = Caretaker::new(
            Arc::clone(broker),
            service,
            Arc::clone(&fill),
            vec![Arc::new(AtomicUsize::new(2))],
            Duration::from_secs(60),
            Arc::new(AtomicBool::new(true)),
            Arc::new(Notify::new()),
        );
        (caretaker, fill)
    }

    #[tokio::test]
    async fn publishes_downstream_depth() {
        let broker = Arc::new(FailoverBroker::new(
            BrokerConfig::default(),
            PeerFactory::in_memory(),
        ));
        for _ in 0..3 {
            broker.send(Service::Indexer, "default", b"{}").await.unwrap();
        }
        broker.send(Service::Parser, "default", b"{}").await.unwrap();

        let (caretaker, fill) = caretaker(&broker, Service::Parser);
        assert_eq!(
            caretaker.targets(),
            &[QueueIdentity::new(Service::Indexer, "default")]
        );
        assert_eq!(caretaker.sample().await, 3);
        assert_eq!(fill.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_service_has_nothing_downstream() {
        let broker = Arc::new(FailoverBroker::new(
            BrokerConfig::default(),
            PeerFactory::in_memory(),
        ));
        let (caretaker, _) = caretaker(&broker, Service::Indexer);
        assert!(caretaker.targets().is_empty());
        assert_eq!(caretaker.sample().await, 0);
    }

    #[tokio::test]
    async fn run_stops_when_flag_clears() {
        let broker = Arc::new(FailoverBroker::new(
            BrokerConfig::default(),
            PeerFactory::in_memory(),
        ));
        let (caretaker, _) = caretaker(&broker, Service::Crawler);
        let running = Arc::clone(&caretaker.running);
        let shutdown = Arc::clone(&caretaker.shutdown);
        let task = tokio::spawn(caretaker.run());

        tokio::time::sleep(Duration::from_millis(20)).await;
        running.store(false, Ordering::SeqCst);
        shutdown.notify_waiters();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
