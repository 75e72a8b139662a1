use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use crawlgrid_broker::{BrokerError, Delivery, FailoverBroker, payload_preview};
use crawlgrid_models::{
    Action, ActionChain, QueueIdentity, Service,
    errors::{RuntimeError, SendableError},
};
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::{sync::Notify, task::JoinSet};

use crate::{
    caretaker::Caretaker,
    config::PoolConfig,
    dispatch::{Decision, route},
    handler::{ActionHandler, HandlerRegistry},
    memory::is_short_memory,
    throttle::throttle_delay,
    throughput::{self, ThroughputWindow},
};

/// Sleep for `duration`, returning early once the pool is told to stop.
pub(crate) async fn pause(running: &AtomicBool, shutdown: &Notify, duration: Duration) {
    if duration.is_zero() {
        return;
    }
    let notified = shutdown.notified();
    tokio::pin!(notified);
    notified.as_mut().enable();
    if !running.load(Ordering::SeqCst) {
        return;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = notified => {}
    }
}

enum ChainOutcome {
    Completed,
    QuotaExceeded,
}

/// Worker loops consuming the source queues of one service.
pub struct ConsumerPool {
    broker: Arc<FailoverBroker>,
    service: Service,
    handler: Arc<dyn ActionHandler>,
    config: PoolConfig,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    target_fill: Arc<AtomicU64>,
    workers: Vec<(String, Arc<AtomicUsize>)>,
}

impl ConsumerPool {
    pub fn new(
        broker: Arc<FailoverBroker>,
        service: Service,
        registry: &HandlerRegistry,
        config: PoolConfig,
    ) -> Result<Self, SendableError> {
        let handler = registry.get(service).ok_or_else(|| {
            RuntimeError::boxed(
                "worker.handler.missing",
                format!("no action handler registered for {service}"),
            )
        })?;
        let per_queue = if config.source_queues.is_empty() {
            0
        } else {
            (config.workers / config.source_queues.len()).max(1)
        };
        let workers = config
            .source_queues
            .iter()
            .flat_map(|queue| std::iter::repeat(queue.clone()).take(per_queue))
            .map(|queue| (queue, Arc::new(AtomicUsize::new(0))))
            .collect();
        Ok(Self {
            broker,
            service,
            handler,
            config,
            running: Arc::new(AtomicBool::new(true)),
            shutdown: Arc::new(Notify::new()),
            target_fill: Arc::new(AtomicU64::new(0)),
            workers,
        })
    }

    pub fn service(&self) -> Service {
        self.service
    }

    /// Source queue of every worker loop, one entry per loop.
    pub fn assignments(&self) -> Vec<&str> {
        self.workers.iter().map(|(queue, _)| queue.as_str()).collect()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Handled messages over the last minute, summed across workers.
    pub fn messages_per_minute(&self) -> usize {
        let counters: Vec<_> = self.workers.iter().map(|(_, c)| Arc::clone(c)).collect();
        throughput::aggregate(&counters)
    }

    /// Last downstream depth published by the caretaker.
    pub fn target_fill(&self) -> u64 {
        self.target_fill.load(Ordering::SeqCst)
    }

    /// Ask every loop to stop after its current receive/handle cycle.
    pub fn terminate(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Consumer pool {} terminating", self.service);
        }
        self.shutdown.notify_waiters();
    }

    /// Runs the worker loops and the caretaker until [`ConsumerPool::terminate`].
    pub async fn run(self: Arc<Self>) {
        self.recover_sources().await;

        let caretaker = Caretaker::new(
            Arc::clone(&self.broker),
            self.service,
            Arc::clone(&self.target_fill),
            self.workers.iter().map(|(_, c)| Arc::clone(c)).collect(),
            self.config.caretaker_interval,
            Arc::clone(&self.running),
            Arc::clone(&self.shutdown),
        );
        let caretaker = tokio::spawn(caretaker.run());

        let mut tasks = JoinSet::new();
        for (slot, (queue, counter)) in self.workers.iter().enumerate() {
            let pool = Arc::clone(&self);
            let queue = queue.clone();
            let counter = Arc::clone(counter);
            tasks.spawn(async move { pool.worker_loop(slot, queue, counter).await });
        }
        info!(
            "Consumer pool {} started {} worker(s) on {:?}",
            self.service,
            self.workers.len(),
            self.config.source_queues
        );

        while let Some(result) = tasks.join_next().await {
            if let Err(err) = result {
                error!("Worker task join error: {}", err);
            }
        }
        if let Err(err) = caretaker.await {
            error!("Caretaker task join error: {}", err);
        }
        info!("Consumer pool {} stopped", self.service);
    }

    /// Redeliver whatever a previous run left unacknowledged and log the backlog.
    async fn recover_sources(&self) {
        for queue in &self.config.source_queues {
            let identity = QueueIdentity::new(self.service, queue.as_str());
            if let Err(err) = self.broker.recover(self.service, queue).await {
                warn!("Could not recover {}: {}", identity, err);
            }
            match self.broker.available(self.service, queue).await {
                Ok(snapshot) => info!(
                    "{} has {} message(s) waiting on the {} backend",
                    identity, snapshot.available, snapshot.backend
                ),
                Err(err) => warn!("Could not read the depth of {}: {}", identity, err),
            }
        }
    }

    async fn worker_loop(&self, slot: usize, queue: String, counter: Arc<AtomicUsize>) {
        let identity = QueueIdentity::new(self.service, queue.as_str());
        let mut window = ThroughputWindow::new(counter);
        debug!("Worker {}#{} consuming {}", self.service, slot, identity);

        while self.is_running() {
            if is_short_memory(self.config.short_memory_mib) {
                warn!(
                    "Worker {}#{}: resident memory above {} MiB, clearing caches",
                    self.service, slot, self.config.short_memory_mib
                );
                self.handler.clear_caches();
            }

            let delay = throttle_delay(
                self.target_fill.load(Ordering::SeqCst),
                self.config.throttling_limit,
                self.config.throttle_cap,
            );
            if !delay.is_zero() {
                debug!("Worker {}#{} throttled for {:?}", self.service, slot, delay);
                self.pause(delay).await;
                if !self.is_running() {
                    break;
                }
            }

            let received = self
                .broker
                .receive(
                    self.service,
                    &queue,
                    self.config.receive_timeout,
                    self.config.auto_ack,
                )
                .await;
            let delivery = match received {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(err) => {
                    warn!("Worker {}#{} receive failed: {}", self.service, slot, err);
                    self.pause(self.config.error_backoff).await;
                    continue;
                }
            };

            if self.handle_delivery(&delivery).await {
                window.record();
            }
        }
        debug!("Worker {}#{} stopped", self.service, slot);
    }

    async fn pause(&self, duration: Duration) {
        pause(&self.running, &self.shutdown, duration).await;
    }

    /// Returns true when the message was handled and acknowledged.
    async fn handle_delivery(&self, delivery: &Delivery) -> bool {
        let chain = match ActionChain::from_bytes(&delivery.payload) {
            Ok(chain) => chain,
            Err(err) => {
                warn!(
                    "Dropping undecodable message from {}: {} ({})",
                    delivery.identity,
                    err,
                    payload_preview(&delivery.payload)
                );
                self.settle(delivery, true).await;
                self.pause(self.config.error_backoff).await;
                return false;
            }
        };
        match self.process_chain(chain).await {
            ChainOutcome::Completed => self.settle(delivery, true).await,
            ChainOutcome::QuotaExceeded => {
                self.settle(delivery, false).await;
                self.pause(self.config.error_backoff).await;
                false
            }
        }
    }

    /// Acknowledge or reject on the backend that issued the delivery.
    async fn settle(&self, delivery: &Delivery, acknowledge: bool) -> bool {
        let Some(handle) = &delivery.handle else {
            return true;
        };
        let result = if acknowledge {
            self.broker.acknowledge(handle).await
        } else {
            self.broker.reject(handle).await
        };
        match result {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    "Could not {} delivery {} on {}: {}",
                    if acknowledge { "acknowledge" } else { "reject" },
                    handle.tag,
                    delivery.identity,
                    err
                );
                false
            }
        }
    }

    async fn process_chain(&self, chain: ActionChain) -> ChainOutcome {
        let ActionChain { mut data, actions } = chain;
        for action in actions {
            let result = match route(&action, self.service) {
                Ok(Decision::Forward(target)) => self.forward(action, &target, &data).await,
                Ok(Decision::Execute) => self.execute(action, &mut data).await,
                Err(err) => {
                    warn!("Skipping malformed action: {}", err);
                    continue;
                }
            };
            match result {
                Ok(()) => {}
                Err(err) if err.is_quota_exceeded() => {
                    warn!(
                        "{}: downstream quota exceeded, returning message to its queue",
                        self.service
                    );
                    return ChainOutcome::QuotaExceeded;
                }
                Err(err) => error!("{}: action failed: {}", self.service, err),
            }
        }
        ChainOutcome::Completed
    }

    async fn forward(
        &self,
        action: Action,
        target: &QueueIdentity,
        data: &[Value],
    ) -> Result<(), BrokerError> {
        let bytes = ActionChain::next_hop(action, data).to_bytes()?;
        self.broker
            .send(target.service, &target.queue, &bytes)
            .await
            .map(|_| ())
    }

    async fn execute(&self, action: Action, data: &mut Vec<Value>) -> Result<(), BrokerError> {
        if !self.handler.process_action(&action, data).await? {
            warn!(
                "{} handler reported failure for an action on {}",
                self.service, action.queue
            );
            return Ok(());
        }
        for follow_on in action.actions {
            self.enqueue_follow_on(follow_on, data).await?;
        }
        Ok(())
    }

    /// One retry after the follow-on backoff; a second failure drops the
    /// follow-on. Only the quota signal is returned to the caller.
    async fn enqueue_follow_on(&self, action: Action, data: &[Value]) -> Result<(), BrokerError> {
        let target = match action.target() {
            Ok(target) => target,
            Err(err) => {
                warn!("Skipping malformed follow-on action: {}", err);
                return Ok(());
            }
        };
        let bytes = match ActionChain::next_hop(action, data).to_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                error!("Could not encode follow-on for {}: {}", target, err);
                return Ok(());
            }
        };
        for attempt in 0..2 {
            match self.broker.send(target.service, &target.queue, &bytes).await {
                Ok(_) => return Ok(()),
                Err(err) if err.is_quota_exceeded() => return Err(err),
                Err(err) if attempt == 0 => {
                    warn!(
                        "Enqueue of follow-on to {} failed, retrying in {:?}: {}",
                        target, self.config.follow_on_backoff, err
                    );
                    self.pause(self.config.follow_on_backoff).await;
                }
                Err(err) => error!("Dropping follow-on for {}: {}", target, err),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::PassThroughHandler;
    use crawlgrid_broker::{BrokerConfig, peer::PeerFactory};

    fn pool(workers: usize, queues: &[&str]) -> ConsumerPool {
        let broker = Arc::new(FailoverBroker::new(
            BrokerConfig::default(),
            PeerFactory::in_memory(),
        ));
        let registry = HandlerRegistry::new().register(
            Service::Loader,
            Arc::new(PassThroughHandler::new(Service::Loader)),
        );
        let mut config = PoolConfig::for_service(Service::Loader);
        config.workers = workers;
        config.source_queues = queues.iter().map(|q| q.to_string()).collect();
        ConsumerPool::new(broker, Service::Loader, &registry, config).unwrap()
    }

    #[test]
    fn workers_are_spread_across_queues() {
        assert_eq!(pool(4, &["a", "b"]).assignments(), vec!["a", "a", "b", "b"]);
        assert_eq!(pool(1, &["a", "b", "c"]).assignments(), vec!["a", "b", "c"]);
        assert_eq!(pool(5, &["a", "b"]).assignments().len(), 4);
    }

    #[test]
    fn missing_handler_is_a_startup_error() {
        let broker = Arc::new(FailoverBroker::new(
            BrokerConfig::default(),
            PeerFactory::in_memory(),
        ));
        let result = ConsumerPool::new(
            broker,
            Service::Indexer,
            &HandlerRegistry::new(),
            PoolConfig::for_service(Service::Indexer),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn pause_returns_early_on_terminate() {
        let running = Arc::new(AtomicBool::new(true));
        let shutdown = Arc::new(Notify::new());
        let waiter = {
            let running = Arc::clone(&running);
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move {
                pause(&running, &shutdown, Duration::from_secs(30)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        running.store(false, Ordering::SeqCst);
        shutdown.notify_waiters();
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
