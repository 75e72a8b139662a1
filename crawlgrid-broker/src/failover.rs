//! Failover broker facade.
//!
//! Backends are held in priority order (managed transport, coordinator proxy,
//! local peer). Every call walks that list:
//!
//! 1. a backend without a live connection but with a known address is
//!    reconnected, unless it was demoted less than `reconnect_interval` ago;
//! 2. the operation is attempted; transient errors are retried in place with a
//!    backoff growing with the attempt number, fatal errors fall through at once;
//! 3. success resets the backend's failure counter, and `failure_threshold`
//!    consecutive failed calls drop the connection until the next reconnect.
//!
//! The peer backend is always present and terminates the list. The quota signal
//! is never retried and never handed to a lower-priority backend.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use crawlgrid_models::{QueueIdentity, Service};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;

use crate::peer::PeerFactory;
use crate::{
    payload_preview, AvailableSnapshot, BackendKind, BackendStatus, BrokerError, Delivery,
    DeliveryHandle, Queue, QueueFactory,
};

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Consecutive failed calls before a backend's connection is dropped.
    pub failure_threshold: u32,
    /// Attempts per backend and call while the errors are transient.
    pub retry_attempts: u32,
    /// Base wait between transient retries, multiplied by the attempt number.
    pub retry_backoff: Duration,
    /// Minimum time between reconnect attempts of a dropped backend.
    pub reconnect_interval: Duration,
    /// Depth at which `send` reports the quota signal; 0 disables the check.
    pub queue_limit: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            retry_attempts: 40,
            retry_backoff: Duration::from_millis(500),
            reconnect_interval: Duration::from_secs(60),
            queue_limit: 0,
        }
    }
}

/// Knows how to (re)establish the connection of one backend.
#[async_trait]
pub trait Connector: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn address(&self) -> String;

    async fn connect(&self) -> Result<Arc<dyn QueueFactory>, BrokerError>;
}

struct BackendSlot {
    kind: BackendKind,
    connector: Option<Arc<dyn Connector>>,
    factory: RwLock<Option<Arc<dyn QueueFactory>>>,
    failures: AtomicU32,
    retry_after: Mutex<Option<Instant>>,
    connecting: tokio::sync::Mutex<()>,
}

impl BackendSlot {
    fn new(
        kind: BackendKind,
        connector: Option<Arc<dyn Connector>>,
        factory: Option<Arc<dyn QueueFactory>>,
    ) -> Self {
        Self {
            kind,
            connector,
            factory: RwLock::new(factory),
            failures: AtomicU32::new(0),
            retry_after: Mutex::new(None),
            connecting: tokio::sync::Mutex::new(()),
        }
    }

    fn current(&self) -> Option<Arc<dyn QueueFactory>> {
        self.factory.read().clone()
    }
}

enum Operation<'a> {
    Send(&'a [u8]),
    Receive { timeout: Duration, auto_ack: bool },
    Available,
    Clear,
    Recover,
}

impl Operation<'_> {
    fn name(&self) -> &'static str {
        match self {
            Operation::Send(_) => "send",
            Operation::Receive { .. } => "receive",
            Operation::Available => "available",
            Operation::Clear => "clear",
            Operation::Recover => "recover",
        }
    }
}

enum Outcome {
    Done,
    Received(Option<crate::RawDelivery>),
    Depth(u64),
}

pub struct FailoverBroker {
    config: BrokerConfig,
    slots: Vec<BackendSlot>,
}

impl FailoverBroker {
    /// A broker backed by the peer alone. Remote backends are added with
    /// [`FailoverBroker::with_backend`] in priority order.
    pub fn new(config: BrokerConfig, peer: PeerFactory) -> Self {
        Self {
            config,
            slots: vec![BackendSlot::new(
                BackendKind::Peer,
                None,
                Some(Arc::new(peer) as Arc<dyn QueueFactory>),
            )],
        }
    }

    pub fn with_backend(mut self, connector: Arc<dyn Connector>) -> Self {
        let position = self.slots.len() - 1;
        self.slots.insert(
            position,
            BackendSlot::new(connector.kind(), Some(connector), None),
        );
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Initial connection attempt for every remote backend.
    pub async fn connect(&self) {
        for slot in &self.slots {
            if self.factory(slot).await.is_none() {
                if let Some(connector) = &slot.connector {
                    warn!(
                        "Broker/Client: {} backend at {} unavailable, continuing without it",
                        slot.kind,
                        connector.address()
                    );
                }
            }
        }
    }

    pub fn is_connected(&self, kind: BackendKind) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.kind == kind && slot.current().is_some())
    }

    pub fn backends(&self) -> Vec<BackendStatus> {
        self.slots
            .iter()
            .map(|slot| {
                let factory = slot.current();
                BackendStatus {
                    kind: slot.kind,
                    connected: factory.is_some(),
                    url: factory
                        .map(|factory| factory.connection_url())
                        .or_else(|| slot.connector.as_ref().map(|c| c.address())),
                    failures: slot.failures.load(Ordering::SeqCst),
                }
            })
            .collect()
    }

    /// Send to the highest-priority backend that accepts the message.
    pub async fn send(
        &self,
        service: Service,
        queue: &str,
        message: &[u8],
    ) -> Result<BackendKind, BrokerError> {
        let identity = QueueIdentity::new(service, queue);
        let (_, kind, _) = self.execute(&identity, Operation::Send(message)).await?;
        info!(
            "Broker/Client: send {} '{}', message: {}",
            kind,
            identity,
            payload_preview(message)
        );
        Ok(kind)
    }

    pub async fn receive(
        &self,
        service: Service,
        queue: &str,
        timeout: Duration,
        auto_ack: bool,
    ) -> Result<Option<Delivery>, BrokerError> {
        let identity = QueueIdentity::new(service, queue);
        let (outcome, kind, factory) = self
            .execute(&identity, Operation::Receive { timeout, auto_ack })
            .await?;
        let Outcome::Received(Some(raw)) = outcome else {
            return Ok(None);
        };
        if !raw.payload.is_empty() {
            info!(
                "Broker/Client: received {} '{}', message: {}",
                kind,
                identity,
                payload_preview(&raw.payload)
            );
        }
        let handle = raw.tag.map(|tag| DeliveryHandle {
            backend: kind,
            instance: factory.instance_id(),
            queue: identity.name(),
            tag,
        });
        Ok(Some(Delivery {
            identity,
            payload: raw.payload,
            backend: kind,
            handle,
        }))
    }

    pub async fn available(
        &self,
        service: Service,
        queue: &str,
    ) -> Result<AvailableSnapshot, BrokerError> {
        let identity = QueueIdentity::new(service, queue);
        let (outcome, kind, _) = self.execute(&identity, Operation::Available).await?;
        let available = match outcome {
            Outcome::Depth(depth) => depth,
            _ => 0,
        };
        Ok(AvailableSnapshot {
            identity,
            available,
            backend: kind,
            sampled_at: Utc::now(),
        })
    }

    pub async fn clear(&self, service: Service, queue: &str) -> Result<BackendKind, BrokerError> {
        let identity = QueueIdentity::new(service, queue);
        let (_, kind, _) = self.execute(&identity, Operation::Clear).await?;
        info!("Broker/Client: clear {} '{}'", kind, identity);
        Ok(kind)
    }

    /// Redeliver unacknowledged messages. Unlike the other operations this
    /// visits every reachable backend, since a crash may have left deliveries
    /// open on any of them.
    pub async fn recover(
        &self,
        service: Service,
        queue: &str,
    ) -> Result<Vec<BackendKind>, BrokerError> {
        let identity = QueueIdentity::new(service, queue);
        let name = identity.name();
        let mut recovered = Vec::new();
        let mut last_error = None;
        for slot in &self.slots {
            let Some(factory) = self.factory(slot).await else {
                continue;
            };
            match self
                .attempt_on(slot, factory.as_ref(), &name, &Operation::Recover)
                .await
            {
                Ok(_) => recovered.push(slot.kind),
                Err(err) => {
                    debug!("Broker/Client: recover {} '{}' failed: {}", slot.kind, name, err);
                    last_error = Some(err);
                }
            }
        }
        if recovered.is_empty() {
            return Err(exhausted("recover", name, last_error));
        }
        Ok(recovered)
    }

    pub async fn acknowledge(&self, handle: &DeliveryHandle) -> Result<(), BrokerError> {
        self.issuing_queue(handle).await?.acknowledge(handle.tag).await
    }

    pub async fn reject(&self, handle: &DeliveryHandle) -> Result<(), BrokerError> {
        self.issuing_queue(handle).await?.reject(handle.tag).await
    }

    pub async fn close(&self) {
        for slot in &self.slots {
            let factory = slot.factory.write().take();
            if let Some(factory) = factory {
                factory.close().await;
            }
        }
    }

    /// The queue on the factory instance that issued `handle`; never a
    /// reconnected replacement, whose tags would mean something else.
    async fn issuing_queue(&self, handle: &DeliveryHandle) -> Result<Arc<dyn Queue>, BrokerError> {
        let stale = || BrokerError::StaleDelivery {
            backend: handle.backend,
            tag: handle.tag,
        };
        let factory = self
            .slots
            .iter()
            .find(|slot| slot.kind == handle.backend)
            .and_then(BackendSlot::current)
            .filter(|factory| factory.instance_id() == handle.instance)
            .ok_or_else(stale)?;
        factory.queue(&handle.queue).await
    }

    async fn execute(
        &self,
        identity: &QueueIdentity,
        operation: Operation<'_>,
    ) -> Result<(Outcome, BackendKind, Arc<dyn QueueFactory>), BrokerError> {
        let name = identity.name();
        let mut last_error = None;
        for slot in &self.slots {
            let Some(factory) = self.factory(slot).await else {
                continue;
            };
            match self
                .attempt_on(slot, factory.as_ref(), &name, &operation)
                .await
            {
                Ok(outcome) => return Ok((outcome, slot.kind, factory)),
                Err(err) if err.is_quota_exceeded() => return Err(err),
                Err(err) => {
                    debug!(
                        "Broker/Client: {} {} '{}' failed: {}",
                        operation.name(),
                        slot.kind,
                        name,
                        err
                    );
                    last_error = Some(err);
                }
            }
        }
        Err(exhausted(operation.name(), name, last_error))
    }

    async fn attempt_on(
        &self,
        slot: &BackendSlot,
        factory: &dyn QueueFactory,
        name: &str,
        operation: &Operation<'_>,
    ) -> Result<Outcome, BrokerError> {
        let attempts = self.config.retry_attempts.max(1);
        let mut attempt = 0;
        let error = loop {
            let result = match factory.queue(name).await {
                Ok(queue) => self.perform(queue.as_ref(), name, operation).await,
                Err(err) => Err(err),
            };
            match result {
                Ok(outcome) => {
                    slot.failures.store(0, Ordering::SeqCst);
                    return Ok(outcome);
                }
                Err(err) if err.is_quota_exceeded() => return Err(err),
                Err(err) if err.is_transient() && attempt + 1 < attempts => {
                    debug!(
                        "Broker/Client: {} {} '{}' attempt {} failed: {}",
                        operation.name(),
                        slot.kind,
                        name,
                        attempt,
                        err
                    );
                    attempt += 1;
                    tokio::time::sleep(self.config.retry_backoff * attempt).await;
                }
                Err(err) => break err,
            }
        };
        self.record_failure(slot, factory);
        Err(error)
    }

    async fn perform(
        &self,
        queue: &dyn Queue,
        name: &str,
        operation: &Operation<'_>,
    ) -> Result<Outcome, BrokerError> {
        match *operation {
            Operation::Send(message) => {
                let limit = self.config.queue_limit;
                if limit > 0 && queue.available().await? >= limit {
                    return Err(BrokerError::QuotaExceeded(name.to_string()));
                }
                queue.send(message).await.map(|_| Outcome::Done)
            }
            Operation::Receive { timeout, auto_ack } => {
                queue.receive(timeout, auto_ack).await.map(Outcome::Received)
            }
            Operation::Available => queue.available().await.map(Outcome::Depth),
            Operation::Clear => queue.clear().await.map(|_| Outcome::Done),
            Operation::Recover => queue.recover().await.map(|_| Outcome::Done),
        }
    }

    fn record_failure(&self, slot: &BackendSlot, factory: &dyn QueueFactory) {
        if slot.connector.is_none() {
            return;
        }
        let failures = slot.failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures < self.config.failure_threshold {
            return;
        }
        let mut guard = slot.factory.write();
        let same_instance = guard
            .as_ref()
            .is_some_and(|current| current.instance_id() == factory.instance_id());
        if same_instance {
            let dropped = guard.take();
            drop(guard);
            *slot.retry_after.lock() = Some(Instant::now() + self.config.reconnect_interval);
            warn!(
                "Broker/Client: {} backend failed {} times in a row, dropping connection to {}",
                slot.kind,
                failures,
                factory.connection_url()
            );
            if let Some(dropped) = dropped {
                tokio::spawn(async move { dropped.close().await });
            }
        }
    }

    /// The live connection of a slot, reconnecting when the slot has an
    /// address and is not inside its reconnect pause.
    async fn factory(&self, slot: &BackendSlot) -> Option<Arc<dyn QueueFactory>> {
        if let Some(factory) = slot.current() {
            return Some(factory);
        }
        let connector = slot.connector.as_ref()?;
        let _connecting = slot.connecting.lock().await;
        if let Some(factory) = slot.current() {
            return Some(factory);
        }
        if let Some(retry_after) = *slot.retry_after.lock() {
            if Instant::now() < retry_after {
                return None;
            }
        }
        match connector.connect().await {
            Ok(factory) => {
                info!(
                    "Broker/Client: {} backend connected at {}",
                    slot.kind,
                    factory.connection_url()
                );
                slot.failures.store(0, Ordering::SeqCst);
                *slot.retry_after.lock() = None;
                *slot.factory.write() = Some(Arc::clone(&factory));
                Some(factory)
            }
            Err(err) => {
                warn!(
                    "Broker/Client: connection to {} backend at {} lost: {}",
                    slot.kind,
                    connector.address(),
                    err
                );
                *slot.retry_after.lock() = Some(Instant::now() + self.config.reconnect_interval);
                None
            }
        }
    }
}

fn exhausted(operation: &'static str, queue: String, cause: Option<BrokerError>) -> BrokerError {
    BrokerError::Exhausted {
        operation,
        queue,
        cause: cause
            .map(|err| err.to_string())
            .unwrap_or_else(|| "no backend reachable".into()),
    }
}
