mod errors;
pub mod failover;
pub mod http;
pub mod managed;
pub mod peer;
mod types;

pub use errors::{BrokerError, QUOTA_EXCEEDED};
pub use failover::{BrokerConfig, Connector, FailoverBroker};
pub use types::{
    payload_preview, AvailableSnapshot, BackendKind, BackendStatus, Delivery, DeliveryHandle,
    RawDelivery,
};

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use uuid::Uuid;

/// One durable named channel on a backend.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Persist a message at the tail of the queue.
    async fn send(&self, message: &[u8]) -> Result<(), BrokerError>;

    /// Destructively take the next message, waiting up to `timeout`.
    /// `Ok(None)` means the wait elapsed without a message.
    async fn receive(
        &self,
        timeout: Duration,
        auto_ack: bool,
    ) -> Result<Option<RawDelivery>, BrokerError>;

    async fn acknowledge(&self, tag: u64) -> Result<(), BrokerError>;

    /// Return an unacknowledged delivery to the queue for another attempt.
    async fn reject(&self, tag: u64) -> Result<(), BrokerError>;

    /// Redeliver everything still unacknowledged on this queue.
    async fn recover(&self) -> Result<(), BrokerError>;

    /// Approximate number of messages waiting.
    async fn available(&self) -> Result<u64, BrokerError>;

    async fn clear(&self) -> Result<(), BrokerError>;

    /// Fast liveness probe.
    async fn check_connection(&self) -> Result<(), BrokerError> {
        self.available().await.map(|_| ())
    }
}

/// Produces and memoizes queues for one backend connection.
#[async_trait]
pub trait QueueFactory: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Identity of this connection; delivery handles are only valid against it.
    fn instance_id(&self) -> Uuid;

    fn host(&self) -> String;

    fn port(&self) -> u16;

    fn connection_url(&self) -> String;

    /// Look up a queue, declaring it durable on first use.
    async fn queue(&self, name: &str) -> Result<Arc<dyn Queue>, BrokerError>;

    async fn close(&self);
}
