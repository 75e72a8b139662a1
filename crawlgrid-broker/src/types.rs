use std::fmt;

use chrono::{DateTime, Utc};
use crawlgrid_models::QueueIdentity;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Backends in default priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Managed,
    Coordinator,
    Peer,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Managed => "managed",
            BackendKind::Coordinator => "coordinator",
            BackendKind::Peer => "peer",
        })
    }
}

/// A message as handed out by a single queue. `tag` is absent in auto-ack mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDelivery {
    pub payload: Vec<u8>,
    pub tag: Option<u64>,
}

/// Identifies an unacknowledged delivery on the exact factory instance that issued it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryHandle {
    pub backend: BackendKind,
    pub instance: Uuid,
    pub queue: String,
    pub tag: u64,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub identity: QueueIdentity,
    pub payload: Vec<u8>,
    pub backend: BackendKind,
    pub handle: Option<DeliveryHandle>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AvailableSnapshot {
    pub identity: QueueIdentity,
    pub available: u64,
    pub backend: BackendKind,
    pub sampled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendStatus {
    pub kind: BackendKind,
    pub connected: bool,
    pub url: Option<String>,
    pub failures: u32,
}

const PREVIEW_LIMIT: usize = 1000;

/// Single-line excerpt of a payload for log output.
pub fn payload_preview(payload: &[u8]) -> String {
    let end = payload.len().min(PREVIEW_LIMIT);
    String::from_utf8_lossy(&payload[..end])
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
