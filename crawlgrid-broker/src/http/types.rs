use crate::BackendStatus;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct QueueRequest {
    pub queue: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendRequest {
    pub queue: String,
    /// Base64 of the raw message bytes.
    pub payload: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReceiveRequest {
    pub queue: String,
    pub timeout_ms: u64,
    #[serde(default)]
    pub auto_ack: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReceiveResponse {
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AvailableResponse {
    pub queue: String,
    pub available: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TagRequest {
    pub tag: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    pub backends: Vec<BackendStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}
