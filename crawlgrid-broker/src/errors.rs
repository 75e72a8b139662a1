use crawlgrid_models::ChainError;
use thiserror::Error;

use crate::types::BackendKind;

/// Wire code for the downstream quota signal.
pub const QUOTA_EXCEEDED: &str = "quota_exceeded";

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("transient transport failure: {0}")]
    Transient(String),
    #[error("fatal transport failure: {0}")]
    Fatal(String),
    #[error("quota_exceeded: {0}")]
    QuotaExceeded(String),
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("all backends failed to {operation} {queue}: {cause}")]
    Exhausted {
        operation: &'static str,
        queue: String,
        cause: String,
    },
    #[error("delivery not found: {0}")]
    UnknownDelivery(u64),
    #[error("delivery {tag} was issued by a {backend} connection that is gone")]
    StaleDelivery { backend: BackendKind, tag: u64 },
    #[error("internal broker error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Classifies an error reported as plain text by an opaque transport.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains(QUOTA_EXCEEDED) {
            BrokerError::QuotaExceeded(message)
        } else if ["refused", "auth", "access denied", "access_refused"]
            .iter()
            .any(|needle| lower.contains(needle))
        {
            BrokerError::Fatal(message)
        } else if ["timeout", "timed out", "too many connections", "421"]
            .iter()
            .any(|needle| lower.contains(needle))
        {
            BrokerError::Transient(message)
        } else {
            BrokerError::Internal(message)
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Transient(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::Fatal(_))
    }

    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, BrokerError::QuotaExceeded(_))
    }
}

impl From<ChainError> for BrokerError {
    fn from(err: ChainError) -> Self {
        BrokerError::Malformed(err.to_string())
    }
}

impl From<std::io::Error> for BrokerError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused | ErrorKind::PermissionDenied => {
                BrokerError::Fatal(err.to_string())
            }
            ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted => {
                BrokerError::Transient(err.to_string())
            }
            _ => BrokerError::classify(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transport_text() {
        assert!(BrokerError::classify("Connection refused (os error 111)").is_fatal());
        assert!(BrokerError::classify("ACCESS_REFUSED - login was refused").is_fatal());
        assert!(BrokerError::classify("read timed out").is_transient());
        assert!(BrokerError::classify("421 Too many connections").is_transient());
        assert!(BrokerError::classify("quota_exceeded: indexer_default").is_quota_exceeded());
        assert!(matches!(
            BrokerError::classify("channel closed"),
            BrokerError::Internal(_)
        ));
    }

    #[test]
    fn io_errors_follow_their_kind() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "nope");
        assert!(BrokerError::from(refused).is_fatal());
        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(BrokerError::from(timeout).is_transient());
    }

    #[test]
    fn quota_message_keeps_wire_code() {
        let err = BrokerError::QuotaExceeded("indexer_default".into());
        assert_eq!(err.to_string(), "quota_exceeded: indexer_default");
    }
}
