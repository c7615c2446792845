//! Error taxonomy for broker operations.
//!
//! One unified type so callers can match on recoverability: setup and
//! configuration errors are caught at startup, request errors mean the
//! local client could not queue a packet, connection errors are handled by
//! the kernel's backoff, and `RetriesExhausted` marks a sustained outage.

use thiserror::Error;

use super::backoff::BackoffError;

/// The unified error type for broker operations.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Client could not be built, or the broker refused the handshake with
    /// a terminal CONNACK code (bad credentials, protocol mismatch).
    #[error("client setup error: {0}")]
    ClientSetup(String),

    /// Settings failed validation (checked before building the client).
    #[error("configuration error: {0}")]
    Config(#[from] validator::ValidationErrors),

    /// The local client could not queue a publish/subscribe request,
    /// usually because the event loop has shut down.
    #[error("client request error: {0}")]
    ClientRequest(#[from] rumqttc::ClientError),

    /// Network-level connection failure. Boxed to keep the enum small.
    #[error("connection error: {0}")]
    Connection(#[from] Box<rumqttc::ConnectionError>),

    /// The reconnect backoff gave up after its configured attempt budget.
    #[error("retry policy exhausted: {0}")]
    RetriesExhausted(#[from] BackoffError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rumqttc::ConnectionError> for TransferError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        TransferError::Connection(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        let err = TransferError::ClientSetup("bad credentials".into());
        assert_eq!(err.to_string(), "client setup error: bad credentials");
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: TransferError = io.into();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn connection_error_is_boxed() {
        let conn = rumqttc::ConnectionError::NetworkTimeout;
        let err: TransferError = conn.into();
        assert!(matches!(err, TransferError::Connection(_)));
    }
}
