//! Error types shared across the crate.
//!
//! `LinkError` is the internal taxonomy every layer returns. Wire codecs use
//! `anyhow` for decode diagnostics and are folded into `LinkError::Decode` at
//! the service boundary. `UserFacingError` is the small closed set surfaced to
//! applications through [`ErrorTracker`].

use std::time::Duration;

use tokio::sync::broadcast;

pub type Result<T> = std::result::Result<T, LinkError>;

/// Capacity of the user-facing error stream.
pub const ERROR_STREAM_CAPACITY: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// Link-level failure: write rejected, link dropped, bonding failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// The session or channel this operation depended on has gone away
    #[error("Disconnected")]
    Disconnected,

    /// A correlated response or confirmation did not arrive in time
    #[error("Timed out after {0:?} waiting for {1}")]
    Timeout(Duration, &'static str),

    /// Peer sent something valid on the wire but wrong for the exchange
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Malformed inbound payload
    #[error("Decode error: {0}")]
    Decode(String),

    /// A single-instance operation is already running
    #[error("{0} already active")]
    Busy(&'static str),

    /// Firmware manifest failed validation before any transfer
    #[error("Safety check failed: {0}")]
    SafetyCheck(String),

    /// Bulk transfer failed part-way
    #[error("Transfer failed after {bytes_transferred} bytes: {message}")]
    TransferFailed {
        message: String,
        bytes_transferred: u64,
    },

    #[error("Cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LinkError {
    /// Fold a codec error into the decode category, keeping the context chain.
    pub fn decode(err: anyhow::Error) -> Self {
        Self::Decode(format!("{err:#}"))
    }

    /// Errors that mean the link itself is gone, as opposed to one operation failing.
    pub fn is_transport_fatal(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Disconnected)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(..))
    }
}

/// Failures worth showing to a user. Everything else is diagnostic only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UserFacingError {
    #[error("Failed to download app: {0}")]
    FailedToDownloadApp(String),

    #[error("Failed to remove app from store: {0}")]
    FailedToRemoveFromStore(String),

    #[error("Failed to sideload app: {0}")]
    FailedToSideloadApp(String),
}

/// Observable stream of [`UserFacingError`]s.
#[derive(Debug, Clone)]
pub struct ErrorTracker {
    tx: broadcast::Sender<UserFacingError>,
}

impl ErrorTracker {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(ERROR_STREAM_CAPACITY);
        Self { tx }
    }

    pub fn report(&self, error: UserFacingError) {
        tracing::warn!(%error, "user-facing error");
        // No subscribers is fine
        let _ = self.tx.send(error);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UserFacingError> {
        self.tx.subscribe()
    }
}

impl Default for ErrorTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_keeps_context() {
        let err = anyhow::anyhow!("short payload").context("BlobResponse");
        match LinkError::decode(err) {
            LinkError::Decode(msg) => {
                assert!(msg.contains("BlobResponse"));
                assert!(msg.contains("short payload"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_transfer_failed_message() {
        let err = LinkError::TransferFailed {
            message: "nack".into(),
            bytes_transferred: 4000,
        };
        assert_eq!(err.to_string(), "Transfer failed after 4000 bytes: nack");
        assert!(!err.is_transport_fatal());
        assert!(LinkError::Disconnected.is_transport_fatal());
    }

    #[tokio::test]
    async fn test_error_tracker_broadcasts() {
        let tracker = ErrorTracker::new();
        let mut rx = tracker.subscribe();
        tracker.report(UserFacingError::FailedToSideloadApp("crc".into()));
        assert_eq!(
            rx.recv().await.unwrap(),
            UserFacingError::FailedToSideloadApp("crc".into())
        );
    }
}
