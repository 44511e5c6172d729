//! Error taxonomy for replication.
//!
//! Local filesystem errors pass through unchanged; everything the
//! propagation machinery can fail with gets its own variant so callers can
//! tell a broker outage from a transfer fault.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Error from the underlying local filesystem primitive, unchanged.
    #[error(transparent)]
    LocalIo(#[from] std::io::Error),

    /// Blocking variants are permanently disabled: there is no completion
    /// hook to attach propagation to.
    #[error("blocking operation `{0}` is disabled, use the async variant")]
    DeprecatedOperation(&'static str),

    /// Broker unreachable or the publish was rejected.
    #[error("publish failed: {0}")]
    Publish(String),

    /// Transmitter/receiver connection fault or a failed transfer.
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// Payload exceeds the receiving site's configured limit.
    #[error("payload of {len} bytes exceeds site limit of {max}")]
    Oversize { len: u64, max: u64 },

    /// A sequence gap on a path could not be resolved within the wait
    /// window. Non-fatal; the receiver proceeds past it.
    #[error("sequence gap on {path:?}: expected {expected}, got {got}")]
    OrderingGap {
        path: PathBuf,
        expected: u64,
        got: u64,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl SyncError {
    /// Whether the owning component may transparently retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Publish(_) | SyncError::Transfer(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_io_passes_through() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = SyncError::from(io);
        match err {
            SyncError::LocalIo(inner) => {
                assert_eq!(inner.kind(), std::io::ErrorKind::NotFound)
            }
            other => panic!("expected LocalIo, got {other:?}"),
        }
    }

    #[test]
    fn retryable_classification() {
        assert!(SyncError::Publish("down".into()).is_retryable());
        assert!(SyncError::Transfer("reset".into()).is_retryable());
        assert!(!SyncError::DeprecatedOperation("open_sync").is_retryable());
    }
}
