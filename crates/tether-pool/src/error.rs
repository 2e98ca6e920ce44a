//! Error types for pool operations.

use std::time::Duration;

use thiserror::Error;

use crate::key::RequestKey;

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed foreign error carried out of connection builders.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by pool operations.
///
/// Only the borrow path ever observes these; release, invalidate, and
/// shutdown absorb every recoverable situation into accounting changes.
#[derive(Error, Debug)]
pub enum Error {
    /// Pool configuration is invalid.
    #[error("configuration error: {message}")]
    Configuration {
        /// The error message.
        message: String,
    },

    /// `borrow` was called after `shutdown`.
    #[error("connection pool is closed")]
    PoolClosed,

    /// The per-key ceiling for this key is zero.
    #[error("no connections allowed for '{key}'")]
    NoConnectionAllowed {
        /// The forbidden destination.
        key: RequestKey,
    },

    /// Parking the borrower would exceed the wait-queue bound.
    #[error("wait queue is full ({limit} waiters)")]
    WaitQueueFull {
        /// The configured queue bound.
        limit: usize,
    },

    /// The borrower aged out of the wait queue.
    #[error("timed out after {waited:?} waiting for a connection to '{key}'")]
    WaitQueueTimeout {
        /// The destination waited for.
        key: RequestKey,
        /// How long the borrower was parked.
        waited: Duration,
    },

    /// The connection builder failed.
    #[error("failed to connect to '{key}'")]
    BuildFailed {
        /// The destination being connected to.
        key: RequestKey,
        /// The builder's error.
        #[source]
        source: BoxError,
    },
}

impl Error {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Whether retrying the borrow later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::WaitQueueFull { .. } | Self::WaitQueueTimeout { .. } | Self::BuildFailed { .. }
        )
    }

    /// The destination key associated with this error, if any.
    #[must_use]
    pub fn request_key(&self) -> Option<&RequestKey> {
        match self {
            Self::Configuration { .. } | Self::PoolClosed | Self::WaitQueueFull { .. } => None,
            Self::NoConnectionAllowed { key }
            | Self::WaitQueueTimeout { key, .. }
            | Self::BuildFailed { key, .. } => Some(key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(!Error::PoolClosed.is_retryable());
        assert!(
            !Error::NoConnectionAllowed {
                key: RequestKey::http("h", 80)
            }
            .is_retryable()
        );
        assert!(Error::WaitQueueFull { limit: 4 }.is_retryable());
        assert!(
            Error::WaitQueueTimeout {
                key: RequestKey::http("h", 80),
                waited: Duration::from_secs(1),
            }
            .is_retryable()
        );
    }

    #[test]
    fn request_key_extraction() {
        let key = RequestKey::https("example.com", 443);
        let err = Error::NoConnectionAllowed { key: key.clone() };
        assert_eq!(err.request_key(), Some(&key));
        assert_eq!(Error::PoolClosed.request_key(), None);
    }

    #[test]
    fn build_failed_carries_source() {
        let err = Error::BuildFailed {
            key: RequestKey::http("h", 80),
            source: "refused".into(),
        };
        let source = std::error::Error::source(&err).expect("source attached");
        assert_eq!(source.to_string(), "refused");
    }
}
