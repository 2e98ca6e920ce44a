//! Pool configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::key::RequestKey;

/// Per-key connection ceiling.
///
/// `Some(0)` forbids a key outright; `None` means unbounded.
#[derive(Clone)]
pub enum PerKeyLimit {
    /// The same ceiling for every key.
    Uniform(Option<usize>),
    /// Ceiling computed per key.
    PerKey(Arc<dyn Fn(&RequestKey) -> Option<usize> + Send + Sync>),
}

impl PerKeyLimit {
    /// No per-key ceiling.
    pub fn unbounded() -> Self {
        Self::Uniform(None)
    }

    /// The same ceiling for every key.
    pub fn uniform(limit: usize) -> Self {
        Self::Uniform(Some(limit))
    }

    /// Ceiling computed by `f`; return `Some(0)` to forbid a key.
    pub fn per_key<F>(f: F) -> Self
    where
        F: Fn(&RequestKey) -> Option<usize> + Send + Sync + 'static,
    {
        Self::PerKey(Arc::new(f))
    }

    /// The ceiling for `key`, `None` when unbounded.
    pub fn limit_for(&self, key: &RequestKey) -> Option<usize> {
        match self {
            Self::Uniform(limit) => *limit,
            Self::PerKey(f) => f(key),
        }
    }
}

impl Default for PerKeyLimit {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl fmt::Debug for PerKeyLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uniform(limit) => f.debug_tuple("Uniform").field(limit).finish(),
            Self::PerKey(_) => f.debug_tuple("PerKey").field(&"..").finish(),
        }
    }
}

/// Configuration for the connection pool.
///
/// `None` means "infinite" for every optional duration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Global ceiling on connections (idle + in-use + in-flight builds).
    pub max_total: usize,
    /// Per-key ceiling on connections.
    pub max_per_key: PerKeyLimit,
    /// Ceiling on parked borrowers; `borrow` fails with
    /// [`Error::WaitQueueFull`] rather than exceed it.
    pub max_waiters: usize,
    /// Response-header timeout. Used only to age parked borrowers.
    pub response_header_timeout: Option<Duration>,
    /// Whole-request timeout. Used only to age parked borrowers.
    pub request_timeout: Option<Duration>,
    /// How long a parked idle connection stays reusable.
    pub max_idle: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: 32,
            max_per_key: PerKeyLimit::unbounded(),
            max_waiters: 64,
            response_header_timeout: None,
            request_timeout: None,
            max_idle: Some(Duration::from_secs(90)),
        }
    }
}

impl PoolConfig {
    /// Validate the configuration, returning an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.max_total == 0 {
            return Err(Error::configuration("max_total must be greater than 0"));
        }
        Ok(())
    }

    /// How long a borrower may stay parked: the smaller finite of the two
    /// timeouts, `None` when both are infinite.
    pub(crate) fn waiter_ttl(&self) -> Option<Duration> {
        match (self.response_header_timeout, self.request_timeout) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}
