//! Test doubles for pool consumers.
//!
//! [`MockConnection`] reports whatever health flags the test sets, and
//! [`MockBuilder`] produces them with scriptable failures. Both share
//! their state across clones so a test can keep observing a connection
//! after handing ownership to the pool.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::connection::{Connection, ConnectionBuilder};
use crate::error::BoxError;
use crate::key::RequestKey;

#[derive(Debug)]
struct MockShared {
    key: RequestKey,
    closed: AtomicBool,
    recyclable: AtomicBool,
    shutdowns: AtomicU32,
}

/// A connection whose health is controlled by the test.
///
/// Clones share state: keep one before releasing to the pool and use it
/// to flip flags or observe teardown.
#[derive(Debug, Clone)]
pub struct MockConnection {
    inner: Arc<MockShared>,
}

impl MockConnection {
    /// A healthy, recyclable connection for `key`.
    pub fn new(key: RequestKey) -> Self {
        Self {
            inner: Arc::new(MockShared {
                key,
                closed: AtomicBool::new(false),
                recyclable: AtomicBool::new(true),
                shutdowns: AtomicU32::new(0),
            }),
        }
    }

    /// Simulate the remote end closing the transport.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    /// Mark the connection clean or dirty for reuse.
    pub fn set_recyclable(&self, recyclable: bool) {
        self.inner.recyclable.store(recyclable, Ordering::SeqCst);
    }

    /// How many times the pool called `shutdown`.
    pub fn shutdowns(&self) -> u32 {
        self.inner.shutdowns.load(Ordering::SeqCst)
    }

    /// Whether two handles refer to the same connection.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Connection for MockConnection {
    fn request_key(&self) -> &RequestKey {
        &self.inner.key
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn is_recyclable(&self) -> bool {
        self.inner.recyclable.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        self.inner.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.inner.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct BuilderShared {
    calls: AtomicUsize,
    /// Bitmask: if bit N is set, call N fails (0-indexed).
    fail_mask: u32,
    produced: Mutex<Vec<MockConnection>>,
}

/// Builder producing [`MockConnection`]s, with scriptable failures.
///
/// Clones share state so tests can inspect build activity after moving
/// the builder into a pool.
#[derive(Debug, Clone)]
pub struct MockBuilder {
    inner: Arc<BuilderShared>,
}

impl MockBuilder {
    /// A builder that always succeeds.
    pub fn new() -> Self {
        Self::failing_calls(0)
    }

    /// A builder that fails call N for every set bit N in `mask`.
    pub fn failing_calls(mask: u32) -> Self {
        Self {
            inner: Arc::new(BuilderShared {
                calls: AtomicUsize::new(0),
                fail_mask: mask,
                produced: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Total build attempts, failures included.
    pub fn builds(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// Connections produced so far, in build order.
    pub fn produced(&self) -> Vec<MockConnection> {
        self.inner.produced.lock().clone()
    }
}

impl Default for MockBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionBuilder for MockBuilder {
    type Conn = MockConnection;

    async fn build(&self, key: &RequestKey) -> Result<MockConnection, BoxError> {
        let n = self.inner.calls.fetch_add(1, Ordering::SeqCst);
        if n < 32 && self.inner.fail_mask & (1 << n) != 0 {
            return Err(format!("scripted failure on build {n}").into());
        }
        let conn = MockConnection::new(key.clone());
        self.inner.produced.lock().push(conn.clone());
        Ok(conn)
    }
}
