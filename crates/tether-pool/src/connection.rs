//! Connection capabilities consumed by the pool.
//!
//! The pool is polymorphic over transports: anything implementing
//! [`Connection`] can be pooled, and a [`ConnectionBuilder`] produces new
//! ones on demand. Neither trait exposes I/O; transports and TLS live in
//! the layers that implement them.

use async_trait::async_trait;

use crate::error::BoxError;
use crate::key::RequestKey;

/// A pooled transport connection.
///
/// The pool only ever consults the connection's self-reported health; it
/// never performs I/O on it. `is_closed` and `is_recyclable` may change
/// between calls, but once the pool observes `is_closed() == true` it will
/// not offer the connection again.
pub trait Connection: Send + 'static {
    /// The destination this connection is bound to.
    fn request_key(&self) -> &RequestKey;

    /// Whether the transport is known dead.
    fn is_closed(&self) -> bool;

    /// Whether the connection is in a clean post-request state, safe to
    /// hand to another borrower.
    fn is_recyclable(&self) -> bool;

    /// Tear the transport down. Idempotent; must not block or panic.
    fn shutdown(&self);
}

/// Asynchronous connection factory.
#[async_trait]
pub trait ConnectionBuilder: Send + Sync + 'static {
    /// The connection type this builder produces.
    type Conn: Connection;

    /// Establish a fresh connection to `key`.
    ///
    /// On success the connection is healthy, never used, and reports
    /// `request_key() == key`.
    async fn build(&self, key: &RequestKey) -> std::result::Result<Self::Conn, BoxError>;
}

/// A connection handed out by [`Pool::borrow`](crate::Pool::borrow).
#[derive(Debug)]
pub struct Borrowed<C> {
    /// The connection. Hand it back with [`Pool::release`](crate::Pool::release)
    /// or [`Pool::invalidate`](crate::Pool::invalidate).
    pub conn: C,
    /// `true` when the connection was just built, `false` when recycled.
    pub fresh: bool,
}
