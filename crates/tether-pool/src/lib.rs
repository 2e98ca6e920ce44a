//! # tether-pool
//!
//! Client-side HTTP connection pooling: a concurrent broker that hands
//! out reusable transport connections keyed by destination endpoint,
//! under a global ceiling, per-key ceilings, and a bounded wait queue.
//!
//! The pool does not own sockets, parse HTTP, retry, or schedule
//! timeouts. It brokers [`Connection`] capabilities produced by a
//! [`ConnectionBuilder`]; transports, framing, and TLS live in the
//! layers implementing those traits. Every pool operation funnels
//! through a single lock, and connection builds always run outside it.
//!
//! A borrower calls [`Pool::borrow`] and gets back a [`Borrowed`]
//! connection: recycled from the idle set when possible, freshly built
//! when capacity allows, otherwise parked in a bounded wait queue until
//! a releaser can serve it. Hand connections back with
//! [`Pool::release`], or [`Pool::invalidate`] when a connection must be
//! destroyed (cancellation, protocol corruption).

pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod key;
pub mod pool;
mod state;
pub mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{PerKeyLimit, PoolConfig};
pub use connection::{Borrowed, Connection, ConnectionBuilder};
pub use error::{BoxError, Error, Result};
pub use key::RequestKey;
pub use pool::Pool;
pub use state::{PoolSnapshot, PoolStats};
