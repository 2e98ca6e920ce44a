//! The connection pool.
//!
//! One mutual-exclusion primitive serializes every state transition, and
//! the asynchronous work of building connections always runs outside it.
//! [`Pool::borrow`] awaits its own build inline, while builds that satisfy
//! parked waiters are spawned onto the runtime so releasers never block.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::oneshot;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::config::PoolConfig;
use crate::connection::{Borrowed, Connection, ConnectionBuilder};
use crate::error::{Error, Result};
use crate::key::RequestKey;
use crate::state::{IdleConn, PoolSnapshot, PoolState, Waiter};

struct PoolInner<B: ConnectionBuilder> {
    builder: B,
    config: PoolConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<PoolState<B::Conn>>,
}

/// What `borrow` decided to do once the lock was released.
enum Step<C> {
    Recycled(C),
    Build,
    Parked(oneshot::Receiver<Result<Borrowed<C>>>),
}

/// Client-side connection pool keyed by destination.
///
/// Hands out reusable connections per [`RequestKey`] under a global ceiling
/// and per-key ceilings, parking borrowers in a bounded wait queue when
/// neither an idle connection nor capacity is available. Cloning is cheap;
/// every clone operates on the same pool.
pub struct Pool<B: ConnectionBuilder> {
    inner: Arc<PoolInner<B>>,
}

impl<B: ConnectionBuilder> Clone for Pool<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: ConnectionBuilder> fmt::Debug for Pool<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.state();
        f.debug_struct("Pool")
            .field("closed", &snapshot.closed)
            .field("total", &snapshot.total)
            .field("waiting", &snapshot.waiting)
            .finish()
    }
}

impl<B: ConnectionBuilder> Pool<B> {
    /// Create a pool over `builder` with the system clock.
    ///
    /// # Errors
    /// Returns an error when `config` is invalid.
    pub fn new(builder: B, config: PoolConfig) -> Result<Self> {
        Self::with_clock(builder, config, Arc::new(SystemClock))
    }

    /// Create a pool with a caller-provided clock.
    pub fn with_clock(builder: B, config: PoolConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::assemble(builder, config, clock, StdRng::from_os_rng())
    }

    /// Create a pool with a caller-provided clock and a deterministic
    /// eviction RNG. Intended for tests.
    pub fn with_clock_seeded(
        builder: B,
        config: PoolConfig,
        clock: Arc<dyn Clock>,
        seed: u64,
    ) -> Result<Self> {
        Self::assemble(builder, config, clock, StdRng::seed_from_u64(seed))
    }

    fn assemble(builder: B, config: PoolConfig, clock: Arc<dyn Clock>, rng: StdRng) -> Result<Self> {
        config.validate()?;
        debug!(
            max_total = config.max_total,
            max_waiters = config.max_waiters,
            "created connection pool"
        );
        Ok(Self {
            inner: Arc::new(PoolInner {
                builder,
                config,
                clock,
                state: Mutex::new(PoolState::new(rng)),
            }),
        })
    }

    /// Borrow a connection to `key`.
    ///
    /// Resolves to a recycled idle connection when a usable one is parked,
    /// a freshly built one when capacity allows, or parks the caller in
    /// the wait queue until a releaser can serve it. When the global
    /// budget is exhausted by idle connections belonging to other keys,
    /// one of those keys is picked uniformly at random and its oldest
    /// idle connection torn down to make room.
    ///
    /// # Errors
    /// [`Error::PoolClosed`] after [`shutdown`](Self::shutdown);
    /// [`Error::NoConnectionAllowed`] when the per-key ceiling is zero;
    /// [`Error::WaitQueueFull`] when parking would exceed the queue bound;
    /// [`Error::WaitQueueTimeout`] when the parked borrow ages out;
    /// [`Error::BuildFailed`] when the builder fails.
    pub async fn borrow(&self, key: &RequestKey) -> Result<Borrowed<B::Conn>> {
        let step = {
            let now = self.inner.clock.now();
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(Error::PoolClosed);
            }
            match self.next_idle(&mut state, key, now) {
                Some(conn) => Step::Recycled(conn),
                None => self.plan_allocation(&mut state, key, now)?,
            }
        };

        match step {
            Step::Recycled(conn) => Ok(Borrowed { conn, fresh: false }),
            Step::Build => self.build_for(key).await,
            Step::Parked(rx) => rx.await.unwrap_or(Err(Error::PoolClosed)),
        }
    }

    /// Pop usable idle entries for `key`, evicting closed and expired ones.
    fn next_idle(
        &self,
        state: &mut PoolState<B::Conn>,
        key: &RequestKey,
        now: Instant,
    ) -> Option<B::Conn> {
        while let Some(entry) = state.pop_idle(key) {
            if entry.conn.is_closed() {
                state.forget(key);
                state.stats.evicted_closed += 1;
                debug!(key = %key, total = state.total, "discarding closed idle connection");
                continue;
            }
            if entry.reuse_deadline.is_some_and(|deadline| now >= deadline) {
                entry.conn.shutdown();
                state.forget(key);
                state.stats.evicted_expired += 1;
                debug!(key = %key, total = state.total, "evicting idle connection past its reuse deadline");
                continue;
            }
            state.stats.recycled += 1;
            debug!(key = %key, total = state.total, "recycling idle connection");
            return Some(entry.conn);
        }
        None
    }

    /// Decide how to serve a borrow that found no usable idle entry:
    /// reserve and build, evict a random victim to make room, or park.
    fn plan_allocation(
        &self,
        state: &mut PoolState<B::Conn>,
        key: &RequestKey,
        now: Instant,
    ) -> Result<Step<B::Conn>> {
        let config = &self.inner.config;
        let limit = config.max_per_key.limit_for(key);
        if limit == Some(0) {
            return Err(Error::NoConnectionAllowed { key: key.clone() });
        }

        loop {
            if limit.is_some_and(|l| state.allocated_for(key) >= l) {
                // Blocked by the per-key ceiling; freeing global capacity
                // would not help.
                return self.park_waiter(state, key, now);
            }
            if state.total < config.max_total {
                state.reserve(key);
                debug!(key = %key, total = state.total, "reserved capacity, building connection");
                return Ok(Step::Build);
            }
            // Global budget exhausted. If another key is hoarding idle
            // connections, evict one at random and retry.
            match state.random_idle_key() {
                Some(victim) => {
                    if let Some(entry) = state.pop_idle(&victim) {
                        entry.conn.shutdown();
                        state.forget(&victim);
                        state.stats.evicted_random += 1;
                        debug!(
                            key = %key,
                            victim = %victim,
                            total = state.total,
                            "evicted idle connection to free global capacity"
                        );
                    }
                }
                None => return self.park_waiter(state, key, now),
            }
        }
    }

    fn park_waiter(
        &self,
        state: &mut PoolState<B::Conn>,
        key: &RequestKey,
        now: Instant,
    ) -> Result<Step<B::Conn>> {
        let config = &self.inner.config;
        if state.wait.len() >= config.max_waiters {
            debug!(key = %key, limit = config.max_waiters, "wait queue full, rejecting borrower");
            return Err(Error::WaitQueueFull {
                limit: config.max_waiters,
            });
        }
        let (tx, rx) = oneshot::channel();
        state.wait.push_back(Waiter {
            key: key.clone(),
            tx,
            enqueued_at: now,
        });
        debug!(key = %key, waiting = state.wait.len(), total = state.total, "parking borrower");
        Ok(Step::Parked(rx))
    }

    /// Run the builder for a reservation made by `borrow`.
    async fn build_for(&self, key: &RequestKey) -> Result<Borrowed<B::Conn>> {
        match self.inner.builder.build(key).await {
            Ok(conn) => {
                self.inner.state.lock().stats.built += 1;
                debug!(key = %key, "built fresh connection");
                Ok(Borrowed { conn, fresh: true })
            }
            Err(source) => {
                self.dispose(key);
                Err(Error::BuildFailed {
                    key: key.clone(),
                    source,
                })
            }
        }
    }

    /// Reverse an optimistic reservation after a failed build.
    fn dispose(&self, key: &RequestKey) {
        let mut state = self.inner.state.lock();
        if state.closed {
            return;
        }
        state.forget(key);
        debug!(key = %key, total = state.total, "build failed, reservation reversed");
    }

    /// Return a borrowed connection to the pool.
    ///
    /// A recyclable connection is handed to the first live same-key
    /// waiter, or parked idle when nobody waits. When only other-key
    /// waiters exist and one of them is admissible, the connection is
    /// torn down so its capacity can be rebuilt for that waiter. A connection reporting
    /// itself closed or non-recyclable is torn down and its freed budget
    /// offered to the first admissible waiter.
    ///
    /// When the queue holds only waiters blocked by their own per-key
    /// ceiling, the connection is parked idle anyway: the blockers are
    /// per-key budgets, not global capacity, so future same-key demand
    /// can still use it. Such waiters stay queued until same-key capacity
    /// frees up or they age out.
    pub fn release(&self, conn: B::Conn) {
        let key = conn.request_key().clone();
        if conn.is_closed() || !conn.is_recyclable() {
            self.reclaim(key, conn);
            return;
        }

        let now = self.inner.clock.now();
        let waiter = {
            let mut state = self.inner.state.lock();
            if state.closed {
                conn.shutdown();
                return;
            }

            // Same-key waiters always win over parking.
            let mut conn = conn;
            loop {
                let Some(waiter) = state.take_same_key_waiter(&key, now, &self.inner.config)
                else {
                    break;
                };
                match waiter.hand_over(conn) {
                    None => {
                        state.stats.handoffs += 1;
                        debug!(key = %key, waiting = state.wait.len(), "handed connection to same-key waiter");
                        return;
                    }
                    // Waiter abandoned its receiver; take the connection
                    // back and keep scanning.
                    Some(returned) => conn = returned,
                }
            }

            if state.wait.is_empty() {
                self.park_idle(&mut state, key, conn, now);
                return;
            }

            // Only other keys are waiting. Connections are not
            // retargetable, so serving one means tearing this one down
            // and rebuilding under the waiter's key.
            match state.take_first_admissible(now, &self.inner.config) {
                Some(waiter) => {
                    conn.shutdown();
                    state.forget(&key);
                    state.reserve(&waiter.key);
                    debug!(
                        key = %key,
                        waiter_key = %waiter.key,
                        total = state.total,
                        "tearing down connection to rebuild for cross-key waiter"
                    );
                    waiter
                }
                None => {
                    self.park_idle(&mut state, key, conn, now);
                    return;
                }
            }
        };
        self.spawn_build(waiter);
    }

    /// Declare a connection unusable, even one still counted as in use.
    ///
    /// Tears the transport down if needed, releases its capacity, and
    /// offers the freed budget to the first admissible waiter. The
    /// connection is consumed: a handle can only be invalidated once, so
    /// the accounting can never be decremented twice for it.
    pub fn invalidate(&self, conn: B::Conn) {
        let key = conn.request_key().clone();
        self.reclaim(key, conn);
    }

    /// Destroy `conn`, release its capacity, and offer the freed budget
    /// to the first admissible waiter.
    fn reclaim(&self, key: RequestKey, conn: B::Conn) {
        if !conn.is_closed() {
            conn.shutdown();
        }
        let now = self.inner.clock.now();
        let waiter = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.forget(&key);
            debug!(key = %key, total = state.total, "reclaimed connection");
            match state.take_first_admissible(now, &self.inner.config) {
                Some(waiter) => {
                    state.reserve(&waiter.key);
                    debug!(key = %waiter.key, total = state.total, "rebuilding freed capacity for waiter");
                    Some(waiter)
                }
                None => None,
            }
        };
        if let Some(waiter) = waiter {
            self.spawn_build(waiter);
        }
    }

    fn park_idle(
        &self,
        state: &mut PoolState<B::Conn>,
        key: RequestKey,
        conn: B::Conn,
        now: Instant,
    ) {
        let reuse_deadline = self.inner.config.max_idle.map(|idle| now + idle);
        state.stats.parked += 1;
        debug!(key = %key, total = state.total, waiting = state.wait.len(), "parking idle connection");
        state.park(key, IdleConn {
            conn,
            reuse_deadline,
        });
    }

    /// Build a connection for `waiter` on the runtime. The reservation is
    /// already recorded; a failed build reverses it and fails the waiter.
    fn spawn_build(&self, waiter: Waiter<B::Conn>) {
        let pool = self.clone();
        tokio::spawn(async move {
            let Waiter { key, tx, .. } = waiter;
            match pool.inner.builder.build(&key).await {
                Ok(conn) => {
                    pool.inner.state.lock().stats.built += 1;
                    debug!(key = %key, "built fresh connection for waiter");
                    if let Err(rejected) = tx.send(Ok(Borrowed { conn, fresh: true })) {
                        // The waiter abandoned its receiver after we built
                        // for it; put the connection through the normal
                        // release path instead of leaking it.
                        if let Ok(borrowed) = rejected {
                            pool.release(borrowed.conn);
                        }
                    }
                }
                Err(source) => {
                    pool.dispose(&key);
                    let _ = tx.send(Err(Error::BuildFailed { key, source }));
                }
            }
        });
    }

    /// Shut the pool down. Terminal and idempotent.
    ///
    /// Idle connections are torn down, accounting is cleared, and every
    /// parked borrower fails with [`Error::PoolClosed`]. Connections
    /// currently out with borrowers are unaffected; releasing them later
    /// tears them down.
    pub fn shutdown(&self) {
        let (idle, waiters) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle: Vec<IdleConn<B::Conn>> = std::mem::take(&mut state.idle)
                .into_values()
                .flatten()
                .collect();
            state.allocated.clear();
            state.total = 0;
            let waiters: Vec<Waiter<B::Conn>> = state.wait.drain(..).collect();
            debug!(idle = idle.len(), waiting = waiters.len(), "shutting down connection pool");
            (idle, waiters)
        };
        for entry in idle {
            if !entry.conn.is_closed() {
                entry.conn.shutdown();
            }
        }
        for waiter in waiters {
            let _ = waiter.tx.send(Err(Error::PoolClosed));
        }
    }

    /// A point-in-time snapshot of pool counts.
    ///
    /// Purely observational; the pool may change the moment the internal
    /// lock is released.
    #[must_use]
    pub fn state(&self) -> PoolSnapshot {
        self.inner.state.lock().snapshot()
    }

    /// Whether the pool has been shut down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PerKeyLimit;
    use crate::testing::MockBuilder;

    fn key() -> RequestKey {
        RequestKey::https("example.com", 443)
    }

    fn small_config() -> PoolConfig {
        PoolConfig {
            max_total: 2,
            max_idle: None,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn fresh_then_recycled() {
        let builder = MockBuilder::new();
        let pool = Pool::new(builder.clone(), small_config()).unwrap();

        let first = pool.borrow(&key()).await.unwrap();
        assert!(first.fresh);
        let original = first.conn.clone();
        pool.release(first.conn);

        let second = pool.borrow(&key()).await.unwrap();
        assert!(!second.fresh);
        assert!(second.conn.same_as(&original));
        assert_eq!(builder.builds(), 1);
    }

    #[tokio::test]
    async fn forbidden_key_is_rejected() {
        let config = PoolConfig {
            max_per_key: PerKeyLimit::uniform(0),
            ..small_config()
        };
        let pool = Pool::new(MockBuilder::new(), config).unwrap();

        let err = pool.borrow(&key()).await.unwrap_err();
        assert!(matches!(err, Error::NoConnectionAllowed { .. }));
        assert_eq!(pool.state().total, 0);
    }

    #[tokio::test]
    async fn build_failure_reverses_reservation() {
        let builder = MockBuilder::failing_calls(0b1);
        let pool = Pool::new(builder.clone(), small_config()).unwrap();

        let err = pool.borrow(&key()).await.unwrap_err();
        assert!(matches!(err, Error::BuildFailed { .. }));
        assert_eq!(pool.state().total, 0);

        // The budget is free again and the next build succeeds.
        let got = pool.borrow(&key()).await.unwrap();
        assert!(got.fresh);
        assert_eq!(pool.state().total, 1);
    }

    #[tokio::test]
    async fn non_recyclable_release_shrinks_the_pool() {
        let pool = Pool::new(MockBuilder::new(), small_config()).unwrap();

        let conn = pool.borrow(&key()).await.unwrap().conn;
        let observer = conn.clone();
        conn.set_recyclable(false);
        pool.release(conn);

        assert!(observer.is_closed());
        let state = pool.state();
        assert_eq!(state.total, 0);
        assert!(state.idle.is_empty());
    }

    #[tokio::test]
    async fn invalidate_releases_capacity() {
        let pool = Pool::new(MockBuilder::new(), small_config()).unwrap();

        let conn = pool.borrow(&key()).await.unwrap().conn;
        let observer = conn.clone();
        pool.invalidate(conn);

        assert!(observer.is_closed());
        assert_eq!(observer.shutdowns(), 1);
        assert_eq!(pool.state().total, 0);
    }

    #[tokio::test]
    async fn snapshot_reflects_counts() {
        let pool = Pool::new(MockBuilder::new(), small_config()).unwrap();

        let held = pool.borrow(&key()).await.unwrap().conn;
        let parked = pool.borrow(&key()).await.unwrap().conn;
        pool.release(parked);

        let state = pool.state();
        assert!(!state.closed);
        assert_eq!(state.total, 2);
        assert_eq!(state.allocated.get(&key()), Some(&2));
        assert_eq!(state.idle.get(&key()), Some(&1));
        assert_eq!(state.waiting, 0);
        assert_eq!(state.stats.built, 2);
        assert_eq!(state.stats.parked, 1);
        drop(held);
    }
}
