//! The protected pool record.
//!
//! Everything here sits behind the single pool lock; methods assume the
//! caller holds it and never block or perform I/O. Tearing a connection
//! down is the one side effect, and [`Connection::shutdown`] is required
//! to be synchronous and non-blocking.
//!
//! [`Connection::shutdown`]: crate::connection::Connection::shutdown

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Instant;

use rand::rngs::StdRng;
use rand::Rng;
use tokio::sync::oneshot;
use tracing::debug;

use crate::config::PoolConfig;
use crate::connection::Borrowed;
use crate::error::Error;
use crate::key::RequestKey;

/// An idle entry parked in the pool.
pub(crate) struct IdleConn<C> {
    pub(crate) conn: C,
    /// Instant after which this entry must not be handed out.
    pub(crate) reuse_deadline: Option<Instant>,
}

/// A parked borrower.
pub(crate) struct Waiter<C> {
    pub(crate) key: RequestKey,
    pub(crate) tx: oneshot::Sender<Result<Borrowed<C>, Error>>,
    pub(crate) enqueued_at: Instant,
}

impl<C> Waiter<C> {
    /// Hand `conn` to this waiter as a recycled connection. Returns the
    /// connection back when the waiter has abandoned its receiver.
    pub(crate) fn hand_over(self, conn: C) -> Option<C> {
        match self.tx.send(Ok(Borrowed { conn, fresh: false })) {
            Ok(()) => None,
            Err(rejected) => rejected.ok().map(|borrowed| borrowed.conn),
        }
    }
}

/// Cumulative counters. Advisory only; see [`PoolSnapshot`].
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Connections produced by the builder.
    pub built: u64,
    /// Idle entries handed back out.
    pub recycled: u64,
    /// Connections parked idle at release.
    pub parked: u64,
    /// Connections handed directly to a same-key waiter.
    pub handoffs: u64,
    /// Idle entries discarded because the transport was closed.
    pub evicted_closed: u64,
    /// Idle entries torn down past their reuse deadline.
    pub evicted_expired: u64,
    /// Idle entries torn down to free global capacity for another key.
    pub evicted_random: u64,
    /// Waiters failed by aging.
    pub timed_out_waiters: u64,
}

/// Point-in-time view of the pool, returned by
/// [`Pool::state`](crate::Pool::state).
#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    /// Whether the pool has been shut down.
    pub closed: bool,
    /// Connections currently allocated (idle + in-use + in-flight builds).
    pub total: usize,
    /// Per-key allocation counts. Keys with a zero count are absent.
    pub allocated: HashMap<RequestKey, usize>,
    /// Per-key idle queue depths. Keys with no idle entries are absent.
    pub idle: HashMap<RequestKey, usize>,
    /// Parked borrowers.
    pub waiting: usize,
    /// Cumulative counters.
    pub stats: PoolStats,
}

pub(crate) struct PoolState<C> {
    pub(crate) closed: bool,
    pub(crate) total: usize,
    pub(crate) allocated: HashMap<RequestKey, usize>,
    /// Ordered so victim selection is reproducible under a seeded RNG.
    pub(crate) idle: BTreeMap<RequestKey, VecDeque<IdleConn<C>>>,
    pub(crate) wait: VecDeque<Waiter<C>>,
    pub(crate) rng: StdRng,
    pub(crate) stats: PoolStats,
}

impl<C> PoolState<C> {
    pub(crate) fn new(rng: StdRng) -> Self {
        Self {
            closed: false,
            total: 0,
            allocated: HashMap::new(),
            idle: BTreeMap::new(),
            wait: VecDeque::new(),
            rng,
            stats: PoolStats::default(),
        }
    }

    /// Record one allocation for `key`.
    pub(crate) fn reserve(&mut self, key: &RequestKey) {
        self.total += 1;
        *self.allocated.entry(key.clone()).or_insert(0) += 1;
    }

    /// Drop one allocation for `key`. No-op when the key has none.
    pub(crate) fn forget(&mut self, key: &RequestKey) {
        if let Some(count) = self.allocated.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                self.allocated.remove(key);
            }
            self.total -= 1;
        }
    }

    pub(crate) fn allocated_for(&self, key: &RequestKey) -> usize {
        self.allocated.get(key).copied().unwrap_or(0)
    }

    /// Whether `key` has room under its per-key ceiling.
    pub(crate) fn key_has_room(&self, key: &RequestKey, config: &PoolConfig) -> bool {
        match config.max_per_key.limit_for(key) {
            None => true,
            Some(limit) => self.allocated_for(key) < limit,
        }
    }

    /// Park an idle entry at the back of `key`'s queue.
    pub(crate) fn park(&mut self, key: RequestKey, entry: IdleConn<C>) {
        self.idle.entry(key).or_default().push_back(entry);
    }

    /// Pop the head idle entry for `key`, dropping the queue when emptied.
    pub(crate) fn pop_idle(&mut self, key: &RequestKey) -> Option<IdleConn<C>> {
        let queue = self.idle.get_mut(key)?;
        let entry = queue.pop_front();
        if queue.is_empty() {
            self.idle.remove(key);
        }
        entry
    }

    /// Uniformly pick a key that currently owns idle entries.
    pub(crate) fn random_idle_key(&mut self) -> Option<RequestKey> {
        if self.idle.is_empty() {
            return None;
        }
        let victim = self.rng.random_range(0..self.idle.len());
        self.idle.keys().nth(victim).cloned()
    }

    fn waiter_expired(waiter: &Waiter<C>, now: Instant, config: &PoolConfig) -> bool {
        match config.waiter_ttl() {
            Some(ttl) => now.duration_since(waiter.enqueued_at) > ttl,
            None => false,
        }
    }

    /// Fail `waiter` with `WaitQueueTimeout`.
    fn expire_waiter(&mut self, waiter: Waiter<C>, now: Instant) {
        self.stats.timed_out_waiters += 1;
        let waited = now.duration_since(waiter.enqueued_at);
        debug!(key = %waiter.key, ?waited, "expiring waiter");
        let Waiter { key, tx, .. } = waiter;
        let _ = tx.send(Err(Error::WaitQueueTimeout { key, waited }));
    }

    /// Remove and return the first waiter for `key` that is still live,
    /// failing expired same-key waiters encountered on the way.
    pub(crate) fn take_same_key_waiter(
        &mut self,
        key: &RequestKey,
        now: Instant,
        config: &PoolConfig,
    ) -> Option<Waiter<C>> {
        loop {
            let idx = self.wait.iter().position(|w| w.key == *key)?;
            let waiter = self.wait.remove(idx)?;
            if Self::waiter_expired(&waiter, now, config) {
                self.expire_waiter(waiter, now);
                continue;
            }
            return Some(waiter);
        }
    }

    /// Remove and return the first waiter the pool can build for right now.
    ///
    /// Sweeps the expired prefix of the queue first, failing each entry,
    /// then picks the first waiter whose per-key count is below its
    /// ceiling. Waiters blocked by their own ceiling stay queued.
    pub(crate) fn take_first_admissible(
        &mut self,
        now: Instant,
        config: &PoolConfig,
    ) -> Option<Waiter<C>> {
        while let Some(front) = self.wait.front() {
            if !Self::waiter_expired(front, now, config) {
                break;
            }
            let Some(waiter) = self.wait.pop_front() else {
                break;
            };
            self.expire_waiter(waiter, now);
        }
        let idx = self
            .wait
            .iter()
            .position(|w| self.key_has_room(&w.key, config))?;
        self.wait.remove(idx)
    }

    pub(crate) fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            closed: self.closed,
            total: self.total,
            allocated: self.allocated.clone(),
            idle: self
                .idle
                .iter()
                .map(|(key, queue)| (key.clone(), queue.len()))
                .collect(),
            waiting: self.wait.len(),
            stats: self.stats.clone(),
        }
    }
}
