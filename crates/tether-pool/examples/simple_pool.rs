//! Simple pooling example
//!
//! Implements a toy in-memory transport and drives it through the pool:
//! borrow, recycle, and per-key accounting.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tether_pool::{
    BoxError, Connection, ConnectionBuilder, PerKeyLimit, Pool, PoolConfig, RequestKey,
};

/// Toy connection that pretends to hold a transport.
#[derive(Clone)]
struct DemoConnection {
    inner: Arc<DemoInner>,
}

struct DemoInner {
    key: RequestKey,
    serial: usize,
    closed: AtomicBool,
}

impl Connection for DemoConnection {
    fn request_key(&self) -> &RequestKey {
        &self.inner.key
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn is_recyclable(&self) -> bool {
        true
    }

    fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }
}

/// Builder that simulates a handshake with a short sleep.
struct DemoBuilder {
    serial: AtomicUsize,
}

#[async_trait]
impl ConnectionBuilder for DemoBuilder {
    type Conn = DemoConnection;

    async fn build(&self, key: &RequestKey) -> Result<DemoConnection, BoxError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(DemoConnection {
            inner: Arc::new(DemoInner {
                key: key.clone(),
                serial: self.serial.fetch_add(1, Ordering::SeqCst),
                closed: AtomicBool::new(false),
            }),
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Connection Pool Example ===\n");

    let config = PoolConfig {
        max_total: 8,
        max_per_key: PerKeyLimit::uniform(4),
        max_waiters: 16,
        max_idle: Some(Duration::from_secs(30)),
        ..Default::default()
    };
    let pool = Pool::new(
        DemoBuilder {
            serial: AtomicUsize::new(0),
        },
        config,
    )?;

    let api = RequestKey::https("api.example.com", 443);
    let cdn = RequestKey::https("cdn.example.com", 443);

    println!("Borrowing from two endpoints...");
    let a = pool.borrow(&api).await?;
    let b = pool.borrow(&cdn).await?;
    println!("  api -> connection #{} (fresh: {})", a.conn.inner.serial, a.fresh);
    println!("  cdn -> connection #{} (fresh: {})\n", b.conn.inner.serial, b.fresh);

    println!("Releasing and borrowing api again...");
    pool.release(a.conn);
    let again = pool.borrow(&api).await?;
    println!(
        "  api -> connection #{} (fresh: {})\n",
        again.conn.inner.serial, again.fresh
    );

    let state = pool.state();
    println!("Pool state:");
    println!("  - Total: {}", state.total);
    println!("  - Built: {}", state.stats.built);
    println!("  - Recycled: {}", state.stats.recycled);

    pool.release(again.conn);
    pool.release(b.conn);
    pool.shutdown();

    println!("\n=== Example completed! ===");
    Ok(())
}
