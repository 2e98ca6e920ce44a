//! Terminal shutdown semantics.

use std::time::Duration;

use tether_pool::testing::MockBuilder;
use tether_pool::{Connection, Error, Pool, PoolConfig, RequestKey};

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

fn key() -> RequestKey {
    RequestKey::https("alpha.example", 443)
}

fn config() -> PoolConfig {
    PoolConfig {
        max_total: 2,
        max_waiters: 2,
        max_idle: None,
        ..Default::default()
    }
}

/// Poll `cond` until it holds, or panic after ~1s.
async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 1s");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn borrow_after_shutdown_fails() {
    let pool = Pool::new(MockBuilder::new(), config()).unwrap();
    pool.shutdown();

    assert!(pool.is_closed());
    assert!(matches!(
        pool.borrow(&key()).await.unwrap_err(),
        Error::PoolClosed
    ));
}

#[tokio::test]
async fn shutdown_tears_down_idle_and_clears_counts() {
    let pool = Pool::new(MockBuilder::new(), config()).unwrap();

    let conn = pool.borrow(&key()).await.unwrap().conn;
    let observer = conn.clone();
    pool.release(conn);
    assert_eq!(pool.state().idle.get(&key()), Some(&1));

    pool.shutdown();

    assert!(observer.is_closed());
    assert_eq!(observer.shutdowns(), 1);

    let state = pool.state();
    assert!(state.closed);
    assert_eq!(state.total, 0);
    assert!(state.allocated.is_empty());
    assert!(state.idle.is_empty());
    assert_eq!(state.waiting, 0);
}

#[tokio::test]
async fn shutdown_fails_parked_waiters() {
    let pool = Pool::new(
        MockBuilder::new(),
        PoolConfig {
            max_total: 1,
            ..config()
        },
    )
    .unwrap();

    let held = pool.borrow(&key()).await.unwrap().conn;
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.borrow(&key()).await })
    };
    wait_for(|| pool.state().waiting == 1).await;

    pool.shutdown();

    assert!(matches!(
        waiter.await.unwrap().unwrap_err(),
        Error::PoolClosed
    ));
    drop(held);
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let pool = Pool::new(MockBuilder::new(), config()).unwrap();

    let conn = pool.borrow(&key()).await.unwrap().conn;
    pool.release(conn);

    pool.shutdown();
    pool.shutdown();

    assert!(pool.is_closed());
    assert_eq!(pool.state().total, 0);
}

#[tokio::test]
async fn release_after_shutdown_tears_down_the_connection() {
    let pool = Pool::new(MockBuilder::new(), config()).unwrap();

    let conn = pool.borrow(&key()).await.unwrap().conn;
    let observer = conn.clone();
    pool.shutdown();

    // The borrower comes back after the pool is gone; its connection is
    // torn down rather than parked.
    pool.release(conn);

    assert!(observer.is_closed());
    let state = pool.state();
    assert_eq!(state.total, 0);
    assert!(state.idle.is_empty());
}

#[tokio::test]
async fn invalidate_after_shutdown_is_harmless() {
    let pool = Pool::new(MockBuilder::new(), config()).unwrap();

    let conn = pool.borrow(&key()).await.unwrap().conn;
    let observer = conn.clone();
    pool.shutdown();
    pool.invalidate(conn);

    assert!(observer.is_closed());
    assert_eq!(pool.state().total, 0);
}
