//! Bounded connection pool
//!
//! Acquisition waits (up to a timeout) for a free slot instead of failing
//! immediately, so an exhausted pool applies backpressure. A connection is
//! handed back by its guard's `Drop`, which runs on every exit path.

use crate::error::{BiError, Result};
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

type Connector<C> = Box<dyn Fn() -> Result<C> + Send + Sync>;

struct PoolInner<C> {
    idle: Mutex<Vec<C>>,
    permits: Arc<Semaphore>,
    size: usize,
    acquire_timeout: Duration,
    connect: Connector<C>,
}

pub struct BoundedPool<C: Send + 'static> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Send + 'static> Clone for BoundedPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Send + 'static> BoundedPool<C> {
    pub fn new<F>(size: usize, acquire_timeout: Duration, connect: F) -> Self
    where
        F: Fn() -> Result<C> + Send + Sync + 'static,
    {
        let size = size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(Vec::with_capacity(size)),
                permits: Arc::new(Semaphore::new(size)),
                size,
                acquire_timeout,
                connect: Box::new(connect),
            }),
        }
    }

    /// Wait for a slot, then reuse an idle connection or open a new one.
    pub async fn acquire(&self) -> Result<PooledConnection<C>> {
        let permit = tokio::time::timeout(
            self.inner.acquire_timeout,
            Arc::clone(&self.inner.permits).acquire_owned(),
        )
        .await
        .map_err(|_| {
            BiError::Connection(format!(
                "no pooled connection became available within {:?}",
                self.inner.acquire_timeout
            ))
        })?
        .map_err(|_| BiError::Connection("connection pool is closed".to_string()))?;

        let reused = self.inner.idle.lock().pop();
        let conn = match reused {
            Some(conn) => conn,
            None => {
                debug!("Opening new pooled connection");
                (self.inner.connect)()?
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            discard: false,
            _permit: permit,
        })
    }

    /// Close every idle connection. Checked-out connections return normally.
    pub fn drain(&self) -> usize {
        let mut idle = self.inner.idle.lock();
        let count = idle.len();
        idle.clear();
        count
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    pub fn available_slots(&self) -> usize {
        self.inner.permits.available_permits()
    }
}

/// A checked-out connection. Returned to the pool on drop unless discarded.
pub struct PooledConnection<C: Send + 'static> {
    conn: Option<C>,
    pool: Arc<PoolInner<C>>,
    discard: bool,
    _permit: OwnedSemaphorePermit,
}

impl<C: Send + 'static> PooledConnection<C> {
    /// Do not return this connection to the pool (e.g. after a broken session).
    pub fn discard(&mut self) {
        self.discard = true;
    }
}

impl<C: Send + 'static> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.conn.as_ref().expect("pooled connection is present until drop")
    }
}

impl<C: Send + 'static> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().expect("pooled connection is present until drop")
    }
}

impl<C: Send + 'static> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !self.discard {
                self.pool.idle.lock().push(conn);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_pool(size: usize, timeout_ms: u64) -> (BoundedPool<usize>, Arc<AtomicUsize>) {
        let opened = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&opened);
        let pool = BoundedPool::new(size, Duration::from_millis(timeout_ms), move || {
            Ok(counter.fetch_add(1, Ordering::SeqCst))
        });
        (pool, opened)
    }

    #[tokio::test]
    async fn test_connections_are_reused() {
        let (pool, opened) = counting_pool(2, 100);
        {
            let conn = pool.acquire().await.unwrap();
            assert_eq!(*conn, 0);
        }
        let conn = pool.acquire().await.unwrap();
        assert_eq!(*conn, 0);
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_pool_times_out_with_connection_error() {
        let (pool, _) = counting_pool(1, 50);
        let _held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, BiError::Connection(_)));
    }

    #[tokio::test]
    async fn test_waiter_gets_released_slot() {
        let (pool, _) = counting_pool(1, 1_000);
        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|c| *c) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        assert_eq!(waiter.await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_discarded_connection_is_not_returned() {
        let (pool, opened) = counting_pool(1, 100);
        {
            let mut conn = pool.acquire().await.unwrap();
            conn.discard();
        }
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.available_slots(), 1);
        let conn = pool.acquire().await.unwrap();
        assert_eq!(*conn, 1);
        assert_eq!(opened.load(Ordering::SeqCst), 2);
    }
}
