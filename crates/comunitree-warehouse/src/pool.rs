//! Bounded connection pool for non-interactive credentials

use crate::driver::{Connection, Driver};
use crate::error::{Result, WarehouseError};
use comunitree_core::{ConnectionConfig, PoolOptions};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Snapshot of pool utilization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub idle: usize,
    pub active: usize,
    pub waiting: usize,
    pub max: usize,
    /// Sessions opened over the pool's lifetime
    pub created: usize,
}

struct IdleConnection {
    connection: Arc<dyn Connection>,
    returned_at: Instant,
}

/// Pool of sessions opened with one configuration generation
///
/// Connections are created lazily through the driver, validated with
/// [`Connection::is_closed`] before reuse and handed back when the
/// [`PooledConnection`] guard drops.
pub struct ConnectionPool {
    config: Arc<ConnectionConfig>,
    driver: Arc<dyn Driver>,
    options: PoolOptions,
    idle: Mutex<VecDeque<IdleConnection>>,
    semaphore: Arc<Semaphore>,
    active_count: AtomicUsize,
    waiting_count: AtomicUsize,
    created_count: AtomicUsize,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(config: Arc<ConnectionConfig>, driver: Arc<dyn Driver>) -> Self {
        let options = config.pool;
        Self {
            semaphore: Arc::new(Semaphore::new(options.max_connections)),
            config,
            driver,
            options,
            idle: Mutex::new(VecDeque::new()),
            active_count: AtomicUsize::new(0),
            waiting_count: AtomicUsize::new(0),
            created_count: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &Arc<ConnectionConfig> {
        &self.config
    }

    /// Check out a connection, waiting up to the acquire timeout for a slot
    pub async fn get(&self) -> Result<PooledConnection<'_>> {
        let waiting = WaitingGuard::enter(&self.waiting_count);
        let result = tokio::time::timeout(self.options.acquire_timeout, self.acquire()).await;
        drop(waiting);

        match result {
            Ok(conn) => conn,
            Err(_) => Err(WarehouseError::Timeout(format!(
                "no pooled connection available within {:?} (max {})",
                self.options.acquire_timeout, self.options.max_connections
            ))),
        }
    }

    async fn acquire(&self) -> Result<PooledConnection<'_>> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| WarehouseError::Pool("pool has been shut down".to_string()))?;

        let connection = match self.try_get_idle().await {
            Some(conn) => conn,
            None => {
                let conn = self.driver.connect(&self.config).await?;
                let created = self.created_count.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::debug!(
                    driver = self.driver.name(),
                    generation = self.config.generation,
                    created,
                    "opened pooled connection"
                );
                conn
            }
        };

        self.active_count.fetch_add(1, Ordering::SeqCst);
        Ok(PooledConnection {
            connection,
            pool: self,
            _permit: permit,
        })
    }

    async fn try_get_idle(&self) -> Option<Arc<dyn Connection>> {
        loop {
            let (entry, remaining) = {
                let mut idle = self.idle.lock();
                let entry = idle.pop_front();
                (entry, idle.len())
            };
            let entry = entry?;

            if entry.connection.is_closed() {
                tracing::debug!("discarding closed idle connection");
                continue;
            }

            // connections beyond the minimum expire after sitting idle
            if remaining >= self.options.min_connections
                && entry.returned_at.elapsed() > self.options.idle_timeout
            {
                entry.connection.close().await;
                continue;
            }

            return Some(entry.connection);
        }
    }

    fn return_connection(&self, connection: Arc<dyn Connection>) {
        self.active_count.fetch_sub(1, Ordering::SeqCst);

        if connection.is_closed() {
            tracing::debug!("dropping closed connection instead of returning it");
            return;
        }

        if self.closed.load(Ordering::SeqCst) {
            // pool was retired while this connection was out
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { connection.close().await });
            }
            return;
        }

        self.idle.lock().push_back(IdleConnection {
            connection,
            returned_at: Instant::now(),
        });
    }

    /// Check out a connection, run `f`, and give the connection back
    /// whether `f` succeeds or fails.
    pub async fn use_connection<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn Connection>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let conn = self.get().await?;
        let result = f(Arc::clone(conn.inner())).await;
        drop(conn);
        result
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.idle.lock().len(),
            active: self.active_count.load(Ordering::SeqCst),
            waiting: self.waiting_count.load(Ordering::SeqCst),
            max: self.options.max_connections,
            created: self.created_count.load(Ordering::SeqCst),
        }
    }

    /// Close all idle connections
    pub async fn close_idle(&self) {
        let drained: Vec<_> = self.idle.lock().drain(..).collect();
        for entry in drained {
            entry.connection.close().await;
        }
    }

    /// Retire the pool: refuse new checkouts, close idle sessions now and
    /// checked-out ones as they come back.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.semaphore.close();
        self.close_idle().await;
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Counts a caller as waiting until dropped, including when the `get`
/// future itself is cancelled
struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A connection borrowed from the pool, returned on drop
pub struct PooledConnection<'a> {
    connection: Arc<dyn Connection>,
    pool: &'a ConnectionPool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection<'_> {
    pub fn inner(&self) -> &Arc<dyn Connection> {
        &self.connection
    }
}

impl Deref for PooledConnection<'_> {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.connection.as_ref()
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        self.pool.return_connection(Arc::clone(&self.connection));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDriver;
    use comunitree_core::{keys, ConfigBuilder, MapSource};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn pool_with(driver: &MockDriver, max: usize, acquire_ms: u64) -> ConnectionPool {
        let mut config = ConfigBuilder::new(
            MapSource::new()
                .with(keys::ACCOUNT, "acct")
                .with(keys::USERNAME, "svc")
                .with(keys::PASSWORD, "pw")
                .with(keys::POOL_MAX, max.to_string()),
        )
        .build();
        config.pool.acquire_timeout = Duration::from_millis(acquire_ms);
        ConnectionPool::new(Arc::new(config), Arc::new(driver.clone()))
    }

    #[tokio::test]
    async fn test_pool_reuses_returned_connection() {
        let driver = MockDriver::new();
        let pool = pool_with(&driver, 4, 1000);

        pool.use_connection(|c| async move { c.execute("SELECT 1", None).await })
            .await
            .unwrap();
        pool.use_connection(|c| async move { c.execute("SELECT 2", None).await })
            .await
            .unwrap();

        assert_eq!(driver.connect_count(), 1);
        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.created, 1);
    }

    #[tokio::test]
    async fn test_cancelled_wait_is_not_counted() {
        let driver = MockDriver::new();
        let pool = pool_with(&driver, 1, 5_000);

        let held = pool.get().await.unwrap();
        let abandoned = tokio::time::timeout(Duration::from_millis(50), pool.get()).await;
        assert!(abandoned.is_err());
        assert_eq!(pool.stats().waiting, 0);

        drop(held);
        assert_eq!(pool.stats().active, 0);
    }

    #[tokio::test]
    async fn test_pool_returns_connection_after_failure() {
        let driver = MockDriver::new();
        driver
            .add_error("BROKEN", WarehouseError::Query("syntax error".into()))
            .await;
        let pool = pool_with(&driver, 1, 200);

        let result = pool
            .use_connection(|c| async move { c.execute("SELECT BROKEN", None).await })
            .await;
        assert!(matches!(result, Err(WarehouseError::Query(_))));

        // the single slot was released, so this does not time out
        pool.use_connection(|c| async move { c.execute("SELECT 1", None).await })
            .await
            .unwrap();
        assert_eq!(pool.stats().active, 0);
        assert_eq!(driver.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_pool_skips_dead_idle_connection() {
        let driver = MockDriver::new();
        let pool = pool_with(&driver, 2, 1000);

        pool.use_connection(|c| async move { c.execute("SELECT 1", None).await })
            .await
            .unwrap();
        driver.kill_sessions();
        pool.use_connection(|c| async move { c.execute("SELECT 1", None).await })
            .await
            .unwrap();

        assert_eq!(driver.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_pool_times_out_when_exhausted() {
        let driver = MockDriver::new();
        let pool = pool_with(&driver, 1, 50);

        let held = pool.get().await.unwrap();
        let result = pool.get().await;
        assert!(matches!(result, Err(WarehouseError::Timeout(_))));
        assert_eq!(pool.stats().waiting, 0);
        drop(held);

        assert!(pool.get().await.is_ok());
    }

    #[tokio::test]
    async fn test_pool_connect_failure_releases_slot() {
        let driver = MockDriver::new().with_connection_failure();
        let pool = pool_with(&driver, 1, 200);

        assert!(pool.get().await.is_err());
        driver.set_connect_error(None);
        assert!(pool.get().await.is_ok());
    }

    #[tokio::test]
    async fn test_pool_shutdown_closes_everything() {
        let driver = MockDriver::new();
        let pool = pool_with(&driver, 2, 100);

        pool.use_connection(|c| async move { c.execute("SELECT 1", None).await })
            .await
            .unwrap();
        assert_eq!(driver.open_sessions(), 1);

        pool.shutdown().await;

        assert!(pool.is_shut_down());
        assert_eq!(driver.open_sessions(), 0);
        assert!(matches!(pool.get().await, Err(WarehouseError::Pool(_))));
    }
}
