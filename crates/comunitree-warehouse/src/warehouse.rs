//! Query executor over the active connection strategy
//!
//! [`Warehouse`] owns one *generation*: a configuration snapshot plus the
//! manager built for it (a lazily created pool, or the interactive
//! singleton). Every call snapshots the current generation once, so a call
//! that races with [`Warehouse::reconfigure`] runs entirely on the old or
//! entirely on the new state.

use crate::driver::{Connection, Driver, Execute};
use crate::error::{Result, WarehouseError};
use crate::pool::{ConnectionPool, PoolStats};
use crate::singleton::SingletonConnection;
use crate::value::{ExecuteResult, Row, Value};
use comunitree_core::{
    keys, Authenticator, ConfigBuilder, ConnectionConfig, Override, Strategy,
};
use parking_lot::RwLock;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::OnceCell;

struct PooledBackend {
    config: Arc<ConnectionConfig>,
    driver: Arc<dyn Driver>,
    pool: OnceCell<Arc<ConnectionPool>>,
}

impl PooledBackend {
    /// The pool is only built once validation passes, so a bad
    /// configuration never leaves a pool behind.
    async fn pool(&self) -> Result<&Arc<ConnectionPool>> {
        self.pool
            .get_or_try_init(|| async {
                self.config.validate()?;
                tracing::info!(
                    generation = self.config.generation,
                    max = self.config.pool.max_connections,
                    "creating connection pool"
                );
                Ok::<_, WarehouseError>(Arc::new(ConnectionPool::new(
                    Arc::clone(&self.config),
                    Arc::clone(&self.driver),
                )))
            })
            .await
    }
}

enum Backend {
    Pooled(PooledBackend),
    Interactive(SingletonConnection),
}

struct Generation {
    config: Arc<ConnectionConfig>,
    backend: Backend,
}

impl Generation {
    fn new(config: ConnectionConfig, driver: Arc<dyn Driver>) -> Self {
        let config = Arc::new(config);
        let backend = match config.strategy() {
            Strategy::Pooled => Backend::Pooled(PooledBackend {
                config: Arc::clone(&config),
                driver,
                pool: OnceCell::new(),
            }),
            Strategy::Interactive => {
                Backend::Interactive(SingletonConnection::new(Arc::clone(&config), driver))
            }
        };
        Self { config, backend }
    }

    async fn use_connection<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn Connection>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match &self.backend {
            Backend::Pooled(backend) => backend.pool().await?.use_connection(f).await,
            Backend::Interactive(single) => {
                self.config.validate()?;
                single.use_connection(f).await
            }
        }
    }

    fn stats(&self) -> Option<PoolStats> {
        match &self.backend {
            Backend::Pooled(backend) => backend.pool.get().map(|p| p.stats()),
            Backend::Interactive(_) => None,
        }
    }

    async fn retire(&self) {
        match &self.backend {
            Backend::Pooled(backend) => {
                if let Some(pool) = backend.pool.get() {
                    pool.shutdown().await;
                }
            }
            Backend::Interactive(single) => single.invalidate().await,
        }
    }
}

/// Uniform `execute` over whichever strategy is configured
pub struct Warehouse {
    builder: ConfigBuilder,
    driver: Arc<dyn Driver>,
    active: RwLock<Arc<Generation>>,
}

impl Warehouse {
    /// Build the first generation. Nothing connects until the first call.
    pub fn new(builder: ConfigBuilder, driver: Arc<dyn Driver>) -> Self {
        let generation = Generation::new(builder.build(), Arc::clone(&driver));
        tracing::debug!(
            driver = driver.name(),
            summary = %generation.config.redacted_summary(),
            "warehouse initialized"
        );
        Self {
            builder,
            driver,
            active: RwLock::new(Arc::new(generation)),
        }
    }

    fn snapshot(&self) -> Arc<Generation> {
        Arc::clone(&*self.active.read())
    }

    /// Configuration of the active generation
    pub fn config(&self) -> Arc<ConnectionConfig> {
        Arc::clone(&self.snapshot().config)
    }

    pub fn strategy(&self) -> Strategy {
        self.snapshot().config.strategy()
    }

    /// The builder feeding [`Warehouse::reconfigure`]; overrides set here take
    /// effect on the next reconfigure.
    pub fn builder(&self) -> &ConfigBuilder {
        &self.builder
    }

    pub fn driver_name(&self) -> &'static str {
        self.driver.name()
    }

    /// Run one statement. Empty `binds` reach the driver as `None`.
    pub async fn execute(&self, sql: &str, binds: &[Value]) -> Result<ExecuteResult> {
        let generation = self.snapshot();
        let bind_count = binds.len();
        let binds = (!binds.is_empty()).then_some(binds);

        tracing::debug!(
            generation = generation.config.generation,
            binds = bind_count,
            "executing statement"
        );

        generation
            .use_connection(|conn| async move { conn.execute(sql, binds).await })
            .await
    }

    /// Like [`Warehouse::execute`], rows only
    pub async fn query(&self, sql: &str, binds: &[Value]) -> Result<Vec<Row>> {
        Ok(self.execute(sql, binds).await?.rows)
    }

    /// Handle to the active connection manager
    pub fn get_pool(&self) -> ConnectionHandle {
        ConnectionHandle {
            generation: self.snapshot(),
        }
    }

    /// Re-read configuration and replace the connection manager.
    ///
    /// Calls already in flight finish on the old generation; its idle
    /// sessions are closed in the background.
    pub async fn reconfigure(&self) -> Arc<ConnectionConfig> {
        // build under the write lock so swaps land in the order configs were built
        let (config, previous) = {
            let mut active = self.active.write();
            let next = Arc::new(Generation::new(self.builder.build(), Arc::clone(&self.driver)));
            let config = Arc::clone(&next.config);
            (config, std::mem::replace(&mut *active, next))
        };

        tracing::info!(
            generation = config.generation,
            strategy = %config.strategy(),
            "warehouse reconfigured"
        );

        tokio::spawn(async move { previous.retire().await });
        config
    }

    /// Point configuration at a freshly registered private key and reconfigure
    pub async fn switch_to_key_pair(&self, key_path: &Path) -> Arc<ConnectionConfig> {
        self.builder.apply_overrides([
            (
                keys::AUTHENTICATOR,
                Override::Set(Authenticator::KeyPairJwt.as_str().to_string()),
            ),
            (
                keys::PRIVATE_KEY_PATH,
                Override::Set(key_path.display().to_string()),
            ),
            (keys::PASSCODE, Override::Clear),
        ]);
        self.reconfigure().await
    }

    /// Close every session held by the active generation
    pub async fn close(&self) {
        self.snapshot().retire().await;
    }
}

#[async_trait::async_trait]
impl Execute for Warehouse {
    async fn execute(&self, sql: &str, binds: &[Value]) -> Result<ExecuteResult> {
        Warehouse::execute(self, sql, binds).await
    }
}

/// Strategy-independent access to a session of one generation
#[derive(Clone)]
pub struct ConnectionHandle {
    generation: Arc<Generation>,
}

impl ConnectionHandle {
    /// Run `f` with a session. Pooled sessions are returned afterwards;
    /// an interactive session is discarded if `f` fails.
    pub async fn use_connection<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn Connection>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.generation.use_connection(f).await
    }

    pub fn strategy(&self) -> Strategy {
        self.generation.config.strategy()
    }

    pub fn config(&self) -> &Arc<ConnectionConfig> {
        &self.generation.config
    }

    /// Pool statistics, once a pool has been created
    pub fn stats(&self) -> Option<PoolStats> {
        self.generation.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDriver;
    use comunitree_core::{ConfigError, MapSource};
    use pretty_assertions::assert_eq;

    fn password_source() -> MapSource {
        MapSource::new()
            .with(keys::ACCOUNT, "acct")
            .with(keys::USERNAME, "svc")
            .with(keys::PASSWORD, "pw")
    }

    #[tokio::test]
    async fn test_execute_passes_none_for_empty_binds() {
        let driver = MockDriver::new();
        let warehouse = Warehouse::new(ConfigBuilder::new(password_source()), Arc::new(driver.clone()));

        warehouse.execute("SELECT 1", &[]).await.unwrap();
        warehouse
            .execute("SELECT * FROM users WHERE id = ?", &[Value::from("u1")])
            .await
            .unwrap();

        let executed = driver.executed();
        assert_eq!(executed[0].binds, None);
        assert_eq!(executed[1].binds, Some(vec![Value::Text("u1".into())]));
    }

    #[tokio::test]
    async fn test_missing_account_is_config_error() {
        let driver = MockDriver::new();
        let source = MapSource::new().with(keys::USERNAME, "svc").with(keys::PASSWORD, "pw");
        let warehouse = Warehouse::new(ConfigBuilder::new(source), Arc::new(driver.clone()));

        let err = warehouse.query("SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(
            err,
            WarehouseError::Config(ConfigError::MissingField { field: "account", .. })
        ));
        assert_eq!(driver.connect_count(), 0);
        assert_eq!(warehouse.get_pool().stats(), None);
    }

    #[tokio::test]
    async fn test_query_returns_rows() {
        let driver = MockDriver::new();
        driver
            .add_response("FROM communities", vec![Row::new().with("NAME", "Gardeners")])
            .await;
        let warehouse = Warehouse::new(ConfigBuilder::new(password_source()), Arc::new(driver));

        let rows = warehouse
            .query("SELECT name FROM communities", &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name"), Some(&serde_json::json!("Gardeners")));
    }

    #[tokio::test]
    async fn test_handle_reports_strategy_and_stats() {
        let driver = MockDriver::new();
        let warehouse = Warehouse::new(ConfigBuilder::new(password_source()), Arc::new(driver));

        let handle = warehouse.get_pool();
        assert_eq!(handle.strategy(), Strategy::Pooled);
        handle
            .use_connection(|c| async move { c.execute("SELECT 1", None).await })
            .await
            .unwrap();

        let stats = handle.stats().unwrap();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.max, 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reconfigure_never_goes_backwards() {
        let driver = MockDriver::new();
        let warehouse = Arc::new(Warehouse::new(
            ConfigBuilder::new(password_source()),
            Arc::new(driver),
        ));
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let churn: Vec<_> = (0..3)
            .map(|_| {
                let warehouse = Arc::clone(&warehouse);
                let done = Arc::clone(&done);
                tokio::spawn(async move {
                    while !done.load(std::sync::atomic::Ordering::SeqCst) {
                        warehouse.reconfigure().await;
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        for i in 0..500 {
            let role = format!("ROLE_{}", i);
            warehouse.builder().set_override(keys::ROLE, role.clone());
            let installed = warehouse.reconfigure().await;
            let seen = warehouse.config();

            assert_eq!(installed.role, role);
            assert_eq!(seen.role, role);
            assert!(seen.generation >= installed.generation);
        }

        done.store(true, std::sync::atomic::Ordering::SeqCst);
        for task in churn {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_switch_to_key_pair_sets_path_and_authenticator_together() {
        let driver = MockDriver::new();
        let source = password_source().with(keys::PASSCODE, "123456");
        let warehouse = Warehouse::new(ConfigBuilder::new(source), Arc::new(driver));

        let config = warehouse
            .switch_to_key_pair(Path::new("/srv/keys/rsa_key.p8"))
            .await;

        assert_eq!(config.strategy(), Strategy::Pooled);
        match &config.credential {
            comunitree_core::CredentialVariant::KeyPair { key: Some(key), .. } => {
                assert_eq!(key.path(), Some(Path::new("/srv/keys/rsa_key.p8")));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_releases_sessions() {
        let driver = MockDriver::new();
        let warehouse =
            Warehouse::new(ConfigBuilder::new(password_source()), Arc::new(driver.clone()));

        warehouse.execute("SELECT 1", &[]).await.unwrap();
        assert_eq!(driver.open_sessions(), 1);

        warehouse.close().await;
        assert_eq!(driver.open_sessions(), 0);
    }
}
