//! Mock warehouse driver for testing
//!
//! Serves scripted results without any network access. It's useful for:
//! - Unit testing the pool and singleton lifecycles
//! - Exercising the key-pair bootstrap end to end
//! - Simulating dead sessions, slow logins and failing statements
//!
//! ## Usage
//!
//! ```rust,ignore
//! use comunitree_warehouse::{MockDriver, Row};
//!
//! let driver = MockDriver::new();
//! driver
//!     .add_response("SELECT CURRENT_VERSION()", vec![Row::new().with("version", "8.0.0")])
//!     .await;
//!
//! // Simulate a slow interactive login
//! let driver = MockDriver::new().with_connect_latency(200);
//! ```
//!
//! Statements are matched by substring, first registered pattern wins.
//! Unmatched statements succeed with no rows.

use crate::driver::{Connection, Driver};
use crate::error::{Result, WarehouseError};
use crate::value::{ExecuteResult, Row, Value};
use comunitree_core::{Authenticator, ConnectionConfig, CredentialVariant};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// A statement as the mock saw it
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedStatement {
    pub session: usize,
    pub sql: String,
    pub binds: Option<Vec<Value>>,
}

/// One successful or failed login
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRecord {
    pub session: Option<usize>,
    pub generation: u64,
    pub authenticator: Option<Authenticator>,
}

struct MockState {
    responses: RwLock<Vec<(String, Vec<Row>)>>,
    errors: RwLock<Vec<(String, WarehouseError)>>,
    connect_error: parking_lot::Mutex<Option<WarehouseError>>,
    sessions: parking_lot::Mutex<Vec<Arc<MockConnection>>>,
    executed: parking_lot::Mutex<Vec<ExecutedStatement>>,
    connects: parking_lot::Mutex<Vec<ConnectRecord>>,
    next_session: AtomicUsize,
    close_calls: AtomicUsize,
}

/// Scripted in-memory driver
#[derive(Clone)]
pub struct MockDriver {
    state: Arc<MockState>,
    latency_ms: u64,
    connect_latency_ms: u64,
    driver_name: &'static str,
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState {
                responses: RwLock::new(Vec::new()),
                errors: RwLock::new(Vec::new()),
                connect_error: parking_lot::Mutex::new(None),
                sessions: parking_lot::Mutex::new(Vec::new()),
                executed: parking_lot::Mutex::new(Vec::new()),
                connects: parking_lot::Mutex::new(Vec::new()),
                next_session: AtomicUsize::new(1),
                close_calls: AtomicUsize::new(0),
            }),
            latency_ms: 0,
            connect_latency_ms: 0,
            driver_name: "Mock",
        }
    }

    /// Rows returned for statements containing `pattern`
    pub async fn add_response(&self, pattern: impl Into<String>, rows: Vec<Row>) {
        self.state.responses.write().await.push((pattern.into(), rows));
    }

    /// Error returned for statements containing `pattern`
    pub async fn add_error(&self, pattern: impl Into<String>, error: WarehouseError) {
        self.state.errors.write().await.push((pattern.into(), error));
    }

    pub async fn clear_errors(&self) {
        self.state.errors.write().await.clear();
    }

    /// Fail every login
    pub fn with_connection_failure(self) -> Self {
        self.set_connect_error(Some(WarehouseError::Connection(
            "Simulated connection failure".to_string(),
        )));
        self
    }

    /// Fail logins with `error` until cleared with `None`
    pub fn set_connect_error(&self, error: Option<WarehouseError>) {
        *self.state.connect_error.lock() = error;
    }

    /// Delay before every statement returns
    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Delay before every login completes
    pub fn with_connect_latency(mut self, latency_ms: u64) -> Self {
        self.connect_latency_ms = latency_ms;
        self
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.driver_name = name;
        self
    }

    /// Mark every open session dead, as if the warehouse expired them
    pub fn kill_sessions(&self) {
        for session in self.state.sessions.lock().iter() {
            session.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Number of login attempts, successful or not
    pub fn connect_count(&self) -> usize {
        self.state.connects.lock().len()
    }

    pub fn connects(&self) -> Vec<ConnectRecord> {
        self.state.connects.lock().clone()
    }

    /// Number of times a client called `close()` on a session
    pub fn close_calls(&self) -> usize {
        self.state.close_calls.load(Ordering::SeqCst)
    }

    /// Sessions that have not been closed or killed
    pub fn open_sessions(&self) -> usize {
        self.state
            .sessions
            .lock()
            .iter()
            .filter(|s| !s.is_closed())
            .count()
    }

    pub fn executed(&self) -> Vec<ExecutedStatement> {
        self.state.executed.lock().clone()
    }

    pub fn executed_sql(&self) -> Vec<String> {
        self.state
            .executed
            .lock()
            .iter()
            .map(|s| s.sql.clone())
            .collect()
    }

    async fn simulate(ms: u64) {
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Driver for MockDriver {
    fn name(&self) -> &'static str {
        self.driver_name
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn Connection>> {
        Self::simulate(self.connect_latency_ms).await;

        let mut record = ConnectRecord {
            session: None,
            generation: config.generation,
            authenticator: config.credential.authenticator(),
        };

        let failure = self.state.connect_error.lock().clone();
        if let Some(error) = failure {
            self.state.connects.lock().push(record);
            return Err(error);
        }

        // key files are read at login, like the real driver does
        if let CredentialVariant::KeyPair { key: Some(key), .. } = &config.credential {
            if let Err(e) = key.load_pem().await {
                self.state.connects.lock().push(record);
                return Err(e.into());
            }
        }

        let id = self.state.next_session.fetch_add(1, Ordering::SeqCst);
        let connection = Arc::new(MockConnection {
            id,
            closed: AtomicBool::new(false),
            state: Arc::clone(&self.state),
            latency_ms: self.latency_ms,
        });

        record.session = Some(id);
        self.state.connects.lock().push(record);
        self.state.sessions.lock().push(Arc::clone(&connection));

        Ok(connection)
    }
}

/// Session handed out by [`MockDriver`]
pub struct MockConnection {
    id: usize,
    closed: AtomicBool,
    state: Arc<MockState>,
    latency_ms: u64,
}

impl MockConnection {
    pub fn id(&self) -> usize {
        self.id
    }
}

#[async_trait::async_trait]
impl Connection for MockConnection {
    async fn execute(&self, sql: &str, binds: Option<&[Value]>) -> Result<ExecuteResult> {
        MockDriver::simulate(self.latency_ms).await;

        if self.is_closed() {
            return Err(WarehouseError::StaleSession(format!(
                "session {} has been terminated",
                self.id
            )));
        }

        self.state.executed.lock().push(ExecutedStatement {
            session: self.id,
            sql: sql.to_string(),
            binds: binds.map(<[Value]>::to_vec),
        });

        if let Some((_, error)) = self
            .state
            .errors
            .read()
            .await
            .iter()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
        {
            return Err(error.clone());
        }

        let rows = self
            .state
            .responses
            .read()
            .await
            .iter()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default();

        Ok(ExecuteResult::from_rows(sql, rows))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.state.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use comunitree_core::{keys, ConfigBuilder, MapSource};
    use serde_json::json;

    fn config() -> ConnectionConfig {
        ConfigBuilder::new(
            MapSource::new()
                .with(keys::ACCOUNT, "acct")
                .with(keys::USERNAME, "svc")
                .with(keys::PASSWORD, "pw"),
        )
        .build()
    }

    #[tokio::test]
    async fn test_mock_driver_scripted_rows() {
        let driver = MockDriver::new();
        driver
            .add_response("CURRENT_VERSION", vec![Row::new().with("VERSION", "8.40.1")])
            .await;

        let conn = driver.connect(&config()).await.unwrap();
        let result = conn.execute("SELECT CURRENT_VERSION()", None).await.unwrap();

        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].get("version"), Some(&json!("8.40.1")));
        assert_eq!(result.statement.columns, vec!["version".to_string()]);
    }

    #[tokio::test]
    async fn test_mock_driver_unmatched_statement_is_empty() {
        let driver = MockDriver::new();
        let conn = driver.connect(&config()).await.unwrap();

        let result = conn.execute("USE SCHEMA PUBLIC", None).await.unwrap();
        assert!(result.rows.is_empty());
        assert_eq!(driver.executed_sql(), vec!["USE SCHEMA PUBLIC".to_string()]);
    }

    #[tokio::test]
    async fn test_mock_driver_statement_error() {
        let driver = MockDriver::new();
        driver
            .add_error("ALTER USER", WarehouseError::Query("insufficient privileges".into()))
            .await;
        let conn = driver.connect(&config()).await.unwrap();

        let result = conn.execute("ALTER USER SVC SET RSA_PUBLIC_KEY = 'x'", None).await;
        assert!(matches!(result, Err(WarehouseError::Query(_))));
    }

    #[tokio::test]
    async fn test_mock_driver_connection_failure() {
        let driver = MockDriver::new().with_connection_failure();

        let result = driver.connect(&config()).await;
        assert!(matches!(result, Err(WarehouseError::Connection(_))));
        assert_eq!(driver.connect_count(), 1);
        assert_eq!(driver.connects()[0].session, None);
    }

    #[tokio::test]
    async fn test_mock_driver_kill_sessions() {
        let driver = MockDriver::new();
        let conn = driver.connect(&config()).await.unwrap();
        assert_eq!(driver.open_sessions(), 1);

        driver.kill_sessions();

        assert!(conn.is_closed());
        assert_eq!(driver.open_sessions(), 0);
        let result = conn.execute("SELECT 1", None).await;
        assert!(matches!(result, Err(WarehouseError::StaleSession(_))));
    }

    #[tokio::test]
    async fn test_mock_driver_records_binds() {
        let driver = MockDriver::new();
        let conn = driver.connect(&config()).await.unwrap();

        conn.execute("SELECT * FROM users WHERE id = ?", Some(&[Value::Integer(3)]))
            .await
            .unwrap();

        let executed = driver.executed();
        assert_eq!(executed[0].binds, Some(vec![Value::Integer(3)]));
    }

    #[tokio::test]
    async fn test_mock_driver_reads_key_file_on_connect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.p8");
        let config = ConfigBuilder::new(
            MapSource::new()
                .with(keys::ACCOUNT, "acct")
                .with(keys::USERNAME, "svc")
                .with(keys::AUTHENTICATOR, "SNOWFLAKE_JWT")
                .with(keys::PRIVATE_KEY_PATH, path.display().to_string()),
        )
        .build();

        let driver = MockDriver::new();
        let err = driver.connect(&config).await.err().unwrap();
        assert!(err.is_config());
    }

    #[tokio::test]
    async fn test_mock_driver_name() {
        assert_eq!(MockDriver::new().name(), "Mock");
        assert_eq!(MockDriver::new().with_name("TestSnowflake").name(), "TestSnowflake");
    }
}
