//! Driver and connection traits
//!
//! A [`Driver`] opens sessions for a [`ConnectionConfig`]; the managers in
//! this crate decide how many sessions exist and when they are replaced.

use crate::error::Result;
use crate::value::{ExecuteResult, Row, Value};
use comunitree_core::ConnectionConfig;
use std::sync::Arc;

/// A live warehouse session
#[async_trait::async_trait]
pub trait Connection: Send + Sync {
    /// Run one statement. `binds` is `None` when there is nothing to bind.
    async fn execute(&self, sql: &str, binds: Option<&[Value]>) -> Result<ExecuteResult>;

    /// Whether the session is known to be unusable
    fn is_closed(&self) -> bool;

    /// Release the session. Errors are swallowed; closing is best effort.
    async fn close(&self);
}

/// Opens warehouse sessions
#[async_trait::async_trait]
pub trait Driver: Send + Sync {
    /// Driver name for logs (e.g. "Snowflake")
    fn name(&self) -> &'static str;

    /// Authenticate and open a new session
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn Connection>>;
}

#[async_trait::async_trait]
impl<T: Driver + ?Sized> Driver for Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn Connection>> {
        (**self).connect(config).await
    }
}

/// Anything that can run a statement on the active session
#[async_trait::async_trait]
pub trait Execute: Send + Sync {
    async fn execute(&self, sql: &str, binds: &[Value]) -> Result<ExecuteResult>;

    /// Like [`Execute::execute`] but only the rows
    async fn query(&self, sql: &str, binds: &[Value]) -> Result<Vec<Row>> {
        Ok(self.execute(sql, binds).await?.rows)
    }
}
