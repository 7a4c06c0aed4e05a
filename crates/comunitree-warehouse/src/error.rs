//! Warehouse errors
//!
//! Codes returned by [`WarehouseError::code`] are stable identifiers.

use comunitree_core::ConfigError;
use std::path::PathBuf;

/// Errors that can occur while connecting to or querying the warehouse
///
/// Cloneable so a single connect outcome can be handed to every caller that
/// was waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WarehouseError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    /// The driver detected that the session behind a connection is gone
    #[error("Session is no longer valid: {0}")]
    StaleSession(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Pool error: {0}")]
    Pool(String),

    #[error("Key-pair bootstrap failed: {message}")]
    Bootstrap {
        message: String,
        attempted_paths: Vec<PathBuf>,
    },
}

impl WarehouseError {
    /// Stable machine-readable code for this error
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(inner) => inner.code(),
            Self::Connection(_) => "CONNECTION_FAILED",
            Self::Timeout(_) => "TIMEOUT",
            Self::StaleSession(_) => "STALE_SESSION",
            Self::Query(_) => "QUERY_FAILED",
            Self::Pool(_) => "POOL_ERROR",
            Self::Bootstrap { .. } => "BOOTSTRAP_FAILED",
        }
    }

    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    pub(crate) fn bootstrap(message: impl Into<String>) -> Self {
        Self::Bootstrap {
            message: message.into(),
            attempted_paths: Vec::new(),
        }
    }
}

pub type Result<T> = std::result::Result<T, WarehouseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_keep_their_code() {
        let err: WarehouseError = ConfigError::MissingField {
            field: "account",
            key: "SNOWFLAKE_ACCOUNT",
        }
        .into();

        assert!(err.is_config());
        assert_eq!(err.code(), "CONFIG_MISSING_FIELD");
        assert!(err.to_string().starts_with("Missing Snowflake config"));
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(WarehouseError::Query("x".into()).code(), "QUERY_FAILED");
        assert_eq!(WarehouseError::bootstrap("x").code(), "BOOTSTRAP_FAILED");
    }
}
