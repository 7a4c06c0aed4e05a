//! External browser (SSO) driver built on `snowflake-connector-rs`
//!
//! Used for `EXTERNALBROWSER` credentials. The login opens the system browser
//! once and waits up to the configured timeout for the identity provider to
//! redirect back to a local callback listener. The resulting session token is
//! kept by [`BrowserConnection`], which the singleton slot shares between
//! callers so the browser step happens once per session.
//!
//! Compiled only with the `snowflake-sso` feature.

use crate::driver::{Connection, Driver};
use crate::error::{Result, WarehouseError};
use comunitree_core::{ConfigError, ConnectionConfig};
use std::sync::Arc;

#[cfg(feature = "snowflake-sso")]
use crate::binds::render as render_binds;
#[cfg(feature = "snowflake-sso")]
use crate::snowflake::is_stale_session;
#[cfg(feature = "snowflake-sso")]
use crate::value::{ExecuteResult, Row, Value};
#[cfg(feature = "snowflake-sso")]
use comunitree_core::CredentialVariant;
#[cfg(feature = "snowflake-sso")]
use snowflake_connector_rs::{
    ExternalBrowserConfig, SnowflakeAuthMethod, SnowflakeClient, SnowflakeClientConfig,
    SnowflakeRow, SnowflakeSession,
};
#[cfg(feature = "snowflake-sso")]
use std::sync::atomic::{AtomicBool, Ordering};

/// Driver for browser-based single sign-on
#[derive(Debug, Clone, Default)]
pub struct BrowserDriver;

impl BrowserDriver {
    pub fn new() -> Self {
        Self
    }
}

/// Client settings for a browser login, with the login timeout applied
#[cfg(feature = "snowflake-sso")]
fn client_config(config: &ConnectionConfig) -> Result<SnowflakeClientConfig> {
    let CredentialVariant::InteractiveBrowser { timeout } = &config.credential else {
        return Err(ConfigError::Unsupported(format!(
            "browser driver cannot use {} credentials",
            config.credential.authenticator().map_or("unknown", |a| a.as_str())
        ))
        .into());
    };

    Ok(SnowflakeClientConfig {
        account: config.account()?.to_string(),
        warehouse: Some(config.warehouse.clone()),
        database: Some(config.database.clone()),
        schema: Some(config.schema.clone()),
        role: Some(config.role.clone()),
        timeout: Some(*timeout),
    })
}

#[async_trait::async_trait]
impl Driver for BrowserDriver {
    fn name(&self) -> &'static str {
        "Snowflake (browser SSO)"
    }

    #[cfg(feature = "snowflake-sso")]
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn Connection>> {
        let username = config.username()?;
        let client_config = client_config(config)?;
        let timeout = client_config.timeout;

        let client = SnowflakeClient::new(
            username,
            SnowflakeAuthMethod::ExternalBrowser(ExternalBrowserConfig::default()),
            client_config,
        )
        .map_err(|e| WarehouseError::Connection(format!("Failed to create client: {}", e)))?;

        tracing::info!(
            account = %config.account()?,
            user = username,
            timeout_secs = timeout.map_or(0, |t| t.as_secs()),
            "waiting for browser sign-in"
        );

        let session = client.create_session().await.map_err(|e| {
            WarehouseError::Connection(format!("Browser authentication failed: {}", e))
        })?;

        tracing::info!(user = username, "browser sign-in complete");

        Ok(Arc::new(BrowserConnection {
            session,
            closed: AtomicBool::new(false),
        }))
    }

    #[cfg(not(feature = "snowflake-sso"))]
    async fn connect(&self, _config: &ConnectionConfig) -> Result<Arc<dyn Connection>> {
        Err(ConfigError::Unsupported(
            "EXTERNALBROWSER support not compiled. Rebuild with: cargo build --features snowflake-sso"
                .to_string(),
        )
        .into())
    }
}

/// Session opened by a browser sign-in
#[cfg(feature = "snowflake-sso")]
pub struct BrowserConnection {
    session: SnowflakeSession,
    closed: AtomicBool,
}

#[cfg(feature = "snowflake-sso")]
#[async_trait::async_trait]
impl Connection for BrowserConnection {
    async fn execute(&self, sql: &str, binds: Option<&[Value]>) -> Result<ExecuteResult> {
        let rendered = match binds {
            Some(values) => render_binds(sql, values)?,
            None => sql.to_string(),
        };

        let rows = self.session.query(rendered).await.map_err(|e| {
            let message = e.to_string();
            if is_stale_session(&message) {
                self.closed.store(true, Ordering::SeqCst);
                WarehouseError::StaleSession(message)
            } else {
                WarehouseError::Query(message)
            }
        })?;

        Ok(ExecuteResult::from_rows(
            sql,
            rows.iter().map(decode_row).collect(),
        ))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(feature = "snowflake-sso")]
fn decode_row(row: &SnowflakeRow) -> Row {
    row.column_types()
        .iter()
        .map(|column| {
            let raw = row.at::<Option<String>>(column.index()).ok().flatten();
            let ty = column.column_type();
            (
                column.name(),
                cell(raw, ty.snowflake_type(), ty.scale().unwrap_or(0)),
            )
        })
        .collect()
}

/// Converts the textual cell the service returns into JSON by column type
#[cfg(feature = "snowflake-sso")]
fn cell(raw: Option<String>, snowflake_type: &str, scale: i64) -> serde_json::Value {
    use serde_json::{json, Value as JsonValue};

    let Some(text) = raw else {
        return JsonValue::Null;
    };

    match snowflake_type.to_ascii_lowercase().as_str() {
        "fixed" if scale == 0 => text.parse::<i64>().map(|v| json!(v)).unwrap_or(json!(text)),
        "fixed" | "real" => text.parse::<f64>().map(|v| json!(v)).unwrap_or(json!(text)),
        "boolean" => match text.as_str() {
            "1" | "true" | "TRUE" => json!(true),
            "0" | "false" | "FALSE" => json!(false),
            _ => json!(text),
        },
        "variant" | "object" | "array" => serde_json::from_str(&text).unwrap_or(json!(text)),
        _ => json!(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use comunitree_core::{keys, ConfigBuilder, MapSource};

    fn browser_config() -> ConnectionConfig {
        ConfigBuilder::new(
            MapSource::new()
                .with(keys::ACCOUNT, "acct")
                .with(keys::USERNAME, "person@example.com")
                .with(keys::AUTHENTICATOR, "EXTERNALBROWSER")
                .with(keys::BROWSER_TIMEOUT_SECS, "45"),
        )
        .build()
    }

    #[test]
    fn test_driver_name() {
        assert_eq!(BrowserDriver::new().name(), "Snowflake (browser SSO)");
    }

    #[cfg(not(feature = "snowflake-sso"))]
    #[tokio::test]
    async fn test_connect_without_feature_is_config_error() {
        let err = BrowserDriver::new()
            .connect(&browser_config())
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "CONFIG_UNSUPPORTED");
        assert!(err.to_string().contains("--features snowflake-sso"));
    }

    #[cfg(feature = "snowflake-sso")]
    #[test]
    fn test_browser_timeout_becomes_login_timeout() {
        let client = client_config(&browser_config()).unwrap();
        assert_eq!(client.account, "acct");
        assert_eq!(client.timeout, Some(std::time::Duration::from_secs(45)));
        assert_eq!(client.warehouse.as_deref(), Some("COMPUTE_WH"));
    }

    #[cfg(feature = "snowflake-sso")]
    #[test]
    fn test_non_browser_credentials_are_rejected() {
        let config = ConfigBuilder::new(
            MapSource::new()
                .with(keys::ACCOUNT, "acct")
                .with(keys::USERNAME, "svc")
                .with(keys::PASSWORD, "pw"),
        )
        .build();

        let err = client_config(&config).err().unwrap();
        assert_eq!(err.code(), "CONFIG_UNSUPPORTED");
    }

    #[cfg(feature = "snowflake-sso")]
    #[test]
    fn test_cells_follow_column_type() {
        use serde_json::json;

        assert_eq!(cell(Some("42".into()), "fixed", 0), json!(42));
        assert_eq!(cell(Some("4.5".into()), "fixed", 1), json!(4.5));
        assert_eq!(cell(Some("1".into()), "boolean", 0), json!(true));
        assert_eq!(cell(Some("{\"a\":1}".into()), "variant", 0), json!({"a": 1}));
        assert_eq!(cell(Some("hi".into()), "text", 0), json!("hi"));
        assert_eq!(cell(None, "text", 0), serde_json::Value::Null);
    }

    #[cfg(feature = "snowflake-sso")]
    #[tokio::test]
    #[ignore = "opens a browser and needs a live account"]
    async fn test_live_browser_sign_in() {
        let builder = ConfigBuilder::from_env();
        builder.set_override(keys::AUTHENTICATOR, "EXTERNALBROWSER");
        let connection = BrowserDriver::new().connect(&builder.build()).await.unwrap();
        let result = connection.execute("SELECT 1 AS ONE", None).await.unwrap();
        assert_eq!(result.rows.len(), 1);
    }
}
