//! Snowflake driver built on `snowflake-api`
//!
//! ## Authentication Methods
//!
//! 1. Password authentication (username/password)
//! 2. Key-pair authentication (PKCS#8 private key, optionally encrypted)
//!
//! `EXTERNALBROWSER` credentials are handed to [`crate::BrowserDriver`], which needs
//! the `snowflake-sso` feature. Passcode MFA is not offered by either SDK, so
//! `USERNAME_PASSWORD_MFA` fails at connect time with a connection error.
//!
//! Compiled only with the `snowflake` feature. Without it [`SnowflakeDriver`]
//! still exists but every connect returns a configuration error.

use crate::driver::{Connection, Driver};
use crate::error::{Result, WarehouseError};
use comunitree_core::{ConfigError, ConnectionConfig};
use std::sync::Arc;

#[cfg(feature = "snowflake")]
use crate::binds::render as render_binds;
#[cfg(feature = "snowflake")]
use crate::browser::BrowserDriver;
#[cfg(feature = "snowflake")]
use crate::value::{ExecuteResult, Row, Value};
#[cfg(feature = "snowflake")]
use comunitree_core::key::expose_pem;
#[cfg(feature = "snowflake")]
use comunitree_core::CredentialVariant;
#[cfg(feature = "snowflake")]
use secrecy::ExposeSecret;
#[cfg(feature = "snowflake")]
use snowflake_api::SnowflakeApi;
#[cfg(feature = "snowflake")]
use std::sync::atomic::{AtomicBool, Ordering};

/// Error fragments the service returns once a session token is no longer valid
#[cfg(feature = "snowflake")]
const STALE_SESSION_MARKERS: &[&str] = &[
    "390112",
    "390114",
    "Session no longer exists",
    "session does not exist",
    "token has expired",
];

#[cfg(feature = "snowflake")]
pub(crate) fn is_stale_session(message: &str) -> bool {
    STALE_SESSION_MARKERS.iter().any(|m| message.contains(m))
}

/// Driver for a real Snowflake account
#[derive(Debug, Clone, Default)]
pub struct SnowflakeDriver;

impl SnowflakeDriver {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(feature = "snowflake")]
fn unsupported(what: &str) -> WarehouseError {
    WarehouseError::Connection(format!(
        "{} is not supported by the Snowflake driver; use EXTERNALBROWSER, SNOWFLAKE_JWT or password authentication",
        what
    ))
}

/// Plain PKCS#8 PEM for the SDK, decrypting with the passphrase when one is set
#[cfg(feature = "snowflake")]
async fn private_key_pem(
    key: &comunitree_core::KeySource,
    passphrase: Option<&secrecy::SecretString>,
) -> Result<String> {
    use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};

    let pem = key.load_pem().await?;
    let Some(passphrase) = passphrase else {
        return Ok(expose_pem(&pem).to_string());
    };

    let private = rsa::RsaPrivateKey::from_pkcs8_encrypted_pem(
        expose_pem(&pem),
        passphrase.expose_secret().as_bytes(),
    )
    .map_err(|e| {
        ConfigError::KeyMaterial(format!(
            "cannot decrypt {} with SNOWFLAKE_PRIVATE_KEY_PASS: {}",
            key.describe(),
            e
        ))
    })?;

    let plain = private
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| ConfigError::KeyMaterial(format!("cannot re-encode private key: {}", e)))?;
    Ok(plain.to_string())
}

#[async_trait::async_trait]
impl Driver for SnowflakeDriver {
    fn name(&self) -> &'static str {
        "Snowflake"
    }

    #[cfg(feature = "snowflake")]
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn Connection>> {
        let account = config.account()?;
        let username = config.username()?;

        let api = match &config.credential {
            CredentialVariant::Password { mfa: true, .. } => {
                return Err(unsupported("USERNAME_PASSWORD_MFA"))
            }
            CredentialVariant::Password {
                password: Some(password),
                ..
            } => SnowflakeApi::with_password_auth(
                account,
                Some(config.warehouse.as_str()),
                Some(config.database.as_str()),
                Some(config.schema.as_str()),
                username,
                Some(config.role.as_str()),
                password.expose_secret(),
            )
            .map_err(|e| {
                WarehouseError::Connection(format!("Failed to authenticate with Snowflake: {}", e))
            })?,
            CredentialVariant::KeyPair {
                key: Some(key),
                passphrase,
            } => {
                let pem = private_key_pem(key, passphrase.as_ref()).await?;
                SnowflakeApi::with_certificate_auth(
                    account,
                    Some(config.warehouse.as_str()),
                    Some(config.database.as_str()),
                    Some(config.schema.as_str()),
                    username,
                    Some(config.role.as_str()),
                    &pem,
                )
                .map_err(|e| {
                    WarehouseError::Connection(format!("Failed to authenticate with key-pair: {}", e))
                })?
            }
            CredentialVariant::InteractiveBrowser { .. } => {
                return BrowserDriver::new().connect(config).await
            }
            other => {
                other.validate()?;
                return Err(WarehouseError::Connection(
                    "credential variant has no usable material".to_string(),
                ));
            }
        };

        // the SDK logs in lazily; force it so bad credentials fail here
        api.exec("SELECT 1").await.map_err(|e| {
            WarehouseError::Connection(format!("Connection test failed: {}", e))
        })?;

        tracing::info!(
            account,
            user = username,
            application = %config.application,
            "connected to Snowflake"
        );

        Ok(Arc::new(SnowflakeConnection {
            api,
            closed: AtomicBool::new(false),
        }))
    }

    #[cfg(not(feature = "snowflake"))]
    async fn connect(&self, _config: &ConnectionConfig) -> Result<Arc<dyn Connection>> {
        Err(ConfigError::Unsupported(
            "Snowflake support not compiled. Rebuild with: cargo build --features snowflake"
                .to_string(),
        )
        .into())
    }
}

/// Session opened by [`SnowflakeDriver`]
#[cfg(feature = "snowflake")]
pub struct SnowflakeConnection {
    api: SnowflakeApi,
    closed: AtomicBool,
}

#[cfg(feature = "snowflake")]
impl SnowflakeConnection {
    fn classify(&self, message: String) -> WarehouseError {
        if is_stale_session(&message) {
            self.closed.store(true, Ordering::SeqCst);
            WarehouseError::StaleSession(message)
        } else {
            WarehouseError::Query(message)
        }
    }
}

#[cfg(feature = "snowflake")]
#[async_trait::async_trait]
impl Connection for SnowflakeConnection {
    async fn execute(&self, sql: &str, binds: Option<&[Value]>) -> Result<ExecuteResult> {
        use snowflake_api::QueryResult;

        let rendered = match binds {
            Some(values) => render_binds(sql, values)?,
            None => sql.to_string(),
        };

        let result = self
            .api
            .exec(&rendered)
            .await
            .map_err(|e| self.classify(e.to_string()))?;

        let rows = match result {
            QueryResult::Arrow(batches) => arrow_rows(&batches),
            QueryResult::Json(json) => json_rows(&json),
            QueryResult::Empty => Vec::new(),
        };

        Ok(ExecuteResult::from_rows(sql, rows))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(feature = "snowflake")]
fn arrow_rows(batches: &[arrow_array::RecordBatch]) -> Vec<Row> {
    let mut rows = Vec::new();
    for batch in batches {
        let schema = batch.schema();
        for row_idx in 0..batch.num_rows() {
            let mut row = Row::new();
            for (col_idx, field) in schema.fields().iter().enumerate() {
                row.insert(field.name(), arrow_cell(batch.column(col_idx), row_idx));
            }
            rows.push(row);
        }
    }
    rows
}

#[cfg(feature = "snowflake")]
fn arrow_cell(array: &arrow_array::ArrayRef, row: usize) -> serde_json::Value {
    use arrow_array::cast::AsArray;
    use arrow_array::types::{
        Decimal128Type, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type, Int8Type,
    };
    use arrow_array::Array;
    use arrow_schema::DataType;
    use serde_json::{json, Value as JsonValue};

    if array.is_null(row) {
        return JsonValue::Null;
    }

    match array.data_type() {
        DataType::Utf8 => json!(array.as_string::<i32>().value(row)),
        DataType::LargeUtf8 => json!(array.as_string::<i64>().value(row)),
        DataType::Boolean => json!(array.as_boolean().value(row)),
        DataType::Int8 => json!(array.as_primitive::<Int8Type>().value(row)),
        DataType::Int16 => json!(array.as_primitive::<Int16Type>().value(row)),
        DataType::Int32 => json!(array.as_primitive::<Int32Type>().value(row)),
        DataType::Int64 => json!(array.as_primitive::<Int64Type>().value(row)),
        DataType::Float32 => json!(array.as_primitive::<Float32Type>().value(row)),
        DataType::Float64 => json!(array.as_primitive::<Float64Type>().value(row)),
        DataType::Decimal128(_, scale) => {
            let raw = array.as_primitive::<Decimal128Type>().value(row);
            if *scale == 0 {
                i64::try_from(raw).map(|v| json!(v)).unwrap_or_else(|_| json!(raw.to_string()))
            } else {
                json!(raw as f64 / 10f64.powi(i32::from(*scale)))
            }
        }
        other => {
            tracing::debug!(data_type = %other, "unsupported Arrow type, returning null");
            JsonValue::Null
        }
    }
}

#[cfg(feature = "snowflake")]
fn json_rows(json: &snowflake_api::JsonResult) -> Vec<Row> {
    let names: Vec<&str> = json.schema.iter().map(|f| f.name.as_str()).collect();
    let Some(records) = json.value.as_array() else {
        return Vec::new();
    };

    records
        .iter()
        .filter_map(|record| record.as_array())
        .map(|cells| {
            names
                .iter()
                .zip(cells.iter())
                .map(|(name, cell)| (*name, cell.clone()))
                .collect()
        })
        .collect()
}
