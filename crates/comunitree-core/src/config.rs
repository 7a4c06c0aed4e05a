//! Connection configuration
//!
//! [`ConfigBuilder`] turns a [`ConfigSource`] into an immutable
//! [`ConnectionConfig`] snapshot. Building never fails: missing account or
//! username is reported by [`ConnectionConfig::validate`] when a connection is
//! actually requested, so tools that deliberately run with a different
//! strategy (key-pair bootstrap) are not blocked by an incomplete target setup.

use crate::error::ConfigError;
use crate::key::{normalize_inline_key, KeySource};
use crate::source::{ConfigSource, EnvSource};
use parking_lot::RwLock;
use secrecy::SecretString;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Recognized configuration keys
pub mod keys {
    pub const ACCOUNT: &str = "SNOWFLAKE_ACCOUNT";
    pub const USERNAME: &str = "SNOWFLAKE_USERNAME";
    pub const PASSWORD: &str = "SNOWFLAKE_PASSWORD";
    pub const WAREHOUSE: &str = "SNOWFLAKE_WAREHOUSE";
    pub const DATABASE: &str = "SNOWFLAKE_DATABASE";
    pub const SCHEMA: &str = "SNOWFLAKE_SCHEMA";
    pub const ROLE: &str = "SNOWFLAKE_ROLE";
    pub const APPLICATION: &str = "SNOWFLAKE_APPLICATION";
    pub const AUTHENTICATOR: &str = "SNOWFLAKE_AUTHENTICATOR";
    pub const PASSCODE: &str = "SNOWFLAKE_PASSCODE";
    pub const PRIVATE_KEY_PATH: &str = "SNOWFLAKE_PRIVATE_KEY_PATH";
    pub const PRIVATE_KEY: &str = "SNOWFLAKE_PRIVATE_KEY";
    pub const PRIVATE_KEY_PASS: &str = "SNOWFLAKE_PRIVATE_KEY_PASS";
    pub const POOL_MIN: &str = "SNOWFLAKE_POOL_MIN";
    pub const POOL_MAX: &str = "SNOWFLAKE_POOL_MAX";
    pub const POOL_ACQUIRE_TIMEOUT_SECS: &str = "SNOWFLAKE_POOL_ACQUIRE_TIMEOUT_SECS";
    pub const BROWSER_TIMEOUT_SECS: &str = "SNOWFLAKE_BROWSER_TIMEOUT_SECS";
}

pub const DEFAULT_WAREHOUSE: &str = "COMPUTE_WH";
pub const DEFAULT_DATABASE: &str = "COMUNITREE";
pub const DEFAULT_SCHEMA: &str = "PUBLIC";
pub const DEFAULT_ROLE: &str = "ACCOUNTADMIN";
pub const DEFAULT_APPLICATION: &str = "COMUNITREE_BACKEND";
/// File name of the private key when no path is configured
pub const DEFAULT_KEY_FILE: &str = "snowflake_rsa_key.p8";
pub const DEFAULT_BROWSER_TIMEOUT: Duration = Duration::from_secs(300);

/// Value of the authenticator selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Authenticator {
    /// Username and password (the default)
    Snowflake,
    /// Key-pair authentication with a signed JWT
    KeyPairJwt,
    /// Browser-based SSO/MFA, one interactive step per session
    ExternalBrowser,
    /// Password plus a one-time passcode
    UsernamePasswordMfa,
}

impl Authenticator {
    /// Parse a selector value. Blank means the default.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "" | "SNOWFLAKE" | "PASSWORD" => Some(Self::Snowflake),
            "SNOWFLAKE_JWT" => Some(Self::KeyPairJwt),
            "EXTERNALBROWSER" => Some(Self::ExternalBrowser),
            "USERNAME_PASSWORD_MFA" => Some(Self::UsernamePasswordMfa),
            _ => None,
        }
    }

    /// Canonical selector value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Snowflake => "SNOWFLAKE",
            Self::KeyPairJwt => "SNOWFLAKE_JWT",
            Self::ExternalBrowser => "EXTERNALBROWSER",
            Self::UsernamePasswordMfa => "USERNAME_PASSWORD_MFA",
        }
    }
}

impl fmt::Display for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which connection manager serves a credential variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Non-interactive credentials, bounded pool of connections
    Pooled,
    /// One long-lived connection created through an interactive step
    Interactive,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pooled => f.write_str("pooled"),
            Self::Interactive => f.write_str("interactive"),
        }
    }
}

/// The one active way of proving identity
#[derive(Debug, Clone)]
pub enum CredentialVariant {
    Password {
        password: Option<SecretString>,
        /// One-time code for `USERNAME_PASSWORD_MFA`
        passcode: Option<SecretString>,
        mfa: bool,
    },
    KeyPair {
        key: Option<KeySource>,
        passphrase: Option<SecretString>,
    },
    InteractiveBrowser {
        timeout: Duration,
    },
    Unrecognized(String),
}

impl CredentialVariant {
    pub fn strategy(&self) -> Strategy {
        match self {
            Self::InteractiveBrowser { .. } => Strategy::Interactive,
            _ => Strategy::Pooled,
        }
    }

    pub fn authenticator(&self) -> Option<Authenticator> {
        match self {
            Self::Password { mfa: false, .. } => Some(Authenticator::Snowflake),
            Self::Password { mfa: true, .. } => Some(Authenticator::UsernamePasswordMfa),
            Self::KeyPair { .. } => Some(Authenticator::KeyPairJwt),
            Self::InteractiveBrowser { .. } => Some(Authenticator::ExternalBrowser),
            Self::Unrecognized(_) => None,
        }
    }

    /// Check that the variant carries enough material to attempt a connection
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Password { password: None, .. } => Err(ConfigError::MissingCredentials(
                "set SNOWFLAKE_PASSWORD, or for key-pair set SNOWFLAKE_AUTHENTICATOR=SNOWFLAKE_JWT and SNOWFLAKE_PRIVATE_KEY or SNOWFLAKE_PRIVATE_KEY_PATH".to_string(),
            )),
            Self::Password { mfa: true, passcode: None, .. } => Err(ConfigError::MissingCredentials(
                "USERNAME_PASSWORD_MFA needs SNOWFLAKE_PASSCODE".to_string(),
            )),
            Self::KeyPair { key: None, .. } => Err(ConfigError::MissingCredentials(
                "SNOWFLAKE_JWT needs SNOWFLAKE_PRIVATE_KEY_PATH or a usable SNOWFLAKE_PRIVATE_KEY".to_string(),
            )),
            Self::Unrecognized(value) => Err(ConfigError::UnknownAuthenticator(value.clone())),
            _ => Ok(()),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Password { password, mfa, .. } => format!(
                "{} (password {})",
                if *mfa { "USERNAME_PASSWORD_MFA" } else { "SNOWFLAKE" },
                if password.is_some() { "set" } else { "missing" }
            ),
            Self::KeyPair { key, passphrase } => format!(
                "SNOWFLAKE_JWT ({}{})",
                key.as_ref().map(KeySource::describe).unwrap_or_else(|| "no key".to_string()),
                if passphrase.is_some() { ", encrypted" } else { "" }
            ),
            Self::InteractiveBrowser { timeout } => {
                format!("EXTERNALBROWSER (timeout {}s)", timeout.as_secs())
            }
            Self::Unrecognized(value) => format!("unrecognized '{}'", value),
        }
    }
}

/// Sizing of the connection pool used by non-interactive strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    /// Idle connections kept open even past the idle timeout
    pub min_connections: usize,
    /// Upper bound on checked-out plus idle connections
    pub max_connections: usize,
    /// How long a caller waits for a free connection
    pub acquire_timeout: Duration,
    /// Idle connections older than this are closed on next checkout
    pub idle_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min_connections: 0,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

impl PoolOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue {
                key: keys::POOL_MAX.to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidValue {
                key: keys::POOL_MIN.to_string(),
                reason: format!(
                    "{} exceeds the pool maximum {}",
                    self.min_connections, self.max_connections
                ),
            });
        }
        Ok(())
    }
}

/// Immutable snapshot of everything needed to open a connection
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub account: Option<String>,
    pub username: Option<String>,
    pub warehouse: String,
    pub database: String,
    pub schema: String,
    pub role: String,
    pub application: String,
    pub credential: CredentialVariant,
    pub pool: PoolOptions,
    /// Increments on every build; lets callers tell snapshots apart
    pub generation: u64,
}

impl ConnectionConfig {
    pub fn strategy(&self) -> Strategy {
        self.credential.strategy()
    }

    pub fn account(&self) -> Result<&str, ConfigError> {
        self.account.as_deref().ok_or(ConfigError::MissingField {
            field: "account",
            key: keys::ACCOUNT,
        })
    }

    pub fn username(&self) -> Result<&str, ConfigError> {
        self.username.as_deref().ok_or(ConfigError::MissingField {
            field: "username",
            key: keys::USERNAME,
        })
    }

    /// Account and username are mandatory for every strategy
    pub fn validate_identity(&self) -> Result<(), ConfigError> {
        self.account()?;
        self.username()?;
        Ok(())
    }

    /// Credential material for the active strategy
    pub fn validate_credentials(&self) -> Result<(), ConfigError> {
        self.credential.validate()
    }

    /// Full first-use validation: identity, credential material, pool sizing
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_identity()?;
        self.validate_credentials()?;
        if self.strategy() == Strategy::Pooled {
            self.pool.validate()?;
        }
        Ok(())
    }

    /// Human-readable description without secrets
    pub fn redacted_summary(&self) -> String {
        format!(
            "account={} user={} warehouse={} database={} schema={} role={} application={} auth={} strategy={}",
            self.account.as_deref().unwrap_or("<unset>"),
            self.username.as_deref().unwrap_or("<unset>"),
            self.warehouse,
            self.database,
            self.schema,
            self.role,
            self.application,
            self.credential.describe(),
            self.strategy(),
        )
    }
}

/// Assembles [`ConnectionConfig`] snapshots from a source plus runtime overrides
pub struct ConfigBuilder {
    source: Arc<dyn ConfigSource>,
    /// `None` marks a key as explicitly unset
    overrides: RwLock<HashMap<String, Option<String>>>,
    generation: AtomicU64,
    base_dir: PathBuf,
}

impl ConfigBuilder {
    pub fn new(source: impl ConfigSource + 'static) -> Self {
        Self {
            source: Arc::new(source),
            overrides: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
            base_dir: std::env::current_dir().unwrap_or_default(),
        }
    }

    /// Builder over the process environment (and `.env`)
    pub fn from_env() -> Self {
        Self::new(EnvSource::new())
    }

    /// Directory that relative key paths and the default key file resolve against
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = dir.into();
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Force a key to a value for subsequent builds
    pub fn set_override(&self, key: &str, value: impl Into<String>) {
        self.apply_overrides([(key, Override::Set(value.into()))]);
    }

    /// Hide a key from subsequent builds even if the source has it
    pub fn unset(&self, key: &str) {
        self.apply_overrides([(key, Override::Unset)]);
    }

    /// Drop an override so the source value shows through again
    pub fn clear_override(&self, key: &str) {
        self.apply_overrides([(key, Override::Clear)]);
    }

    /// Apply several override changes at once; a concurrent
    /// [`ConfigBuilder::build`] sees either none or all of them.
    pub fn apply_overrides<'k>(&self, changes: impl IntoIterator<Item = (&'k str, Override)>) {
        let mut overrides = self.overrides.write();
        for (key, change) in changes {
            match change {
                Override::Set(value) => {
                    overrides.insert(key.to_string(), Some(value));
                }
                Override::Unset => {
                    overrides.insert(key.to_string(), None);
                }
                Override::Clear => {
                    overrides.remove(key);
                }
            }
        }
    }

    fn snapshot(&self) -> Resolved<'_> {
        Resolved {
            builder: self,
            overrides: self.overrides.read().clone(),
        }
    }

    /// Resolve a key; values are trimmed and blank values count as unset
    pub fn get(&self, key: &str) -> Option<String> {
        self.snapshot().get(key)
    }

    /// Configured private key path, resolved against the base directory
    pub fn key_path(&self) -> Option<PathBuf> {
        self.snapshot().key_path()
    }

    /// Configured key path, or `<base dir>/snowflake_rsa_key.p8`
    pub fn key_path_or_default(&self) -> PathBuf {
        self.key_path()
            .unwrap_or_else(|| self.base_dir.join(DEFAULT_KEY_FILE))
    }

    /// Parsed authenticator selector, `None` when the value is unrecognized
    pub fn authenticator(&self) -> Option<Authenticator> {
        match self.get(keys::AUTHENTICATOR) {
            None => Some(Authenticator::Snowflake),
            Some(value) => Authenticator::parse(&value),
        }
    }

    fn resolve_path(&self, raw: &str) -> PathBuf {
        let path = Path::new(raw);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Assemble a fresh snapshot from the current source and overrides.
    ///
    /// Overrides are read once, so the result never mixes values from
    /// before and after a concurrent [`ConfigBuilder::apply_overrides`].
    pub fn build(&self) -> ConnectionConfig {
        let view = self.snapshot();
        let defaults = PoolOptions::default();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let config = ConnectionConfig {
            account: view.get(keys::ACCOUNT),
            username: view.get(keys::USERNAME),
            warehouse: view
                .get(keys::WAREHOUSE)
                .unwrap_or_else(|| DEFAULT_WAREHOUSE.to_string()),
            database: view
                .get(keys::DATABASE)
                .unwrap_or_else(|| DEFAULT_DATABASE.to_string()),
            schema: view
                .get(keys::SCHEMA)
                .unwrap_or_else(|| DEFAULT_SCHEMA.to_string()),
            role: view.get(keys::ROLE).unwrap_or_else(|| DEFAULT_ROLE.to_string()),
            application: view
                .get(keys::APPLICATION)
                .unwrap_or_else(|| DEFAULT_APPLICATION.to_string()),
            credential: view.credential(),
            pool: PoolOptions {
                min_connections: view.number(keys::POOL_MIN, defaults.min_connections),
                max_connections: view.number(keys::POOL_MAX, defaults.max_connections),
                acquire_timeout: Duration::from_secs(view.number(
                    keys::POOL_ACQUIRE_TIMEOUT_SECS,
                    defaults.acquire_timeout.as_secs(),
                )),
                idle_timeout: defaults.idle_timeout,
            },
            generation,
        };

        tracing::debug!(
            source = self.source.name(),
            generation,
            summary = %config.redacted_summary(),
            "built connection config"
        );

        config
    }
}

/// A change to one runtime override
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Override {
    Set(String),
    /// Hide the source value
    Unset,
    /// Let the source value show through again
    Clear,
}

/// Source plus one copy of the overrides
struct Resolved<'a> {
    builder: &'a ConfigBuilder,
    overrides: HashMap<String, Option<String>>,
}

impl Resolved<'_> {
    fn raw(&self, key: &str) -> Option<String> {
        match self.overrides.get(key) {
            Some(overridden) => overridden.clone(),
            None => self.builder.source.get(key),
        }
    }

    fn get(&self, key: &str) -> Option<String> {
        self.raw(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// Secrets are passed through untouched; only an all-blank value is unset
    fn secret(&self, key: &str) -> Option<SecretString> {
        self.raw(key)
            .filter(|v| !v.trim().is_empty())
            .map(SecretString::new)
    }

    fn key_path(&self) -> Option<PathBuf> {
        self.get(keys::PRIVATE_KEY_PATH)
            .map(|p| self.builder.resolve_path(&p))
    }

    fn number<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        match self.get(key) {
            None => default,
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                tracing::warn!(key, value = %raw, "ignoring unparseable setting, using default");
                default
            }),
        }
    }

    fn credential(&self) -> CredentialVariant {
        let selector = self.get(keys::AUTHENTICATOR).unwrap_or_default();

        match Authenticator::parse(&selector) {
            Some(Authenticator::Snowflake) => CredentialVariant::Password {
                password: self.secret(keys::PASSWORD),
                passcode: self.secret(keys::PASSCODE),
                mfa: false,
            },
            Some(Authenticator::UsernamePasswordMfa) => CredentialVariant::Password {
                password: self.secret(keys::PASSWORD),
                passcode: self.secret(keys::PASSCODE),
                mfa: true,
            },
            Some(Authenticator::KeyPairJwt) => CredentialVariant::KeyPair {
                key: self.key_source(),
                passphrase: self.secret(keys::PRIVATE_KEY_PASS),
            },
            Some(Authenticator::ExternalBrowser) => CredentialVariant::InteractiveBrowser {
                timeout: Duration::from_secs(self.number(
                    keys::BROWSER_TIMEOUT_SECS,
                    DEFAULT_BROWSER_TIMEOUT.as_secs(),
                )),
            },
            None => CredentialVariant::Unrecognized(selector),
        }
    }

    /// File path wins over inline material; the file itself is read at connect time
    fn key_source(&self) -> Option<KeySource> {
        if let Some(path) = self.key_path() {
            return Some(KeySource::File(path));
        }

        let raw = self.get(keys::PRIVATE_KEY)?;
        match normalize_inline_key(&raw) {
            Ok(pem) => Some(KeySource::Inline(SecretString::new(pem))),
            Err(e) => {
                tracing::warn!(error = %e, "ignoring unusable inline private key");
                None
            }
        }
    }
}

impl fmt::Debug for ConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigBuilder")
            .field("source", &self.source.name())
            .field("overrides", &self.overrides.read().keys().collect::<Vec<_>>())
            .field("base_dir", &self.base_dir)
            .finish()
    }
}
