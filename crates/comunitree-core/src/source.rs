//! Configuration sources
//!
//! A [`ConfigSource`] answers string lookups for `SNOWFLAKE_*` keys. The
//! builder never reads the process environment directly; it asks a source,
//! which keeps tests free of global state.

use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Once};

/// Something that can resolve configuration keys
pub trait ConfigSource: Send + Sync {
    /// Look up a key. Implementations return the raw value, blank or not.
    fn get(&self, key: &str) -> Option<String>;

    /// Short name used in log lines
    fn name(&self) -> &'static str;
}

static DOTENV: Once = Once::new();

/// Process environment, with `.env` loaded once on first construction
#[derive(Debug, Clone, Default)]
pub struct EnvSource;

impl EnvSource {
    pub fn new() -> Self {
        DOTENV.call_once(|| {
            if let Ok(path) = dotenvy::dotenv() {
                tracing::debug!(path = %path.display(), "loaded .env file");
            }
        });
        Self
    }
}

impl ConfigSource for EnvSource {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn name(&self) -> &'static str {
        "env"
    }
}

/// In-memory key/value source
#[derive(Debug, Clone, Default)]
pub struct MapSource {
    values: HashMap<String, String>,
}

impl MapSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MapSource {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl ConfigSource for MapSource {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn name(&self) -> &'static str {
        "map"
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    snowflake: HashMap<String, toml::Value>,
}

/// Settings from a `comunitree.toml` file
///
/// ```toml
/// [snowflake]
/// account = "xy12345.us-east-1"
/// username = "COMUNITREE_SVC"
/// authenticator = "SNOWFLAKE_JWT"
/// private_key_path = "secrets/snowflake_rsa_key.p8"
/// pool_max = 10
/// ```
///
/// Keys in the table are the environment names without the `SNOWFLAKE_`
/// prefix, in any case.
#[derive(Debug, Clone, Default)]
pub struct FileSource {
    values: HashMap<String, String>,
}

impl FileSource {
    /// Load settings from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&contents)
    }

    /// Parse settings from a TOML string
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let file: FileConfig =
            toml::from_str(toml).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        let values = file
            .snowflake
            .into_iter()
            .map(|(key, value)| {
                let rendered = match value {
                    toml::Value::String(s) => s,
                    other => other.to_string(),
                };
                (format!("SNOWFLAKE_{}", key.to_uppercase()), rendered)
            })
            .collect();

        Ok(Self { values })
    }
}

impl ConfigSource for FileSource {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// Ordered stack of sources; the first one that has a key wins
#[derive(Clone, Default)]
pub struct LayeredSource {
    layers: Vec<Arc<dyn ConfigSource>>,
}

impl LayeredSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a lower-priority layer
    pub fn with_layer(mut self, source: impl ConfigSource + 'static) -> Self {
        self.layers.push(Arc::new(source));
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl ConfigSource for LayeredSource {
    fn get(&self, key: &str) -> Option<String> {
        self.layers.iter().find_map(|layer| layer.get(key))
    }

    fn name(&self) -> &'static str {
        "layered"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_source_lookup() {
        let source = MapSource::new().with("SNOWFLAKE_ACCOUNT", "xy12345");
        assert_eq!(source.get("SNOWFLAKE_ACCOUNT").as_deref(), Some("xy12345"));
        assert_eq!(source.get("SNOWFLAKE_USERNAME"), None);
    }

    #[test]
    fn file_source_maps_table_keys() {
        let source = FileSource::from_toml(
            r#"
            [snowflake]
            account = "xy12345"
            Pool_Max = 4
            "#,
        )
        .unwrap();

        assert_eq!(source.get("SNOWFLAKE_ACCOUNT").as_deref(), Some("xy12345"));
        assert_eq!(source.get("SNOWFLAKE_POOL_MAX").as_deref(), Some("4"));
    }

    #[test]
    fn file_source_without_table_is_empty() {
        let source = FileSource::from_toml("").unwrap();
        assert_eq!(source.get("SNOWFLAKE_ACCOUNT"), None);
    }

    #[test]
    fn file_source_rejects_bad_toml() {
        let err = FileSource::from_toml("[snowflake\naccount = 1").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn layered_source_prefers_first_layer() {
        let layered = LayeredSource::new()
            .with_layer(MapSource::new().with("SNOWFLAKE_ROLE", "SYSADMIN"))
            .with_layer(
                MapSource::new()
                    .with("SNOWFLAKE_ROLE", "ACCOUNTADMIN")
                    .with("SNOWFLAKE_SCHEMA", "APP"),
            );

        assert_eq!(layered.len(), 2);
        assert_eq!(layered.get("SNOWFLAKE_ROLE").as_deref(), Some("SYSADMIN"));
        assert_eq!(layered.get("SNOWFLAKE_SCHEMA").as_deref(), Some("APP"));
    }
}
