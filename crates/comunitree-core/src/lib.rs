//! Comunitree Core
//!
//! Configuration model for the Comunitree Snowflake connection layer.
//! Error codes are part of the public API; never rename them.

pub mod config;
pub mod error;
pub mod key;
pub mod source;

pub use config::{
    keys, Authenticator, ConfigBuilder, ConnectionConfig, CredentialVariant, Override,
    PoolOptions, Strategy,
};
pub use error::ConfigError;
pub use key::KeySource;
pub use source::{ConfigSource, EnvSource, FileSource, LayeredSource, MapSource};
