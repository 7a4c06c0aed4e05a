//! Warehouse connectivity for the Comunitree API
//!
//! Connection lifecycle management on top of a pluggable [`Driver`]:
//! a bounded pool for password and key-pair credentials, a single shared
//! session for interactive browser logins, and a [`Warehouse`] executor that
//! hides the difference and can be reconfigured at runtime.
//!
//! ## Features
//!
//! - `snowflake` - real Snowflake driver (`snowflake-api`)
//! - `snowflake-sso` - browser sign-in for `EXTERNALBROWSER` (`snowflake-connector-rs`)
//!
//! ## Example
//!
//! ```rust,ignore
//! use comunitree_core::ConfigBuilder;
//! use comunitree_warehouse::{SnowflakeDriver, Warehouse};
//! use std::sync::Arc;
//!
//! let warehouse = Warehouse::new(ConfigBuilder::from_env(), Arc::new(SnowflakeDriver::new()));
//! let rows = warehouse.query("SELECT * FROM users WHERE id = ?", &["u1".into()]).await?;
//! ```

pub mod binds;
pub mod bootstrap;
pub mod browser;
pub mod driver;
pub mod error;
pub mod mock;
pub mod pool;
pub mod singleton;
pub mod snowflake;
pub mod value;
pub mod warehouse;

pub use bootstrap::{
    generate_key_pair, key_material_present, public_key_fingerprint, registration_statement,
    BootstrapOutcome, KeyPairArtifact, KeyPairBootstrapper,
};
pub use browser::BrowserDriver;
pub use driver::{Connection, Driver, Execute};
pub use error::WarehouseError;
pub use mock::MockDriver;
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use singleton::{SingletonConnection, SlotState};
pub use snowflake::SnowflakeDriver;
pub use value::{ExecuteResult, Row, StatementMeta, Value};
pub use warehouse::{ConnectionHandle, Warehouse};
