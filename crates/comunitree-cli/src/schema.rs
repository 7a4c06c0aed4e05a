//! Comunitree database schema
//!
//! Every statement is idempotent, so `init-db` can be re-run against an
//! existing database.

use comunitree_warehouse::{Execute, WarehouseError};

/// Tables in creation order; foreign keys only point backwards in this list
pub const TABLES: &[(&str, &str)] = &[
    ("users", USERS),
    ("user_configs", USER_CONFIGS),
    ("communities", COMMUNITIES),
    ("community_members", COMMUNITY_MEMBERS),
    ("community_parents", COMMUNITY_PARENTS),
    ("community_invites", COMMUNITY_INVITES),
    ("friendships", FRIENDSHIPS),
    ("events", EVENTS),
    ("event_rsvps", EVENT_RSVPS),
    ("event_ratings", EVENT_RATINGS),
    ("event_waters", EVENT_WATERS),
];

/// Columns added to `events` after its first release
pub const EVENT_COLUMNS: &[(&str, &str)] = &[
    ("waters_count", "INT DEFAULT 0"),
    ("link", "VARCHAR(2000)"),
];

const USERS: &str = "CREATE TABLE IF NOT EXISTS users (
  id VARCHAR(36) DEFAULT UUID_STRING() PRIMARY KEY,
  username VARCHAR(255) NOT NULL UNIQUE,
  email VARCHAR(255) NOT NULL UNIQUE,
  phone_number VARCHAR(50),
  password_hash VARCHAR(255) NOT NULL,
  display_name VARCHAR(255),
  bio VARCHAR(1000),
  avatar_url VARCHAR(500),
  avatar_color VARCHAR(7),
  location VARCHAR(500),
  is_active BOOLEAN DEFAULT TRUE,
  created_at TIMESTAMP_NTZ DEFAULT CURRENT_TIMESTAMP(),
  updated_at TIMESTAMP_NTZ DEFAULT CURRENT_TIMESTAMP()
)";

const USER_CONFIGS: &str = "CREATE TABLE IF NOT EXISTS user_configs (
  user_id VARCHAR(36) PRIMARY KEY,
  gui_settings VARIANT,
  privacy_settings VARIANT,
  updated_at TIMESTAMP_NTZ DEFAULT CURRENT_TIMESTAMP(),
  CONSTRAINT fk_config_user FOREIGN KEY (user_id) REFERENCES users(id)
)";

const COMMUNITIES: &str = "CREATE TABLE IF NOT EXISTS communities (
  id VARCHAR(36) DEFAULT UUID_STRING() PRIMARY KEY,
  name VARCHAR(255) NOT NULL,
  slug VARCHAR(255) NOT NULL UNIQUE,
  type VARCHAR(20) NOT NULL,
  parent_id VARCHAR(36),
  founder_id VARCHAR(36),
  is_friend_group BOOLEAN DEFAULT FALSE,
  description VARCHAR(2000),
  profile_data VARIANT,
  is_active BOOLEAN DEFAULT TRUE,
  created_at TIMESTAMP_NTZ DEFAULT CURRENT_TIMESTAMP(),
  updated_at TIMESTAMP_NTZ DEFAULT CURRENT_TIMESTAMP(),
  CONSTRAINT fk_community_parent FOREIGN KEY (parent_id) REFERENCES communities(id),
  CONSTRAINT fk_community_founder FOREIGN KEY (founder_id) REFERENCES users(id)
)";

const COMMUNITY_MEMBERS: &str = "CREATE TABLE IF NOT EXISTS community_members (
  community_id VARCHAR(36) NOT NULL,
  user_id VARCHAR(36) NOT NULL,
  role VARCHAR(20) NOT NULL DEFAULT 'member',
  joined_at TIMESTAMP_NTZ DEFAULT CURRENT_TIMESTAMP(),
  PRIMARY KEY (community_id, user_id),
  CONSTRAINT fk_member_community FOREIGN KEY (community_id) REFERENCES communities(id),
  CONSTRAINT fk_member_user FOREIGN KEY (user_id) REFERENCES users(id)
)";

const COMMUNITY_PARENTS: &str = "CREATE TABLE IF NOT EXISTS community_parents (
  community_id VARCHAR(36) NOT NULL,
  parent_id VARCHAR(36) NOT NULL,
  PRIMARY KEY (community_id, parent_id),
  CONSTRAINT fk_cp_community FOREIGN KEY (community_id) REFERENCES communities(id),
  CONSTRAINT fk_cp_parent FOREIGN KEY (parent_id) REFERENCES communities(id)
)";

const COMMUNITY_INVITES: &str = "CREATE TABLE IF NOT EXISTS community_invites (
  id VARCHAR(36) DEFAULT UUID_STRING() PRIMARY KEY,
  community_id VARCHAR(36) NOT NULL,
  inviter_id VARCHAR(36) NOT NULL,
  invitee_id VARCHAR(36) NOT NULL,
  status VARCHAR(20) NOT NULL DEFAULT 'pending',
  created_at TIMESTAMP_NTZ DEFAULT CURRENT_TIMESTAMP(),
  CONSTRAINT fk_invite_community FOREIGN KEY (community_id) REFERENCES communities(id),
  CONSTRAINT fk_invite_inviter FOREIGN KEY (inviter_id) REFERENCES users(id),
  CONSTRAINT fk_invite_invitee FOREIGN KEY (invitee_id) REFERENCES users(id),
  CONSTRAINT uq_community_invitee UNIQUE (community_id, invitee_id)
)";

const FRIENDSHIPS: &str = "CREATE TABLE IF NOT EXISTS friendships (
  id VARCHAR(36) DEFAULT UUID_STRING() PRIMARY KEY,
  requester_id VARCHAR(36) NOT NULL,
  addressee_id VARCHAR(36) NOT NULL,
  status VARCHAR(20) NOT NULL DEFAULT 'pending',
  created_at TIMESTAMP_NTZ DEFAULT CURRENT_TIMESTAMP(),
  CONSTRAINT fk_friendship_requester FOREIGN KEY (requester_id) REFERENCES users(id),
  CONSTRAINT fk_friendship_addressee FOREIGN KEY (addressee_id) REFERENCES users(id),
  CONSTRAINT uq_friendship_pair UNIQUE (requester_id, addressee_id)
)";

const EVENTS: &str = "CREATE TABLE IF NOT EXISTS events (
  id VARCHAR(36) DEFAULT UUID_STRING() PRIMARY KEY,
  community_id VARCHAR(36) NOT NULL,
  creator_id VARCHAR(36) NOT NULL,
  title VARCHAR(500) NOT NULL,
  description VARCHAR(5000),
  event_date DATE,
  event_time VARCHAR(50),
  broad_location VARCHAR(500),
  specific_location VARCHAR(1000),
  is_public BOOLEAN DEFAULT TRUE,
  visibility_settings VARIANT,
  is_active BOOLEAN DEFAULT TRUE,
  created_at TIMESTAMP_NTZ DEFAULT CURRENT_TIMESTAMP(),
  updated_at TIMESTAMP_NTZ DEFAULT CURRENT_TIMESTAMP(),
  CONSTRAINT fk_event_community FOREIGN KEY (community_id) REFERENCES communities(id),
  CONSTRAINT fk_event_creator FOREIGN KEY (creator_id) REFERENCES users(id)
)";

const EVENT_RSVPS: &str = "CREATE TABLE IF NOT EXISTS event_rsvps (
  event_id VARCHAR(36) NOT NULL,
  user_id VARCHAR(36) NOT NULL,
  created_at TIMESTAMP_NTZ DEFAULT CURRENT_TIMESTAMP(),
  PRIMARY KEY (event_id, user_id),
  CONSTRAINT fk_rsvp_event FOREIGN KEY (event_id) REFERENCES events(id),
  CONSTRAINT fk_rsvp_user FOREIGN KEY (user_id) REFERENCES users(id)
)";

const EVENT_RATINGS: &str = "CREATE TABLE IF NOT EXISTS event_ratings (
  event_id VARCHAR(36) NOT NULL,
  user_id VARCHAR(36) NOT NULL,
  rating INT NOT NULL,
  created_at TIMESTAMP_NTZ DEFAULT CURRENT_TIMESTAMP(),
  PRIMARY KEY (event_id, user_id),
  CONSTRAINT fk_rating_event FOREIGN KEY (event_id) REFERENCES events(id),
  CONSTRAINT fk_rating_user FOREIGN KEY (user_id) REFERENCES users(id)
)";

const EVENT_WATERS: &str = "CREATE TABLE IF NOT EXISTS event_waters (
  event_id VARCHAR(36) NOT NULL,
  user_id VARCHAR(36) NOT NULL,
  created_at TIMESTAMP_NTZ DEFAULT CURRENT_TIMESTAMP(),
  PRIMARY KEY (event_id, user_id),
  CONSTRAINT fk_water_event FOREIGN KEY (event_id) REFERENCES events(id),
  CONSTRAINT fk_water_user FOREIGN KEY (user_id) REFERENCES users(id)
)";

/// What a schema run did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SchemaReport {
    pub tables: Vec<&'static str>,
    pub columns_added: Vec<&'static str>,
    pub columns_skipped: Vec<&'static str>,
}

/// Reject names that would need quoting in `CREATE DATABASE` / `USE SCHEMA`
fn identifier(name: &str) -> anyhow::Result<&str> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');
    if valid {
        Ok(name)
    } else {
        anyhow::bail!("'{}' is not a plain Snowflake identifier", name)
    }
}

/// Some editions reject `ADD COLUMN IF NOT EXISTS` for existing columns
fn column_exists(error: &WarehouseError) -> bool {
    let message = error.to_string().to_lowercase();
    message.contains("ambiguous") || message.contains("already exists")
}

/// Create the database, select it, and create every table
pub async fn run_schema(
    executor: &dyn Execute,
    database: &str,
    schema: &str,
) -> anyhow::Result<SchemaReport> {
    let database = identifier(database)?;
    let schema = identifier(schema)?;
    let mut report = SchemaReport::default();

    executor
        .execute(&format!("CREATE DATABASE IF NOT EXISTS {}", database), &[])
        .await?;
    executor
        .execute(&format!("USE DATABASE {}", database), &[])
        .await?;
    executor
        .execute(&format!("USE SCHEMA {}", schema), &[])
        .await?;

    for &(name, ddl) in TABLES {
        executor.execute(ddl, &[]).await?;
        tracing::info!(table = name, "table created or already exists");
        report.tables.push(name);
    }

    for &(column, definition) in EVENT_COLUMNS {
        let sql = format!(
            "ALTER TABLE events ADD COLUMN IF NOT EXISTS {} {}",
            column, definition
        );
        match executor.execute(&sql, &[]).await {
            Ok(_) => report.columns_added.push(column),
            Err(e) if column_exists(&e) => {
                tracing::info!(column, "column already exists, skipping");
                report.columns_skipped.push(column);
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(report)
}
