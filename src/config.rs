//! Configuration for partysync
//!
//! Centralized configuration with sensible defaults. A node reads it from a
//! TOML file ([`Config::from_file`]) or assembles it with [`Config::builder`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PartyError, Result};

/// Main configuration for a partysync node (and the store server)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Node Identity
    // -------------------------------------------------------------------------
    /// Name of this front-end node, stamped on every published event
    pub node_id: String,

    // -------------------------------------------------------------------------
    // Shared Store Configuration
    // -------------------------------------------------------------------------
    /// Which fast shared store this node talks to
    pub store: StoreBackend,

    /// Bound on a single shared-store call (milliseconds)
    pub store_timeout_ms: u64,

    // -------------------------------------------------------------------------
    // Durable Store Configuration
    // -------------------------------------------------------------------------
    /// Snapshot backend used for recovery
    pub durable: DurableBackend,

    /// Prefix for SQL tables
    pub table_prefix: String,

    /// Max ops the mirror writes per batch
    pub mirror_batch_size: usize,

    // -------------------------------------------------------------------------
    // Party Policy
    // -------------------------------------------------------------------------
    /// Lifetime of an invitation (seconds)
    pub invite_ttl_secs: u64,

    /// Maximum party size including the leader (None = unlimited)
    pub member_limit: Option<usize>,

    // -------------------------------------------------------------------------
    // Retry Configuration
    // -------------------------------------------------------------------------
    /// Attempts for an operation that keeps losing optimistic races
    pub conflict_retries: u32,

    /// Attempts for an operation while the shared store is unavailable
    pub store_retries: u32,

    /// First backoff delay (milliseconds), doubled per attempt
    pub backoff_base_ms: u64,

    /// Backoff ceiling (milliseconds)
    pub backoff_max_ms: u64,

    // -------------------------------------------------------------------------
    // Projection Configuration
    // -------------------------------------------------------------------------
    /// Interval between full resyncs of the node-local projection (milliseconds)
    pub resync_interval_ms: u64,

    /// Age after which a projection entry reads as missing (milliseconds)
    pub projection_ttl_ms: u64,

    // -------------------------------------------------------------------------
    // Store Server Configuration
    // -------------------------------------------------------------------------
    /// TCP listen address
    pub listen_addr: String,

    /// Max concurrent client connections
    pub max_connections: usize,

    /// Connection read timeout (milliseconds, 0 = none)
    pub read_timeout_ms: u64,

    /// Connection write timeout (milliseconds, 0 = none)
    pub write_timeout_ms: u64,
}

/// Fast shared store selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreBackend {
    /// In-process keyspace (single node, tests)
    Memory,

    /// A `partysync-store` server
    Remote { addr: String },
}

/// Durable snapshot backend selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DurableBackend {
    /// No snapshots; a full cluster restart loses live parties
    Disabled,

    /// SQLite database file
    Sqlite { path: PathBuf },

    #[serde(rename = "mysql")]
    MySql(SqlEndpoint),

    #[serde(rename = "mariadb")]
    MariaDb(SqlEndpoint),

    Postgres(SqlEndpoint),

    /// Append-only document log in a directory
    Document { dir: PathBuf },
}

/// Connection settings for a networked SQL server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqlEndpoint {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    /// Postgres schema (ignored by other dialects)
    pub schema: String,
}

impl Default for SqlEndpoint {
    fn default() -> Self {
        Self {
            hostname: "127.0.0.1".to_string(),
            port: 5432,
            username: "party".to_string(),
            password: String::new(),
            database: "party".to_string(),
            schema: "public".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            store: StoreBackend::Memory,
            store_timeout_ms: 3000,
            durable: DurableBackend::Disabled,
            table_prefix: "party_".to_string(),
            mirror_batch_size: 64,
            invite_ttl_secs: 90,
            member_limit: None,
            conflict_retries: 5,
            store_retries: 4,
            backoff_base_ms: 50,
            backoff_max_ms: 2000,
            resync_interval_ms: 30_000,
            projection_ttl_ms: 120_000,
            listen_addr: "127.0.0.1:7480".to_string(),
            max_connections: 1024,
            read_timeout_ms: 0,
            write_timeout_ms: 5000,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(text).map_err(|e| PartyError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            PartyError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Reject settings the runtime cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(PartyError::Config("node_id must not be empty".to_string()));
        }
        if self.invite_ttl_secs == 0 {
            return Err(PartyError::Config("invite_ttl_secs must be positive".to_string()));
        }
        if self.conflict_retries == 0 || self.store_retries == 0 {
            return Err(PartyError::Config("retry bounds must be at least 1".to_string()));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(PartyError::Config(
                "backoff_base_ms must not exceed backoff_max_ms".to_string(),
            ));
        }
        if self.member_limit == Some(0) {
            return Err(PartyError::Config("member_limit must be at least 1".to_string()));
        }
        if self.mirror_batch_size == 0 {
            return Err(PartyError::Config("mirror_batch_size must be positive".to_string()));
        }
        if let StoreBackend::Remote { addr } = &self.store {
            if addr.is_empty() {
                return Err(PartyError::Config("remote store addr is empty".to_string()));
            }
        }
        Ok(())
    }

    pub fn invite_ttl(&self) -> Duration {
        Duration::from_secs(self.invite_ttl_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_millis(self.resync_interval_ms)
    }

    pub fn projection_ttl(&self) -> Duration {
        Duration::from_millis(self.projection_ttl_ms)
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the node name
    pub fn node_id(mut self, id: impl Into<String>) -> Self {
        self.config.node_id = id.into();
        self
    }

    /// Set the shared store backend
    pub fn store(mut self, store: StoreBackend) -> Self {
        self.config.store = store;
        self
    }

    /// Set the shared store call timeout (in milliseconds)
    pub fn store_timeout_ms(mut self, ms: u64) -> Self {
        self.config.store_timeout_ms = ms;
        self
    }

    /// Set the durable snapshot backend
    pub fn durable(mut self, durable: DurableBackend) -> Self {
        self.config.durable = durable;
        self
    }

    /// Set the SQL table prefix
    pub fn table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.table_prefix = prefix.into();
        self
    }

    pub fn mirror_batch_size(mut self, size: usize) -> Self {
        self.config.mirror_batch_size = size;
        self
    }

    /// Set the invitation lifetime (in seconds)
    pub fn invite_ttl_secs(mut self, secs: u64) -> Self {
        self.config.invite_ttl_secs = secs;
        self
    }

    /// Cap party size
    pub fn member_limit(mut self, limit: Option<usize>) -> Self {
        self.config.member_limit = limit;
        self
    }

    pub fn conflict_retries(mut self, attempts: u32) -> Self {
        self.config.conflict_retries = attempts;
        self
    }

    pub fn store_retries(mut self, attempts: u32) -> Self {
        self.config.store_retries = attempts;
        self
    }

    /// Set backoff bounds (in milliseconds)
    pub fn backoff_ms(mut self, base: u64, max: u64) -> Self {
        self.config.backoff_base_ms = base;
        self.config.backoff_max_ms = max;
        self
    }

    /// Set the projection resync interval (in milliseconds)
    pub fn resync_interval_ms(mut self, ms: u64) -> Self {
        self.config.resync_interval_ms = ms;
        self
    }

    /// Set the projection entry TTL (in milliseconds)
    pub fn projection_ttl_ms(mut self, ms: u64) -> Self {
        self.config.projection_ttl_ms = ms;
        self
    }

    /// Set the TCP listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    /// Set the maximum number of concurrent connections
    pub fn max_connections(mut self, count: usize) -> Self {
        self.config.max_connections = count;
        self
    }

    /// Set the read timeout (in milliseconds)
    pub fn read_timeout_ms(mut self, ms: u64) -> Self {
        self.config.read_timeout_ms = ms;
        self
    }

    /// Set the write timeout (in milliseconds)
    pub fn write_timeout_ms(mut self, ms: u64) -> Self {
        self.config.write_timeout_ms = ms;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
