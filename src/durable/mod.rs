//! Durable Store Adapter
//!
//! Long-lived party snapshots, used to warm a cold shared store after a full
//! restart. Never read on the live path.
//!
//! ## Layout
//! ```text
//!                 ┌────────────────────┐
//!  Coordinator ──►│  SnapshotMirror    │  background thread, batched,
//!   (commit)      │  (crossbeam chan)  │  coalesced per leader
//!                 └─────────┬──────────┘
//!                           ▼
//!                 ┌────────────────────┐
//!                 │ dyn DurableStore   │  upsert / delete / load_all
//!                 └───┬────────────┬───┘
//!                     ▼            ▼
//!          SqlSnapshotStore   DocumentSnapshotStore
//!          (dialect + executor)  (CRC-framed append log)
//! ```
//!
//! Snapshots are keyed by leader identity. Failures are logged by the mirror
//! and never reach the operation that produced the snapshot.
//!
//! ## Ordering
//! Mirrors on different nodes write to the same backend in no particular
//! order. Every write carries a [`SnapshotStamp`] and only replaces an entry
//! with a lower stamp. Deletes leave a tombstone at their stamp, so a late
//! upsert of the same or an older party state cannot bring it back.
//!
//! The backend also keeps per-player [`PlayerSetting`]s, which are read on
//! the live path.

mod document;
mod mirror;
mod recovery;
mod sql;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{Config, DurableBackend, SqlEndpoint};
use crate::error::{PartyError, Result};
use crate::model::{Party, PartyId, PlayerId, PlayerSetting};

pub use document::{DocumentSnapshotStore, LogRecovery};
pub use mirror::{MirrorOp, MirrorStats, SnapshotMirror};
pub use recovery::{warm_start, WarmStart};
pub use sql::{SqlDialect, SqlExecutor, SqlSnapshotStore, SqlStatements, SqlValue, SqliteExecutor};

/// Position of a snapshot write in the history of one leader key
///
/// Compared field by field: a later party lineage beats an earlier one, and
/// within a lineage the higher revision wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotStamp {
    pub created_at: u64,
    pub party: PartyId,
    pub revision: u64,
}

impl SnapshotStamp {
    /// Stamp of `party` as it stands
    pub fn of(party: &Party) -> Self {
        Self {
            created_at: party.created_at,
            party: party.id,
            revision: party.revision,
        }
    }

    /// Stamp of the change that removed `party` from its leader key
    pub fn removal(party: &Party) -> Self {
        Self {
            revision: party.revision + 1,
            ..Self::of(party)
        }
    }

    /// Fixed-width text that sorts like the stamp itself
    pub fn sort_key(&self) -> String {
        format!(
            "{:020}:{}:{:020}",
            self.created_at,
            self.party.as_hyphenated(),
            self.revision
        )
    }
}

/// Persistence capability shared by every backend
pub trait DurableStore: Send + Sync {
    /// Store the snapshot of `party` under its leader, unless the entry there
    /// already carries an equal or newer stamp
    fn upsert_snapshot(&self, party: &Party) -> Result<()>;

    /// Replace the snapshot under `leader` with a tombstone at `stamp`, unless
    /// the entry there already carries an equal or newer stamp
    fn delete_snapshot(&self, leader: PlayerId, stamp: SnapshotStamp) -> Result<()>;

    /// Every live snapshot; tombstones are skipped
    fn load_all_snapshots(&self) -> Result<Vec<Party>>;

    /// Current value of `setting` for `player`; true if never set
    fn setting(&self, player: PlayerId, setting: PlayerSetting) -> Result<bool>;

    fn set_setting(&self, player: PlayerId, setting: PlayerSetting, enabled: bool) -> Result<()>;

    /// The subset of `players` with `setting` enabled, in input order
    fn players_with_setting(&self, players: &[PlayerId], setting: PlayerSetting) -> Result<Vec<PlayerId>>;

    /// Short backend name for logs
    fn backend(&self) -> &'static str;
}

/// Build the durable backend selected by `config`
///
/// MySQL, MariaDB and Postgres have no bundled driver; an embedder passes an
/// executor for them through `executor`. Returns `None` when persistence is
/// disabled.
pub fn open_durable(
    config: &Config,
    executor: Option<Box<dyn SqlExecutor>>,
) -> Result<Option<Arc<dyn DurableStore>>> {
    let store: Arc<dyn DurableStore> = match &config.durable {
        DurableBackend::Disabled => return Ok(None),
        DurableBackend::Sqlite { path } => {
            let executor: Box<dyn SqlExecutor> = match executor {
                Some(executor) => executor,
                None => Box::new(SqliteExecutor::open(path)?),
            };
            Arc::new(SqlSnapshotStore::new(
                SqlDialect::Sqlite,
                &config.table_prefix,
                None,
                executor,
            )?)
        }
        DurableBackend::MySql(endpoint) => {
            external_sql(SqlDialect::MySql, config, endpoint, executor)?
        }
        DurableBackend::MariaDb(endpoint) => {
            external_sql(SqlDialect::MariaDb, config, endpoint, executor)?
        }
        DurableBackend::Postgres(endpoint) => {
            external_sql(SqlDialect::Postgres, config, endpoint, executor)?
        }
        DurableBackend::Document { dir } => Arc::new(DocumentSnapshotStore::open(dir)?),
    };

    tracing::info!("Durable store backend: {}", store.backend());
    Ok(Some(store))
}

fn external_sql(
    dialect: SqlDialect,
    config: &Config,
    endpoint: &SqlEndpoint,
    executor: Option<Box<dyn SqlExecutor>>,
) -> Result<Arc<dyn DurableStore>> {
    let executor = executor.ok_or_else(|| {
        PartyError::Config(format!(
            "{} backend at {}:{} needs an embedder-supplied SqlExecutor",
            dialect.name(),
            endpoint.hostname,
            endpoint.port
        ))
    })?;
    let schema = matches!(dialect, SqlDialect::Postgres).then_some(endpoint.schema.as_str());
    Ok(Arc::new(SqlSnapshotStore::new(
        dialect,
        &config.table_prefix,
        schema,
        executor,
    )?))
}
