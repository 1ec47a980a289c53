//! SQL snapshot backend
//!
//! Two logical tables, with the statements rendered per dialect:
//!
//! ```text
//! {prefix}parties(leader PK, snapshot NULL, seq, deleted, updated_at)
//! {prefix}settings(player PK, notifications DEFAULT 1)
//! ```
//!
//! `seq` is the [`SnapshotStamp`] sort key of the last accepted write. An
//! upsert only touches an existing row when its `seq` is greater, and a
//! delete is an upsert of a tombstone (`snapshot` NULL, `deleted` 1).
//!
//! Statement execution goes through the narrow [`SqlExecutor`] trait so any
//! driver can be plugged in; SQLite is bundled.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::Connection;

use crate::clock::{Clock, SystemClock};
use crate::error::{PartyError, Result};
use crate::model::{self, Party, PlayerId, PlayerSetting};
use super::{DurableStore, SnapshotStamp};

/// Supported SQL dialects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Sqlite,
    MySql,
    MariaDb,
    Postgres,
}

impl SqlDialect {
    pub fn name(&self) -> &'static str {
        match self {
            SqlDialect::Sqlite => "sqlite",
            SqlDialect::MySql => "mysql",
            SqlDialect::MariaDb => "mariadb",
            SqlDialect::Postgres => "postgres",
        }
    }

    /// Placeholder for the `n`th (1-based) bound parameter
    fn placeholder(&self, n: usize) -> String {
        match self {
            SqlDialect::Postgres => format!("${}", n),
            _ => "?".to_string(),
        }
    }

    fn placeholders(&self, count: usize) -> Vec<String> {
        (1..=count).map(|n| self.placeholder(n)).collect()
    }
}

/// Bound parameter or result column
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Text(String),
}

impl SqlValue {
    fn as_text(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Integer column, also accepting drivers that hand numbers back as text
    fn as_int(&self) -> Option<i64> {
        match self {
            SqlValue::Int(i) => Some(*i),
            SqlValue::Text(s) => s.trim().parse().ok(),
            SqlValue::Null => None,
        }
    }
}

/// Minimal driver interface
pub trait SqlExecutor: Send + Sync {
    /// Run a statement; returns affected rows
    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64>;

    /// Run a query; returns rows in column order
    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Vec<SqlValue>>>;
}

// =============================================================================
// Statements
// =============================================================================

/// Dialect-specific statement text for the snapshot and settings tables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlStatements {
    pub dialect: SqlDialect,
    pub table: String,
    pub settings_table: String,
    pub create: Vec<String>,

    /// Binds leader, snapshot, seq, deleted, updated_at
    pub upsert: String,

    pub select_all: String,
}

impl SqlStatements {
    pub fn new(dialect: SqlDialect, table_prefix: &str, schema: Option<&str>) -> Result<Self> {
        check_identifier("table prefix", table_prefix, true)?;
        if let Some(schema) = schema {
            check_identifier("schema", schema, false)?;
        }

        let qualify = |name: &str| match schema {
            Some(schema) => format!("{}.{}{}", schema, table_prefix, name),
            None => format!("{}{}", table_prefix, name),
        };
        let table = qualify("parties");
        let settings_table = qualify("settings");
        let p = dialect.placeholders(5);

        let mut create = Vec::new();
        let (upsert, select_all) = match dialect {
            SqlDialect::Sqlite => {
                create.push(format!(
                    "CREATE TABLE IF NOT EXISTS {} (leader TEXT NOT NULL PRIMARY KEY, \
                     snapshot TEXT, seq TEXT NOT NULL, deleted INTEGER NOT NULL DEFAULT 0, \
                     updated_at INTEGER NOT NULL)",
                    table
                ));
                (
                    format!(
                        "INSERT INTO {t} (leader, snapshot, seq, deleted, updated_at) \
                         VALUES ({}, {}, {}, {}, {}) \
                         ON CONFLICT(leader) DO UPDATE SET snapshot = excluded.snapshot, \
                         seq = excluded.seq, deleted = excluded.deleted, \
                         updated_at = excluded.updated_at WHERE excluded.seq > {t}.seq",
                        p[0], p[1], p[2], p[3], p[4],
                        t = table
                    ),
                    format!(
                        "SELECT leader, snapshot FROM {} WHERE deleted = 0 ORDER BY leader",
                        table
                    ),
                )
            }
            SqlDialect::MySql | SqlDialect::MariaDb => {
                create.push(format!(
                    "CREATE TABLE IF NOT EXISTS {} (leader VARCHAR(36) NOT NULL PRIMARY KEY, \
                     snapshot LONGTEXT NULL, seq VARCHAR(80) NOT NULL, \
                     deleted TINYINT NOT NULL DEFAULT 0, updated_at BIGINT NOT NULL)",
                    table
                ));
                // Assignments run left to right, so seq is compared before it changes
                let newer = "VALUES(seq) > seq";
                (
                    format!(
                        "INSERT INTO {} (leader, snapshot, seq, deleted, updated_at) \
                         VALUES ({}, {}, {}, {}, {}) ON DUPLICATE KEY UPDATE \
                         snapshot = IF({n}, VALUES(snapshot), snapshot), \
                         deleted = IF({n}, VALUES(deleted), deleted), \
                         updated_at = IF({n}, VALUES(updated_at), updated_at), \
                         seq = IF({n}, VALUES(seq), seq)",
                        table, p[0], p[1], p[2], p[3], p[4],
                        n = newer
                    ),
                    format!(
                        "SELECT leader, snapshot FROM {} WHERE deleted = 0 ORDER BY leader",
                        table
                    ),
                )
            }
            SqlDialect::Postgres => {
                if let Some(schema) = schema {
                    create.push(format!("CREATE SCHEMA IF NOT EXISTS {}", schema));
                }
                create.push(format!(
                    "CREATE TABLE IF NOT EXISTS {} (leader VARCHAR(36) NOT NULL PRIMARY KEY, \
                     snapshot JSONB, seq VARCHAR(80) NOT NULL, \
                     deleted SMALLINT NOT NULL DEFAULT 0, updated_at BIGINT NOT NULL)",
                    table
                ));
                (
                    format!(
                        "INSERT INTO {} AS cur (leader, snapshot, seq, deleted, updated_at) \
                         VALUES ({}, {}::jsonb, {}, {}, {}) \
                         ON CONFLICT (leader) DO UPDATE SET snapshot = EXCLUDED.snapshot, \
                         seq = EXCLUDED.seq, deleted = EXCLUDED.deleted, \
                         updated_at = EXCLUDED.updated_at WHERE EXCLUDED.seq > cur.seq",
                        table, p[0], p[1], p[2], p[3], p[4]
                    ),
                    format!(
                        "SELECT leader, snapshot::text FROM {} WHERE deleted = 0 ORDER BY leader",
                        table
                    ),
                )
            }
        };

        let flag_type = match dialect {
            SqlDialect::Sqlite => "INTEGER",
            SqlDialect::MySql | SqlDialect::MariaDb => "TINYINT",
            SqlDialect::Postgres => "SMALLINT",
        };
        let columns: String = PlayerSetting::ALL
            .iter()
            .map(|setting| format!(", {} {} NOT NULL DEFAULT 1", setting.name(), flag_type))
            .collect();
        create.push(format!(
            "CREATE TABLE IF NOT EXISTS {} (player VARCHAR(36) NOT NULL PRIMARY KEY{})",
            settings_table, columns
        ));

        Ok(Self {
            dialect,
            table,
            settings_table,
            create,
            upsert,
            select_all,
        })
    }

    /// Value of one setting for one player
    pub fn select_setting(&self, setting: PlayerSetting) -> String {
        format!(
            "SELECT {} FROM {} WHERE player = {}",
            setting.name(),
            self.settings_table,
            self.dialect.placeholder(1)
        )
    }

    /// Binds player, value
    pub fn upsert_setting(&self, setting: PlayerSetting) -> String {
        let column = setting.name();
        let (p1, p2) = (self.dialect.placeholder(1), self.dialect.placeholder(2));
        match self.dialect {
            SqlDialect::Sqlite | SqlDialect::Postgres => format!(
                "INSERT INTO {} (player, {c}) VALUES ({}, {}) \
                 ON CONFLICT (player) DO UPDATE SET {c} = EXCLUDED.{c}",
                self.settings_table,
                p1,
                p2,
                c = column
            ),
            SqlDialect::MySql | SqlDialect::MariaDb => format!(
                "INSERT INTO {} (player, {c}) VALUES ({}, {}) \
                 ON DUPLICATE KEY UPDATE {c} = VALUES({c})",
                self.settings_table,
                p1,
                p2,
                c = column
            ),
        }
    }

    /// Stored values of one setting for `count` players
    pub fn select_settings_in(&self, setting: PlayerSetting, count: usize) -> String {
        format!(
            "SELECT player, {} FROM {} WHERE player IN ({})",
            setting.name(),
            self.settings_table,
            self.dialect.placeholders(count).join(", ")
        )
    }
}

/// Identifiers are spliced into statement text, so only `[A-Za-z0-9_]`
fn check_identifier(what: &str, value: &str, allow_empty: bool) -> Result<()> {
    let valid = (allow_empty || !value.is_empty())
        && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(PartyError::Config(format!("invalid SQL {}: {:?}", what, value)));
    }
    Ok(())
}

// =============================================================================
// Snapshot store
// =============================================================================

/// [`DurableStore`] over any SQL dialect
pub struct SqlSnapshotStore {
    dialect: SqlDialect,
    statements: SqlStatements,
    executor: Box<dyn SqlExecutor>,
    clock: SystemClock,
}

impl SqlSnapshotStore {
    /// Wrap `executor`, creating the tables if needed
    pub fn new(
        dialect: SqlDialect,
        table_prefix: &str,
        schema: Option<&str>,
        executor: Box<dyn SqlExecutor>,
    ) -> Result<Self> {
        let statements = SqlStatements::new(dialect, table_prefix, schema)?;
        for statement in &statements.create {
            executor.execute(statement, &[])?;
        }
        tracing::debug!(
            "Tables {} and {} ready ({})",
            statements.table,
            statements.settings_table,
            dialect.name()
        );

        Ok(Self {
            dialect,
            statements,
            executor,
            clock: SystemClock,
        })
    }

    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    pub fn statements(&self) -> &SqlStatements {
        &self.statements
    }

    fn write(&self, leader: PlayerId, document: Option<String>, stamp: SnapshotStamp) -> Result<()> {
        let deleted = document.is_none();
        let applied = self.executor.execute(
            &self.statements.upsert,
            &[
                SqlValue::Text(leader.to_string()),
                document.map_or(SqlValue::Null, SqlValue::Text),
                SqlValue::Text(stamp.sort_key()),
                SqlValue::Int(i64::from(deleted)),
                SqlValue::Int(self.clock.now_millis() as i64),
            ],
        )?;
        if applied == 0 {
            tracing::debug!("Skipped stale snapshot write for {} at {:?}", leader, stamp);
        }
        Ok(())
    }
}

impl DurableStore for SqlSnapshotStore {
    fn upsert_snapshot(&self, party: &Party) -> Result<()> {
        let document = String::from_utf8(model::encode(party)?)
            .map_err(|e| PartyError::Serialization(e.to_string()))?;
        self.write(party.leader, Some(document), SnapshotStamp::of(party))
    }

    fn delete_snapshot(&self, leader: PlayerId, stamp: SnapshotStamp) -> Result<()> {
        self.write(leader, None, stamp)
    }

    fn load_all_snapshots(&self) -> Result<Vec<Party>> {
        let rows = self.executor.query(&self.statements.select_all, &[])?;
        let mut parties = Vec::with_capacity(rows.len());
        for row in rows {
            let (Some(leader), Some(document)) = (
                row.first().and_then(SqlValue::as_text),
                row.get(1).and_then(SqlValue::as_text),
            ) else {
                tracing::warn!("Skipping snapshot row with unexpected columns: {:?}", row);
                continue;
            };
            match model::decode::<Party>(leader, document.as_bytes()) {
                Ok(party) => parties.push(party),
                Err(e) => tracing::warn!("Skipping unreadable snapshot: {}", e),
            }
        }
        Ok(parties)
    }

    fn setting(&self, player: PlayerId, setting: PlayerSetting) -> Result<bool> {
        let rows = self.executor.query(
            &self.statements.select_setting(setting),
            &[SqlValue::Text(player.to_string())],
        )?;
        let stored = rows.first().and_then(|row| row.first()).and_then(SqlValue::as_int);
        Ok(stored.map_or(true, |value| value != 0))
    }

    fn set_setting(&self, player: PlayerId, setting: PlayerSetting, enabled: bool) -> Result<()> {
        self.executor.execute(
            &self.statements.upsert_setting(setting),
            &[
                SqlValue::Text(player.to_string()),
                SqlValue::Int(i64::from(enabled)),
            ],
        )?;
        Ok(())
    }

    fn players_with_setting(&self, players: &[PlayerId], setting: PlayerSetting) -> Result<Vec<PlayerId>> {
        if players.is_empty() {
            return Ok(Vec::new());
        }
        let params: Vec<SqlValue> = players
            .iter()
            .map(|player| SqlValue::Text(player.to_string()))
            .collect();
        let rows = self
            .executor
            .query(&self.statements.select_settings_in(setting, players.len()), &params)?;

        let mut stored = HashMap::with_capacity(rows.len());
        for row in rows {
            let (Some(player), Some(value)) = (
                row.first().and_then(SqlValue::as_text),
                row.get(1).and_then(SqlValue::as_int),
            ) else {
                continue;
            };
            stored.insert(player.to_string(), value != 0);
        }
        Ok(players
            .iter()
            .copied()
            .filter(|player| stored.get(&player.to_string()).copied().unwrap_or(true))
            .collect())
    }

    fn backend(&self) -> &'static str {
        self.dialect.name()
    }
}

// =============================================================================
// SQLite executor
// =============================================================================

/// Bundled SQLite driver
pub struct SqliteExecutor {
    conn: Mutex<Connection>,
}

impl SqliteExecutor {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(sqlite_error)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sqlite_error)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl SqlExecutor for SqliteExecutor {
    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let conn = self.conn.lock();
        let affected = conn
            .execute(sql, rusqlite::params_from_iter(params.iter().map(to_sqlite)))
            .map_err(sqlite_error)?;
        Ok(affected as u64)
    }

    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Vec<SqlValue>>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql).map_err(sqlite_error)?;
        let columns = stmt.column_count();
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params.iter().map(to_sqlite)), |row| {
                (0..columns)
                    .map(|i| row.get::<_, Value>(i).map(from_sqlite))
                    .collect::<rusqlite::Result<Vec<_>>>()
            })
            .map_err(sqlite_error)?;
        let collected = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sqlite_error);
        collected
    }
}

fn to_sqlite(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Int(i) => Value::Integer(*i),
        SqlValue::Text(s) => Value::Text(s.clone()),
    }
}

fn from_sqlite(value: Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(i) => SqlValue::Int(i),
        Value::Real(f) => SqlValue::Text(f.to_string()),
        Value::Text(s) => SqlValue::Text(s),
        Value::Blob(b) => SqlValue::Text(String::from_utf8_lossy(&b).into_owned()),
    }
}

fn sqlite_error(err: rusqlite::Error) -> PartyError {
    PartyError::Durable(format!("sqlite: {}", err))
}
