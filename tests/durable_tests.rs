//! Tests for durable snapshots
//!
//! These tests verify:
//! - Document log persistence, torn-tail truncation and compaction
//! - Stamped writes: stale upserts and deletes never win, tombstones persist
//! - Player settings in both backends
//! - SQL statements per dialect and the bundled SQLite backend
//! - Backend selection from config
//! - The asynchronous mirror
//! - Warm start of a cold shared store, end to end through a node

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::sync::Arc;

use partysync::config::{Config, DurableBackend, SqlEndpoint};
use partysync::coordinator::Coordinator;
use partysync::durable::{
    open_durable, warm_start, DocumentSnapshotStore, DurableStore, MirrorOp, SnapshotMirror,
    SnapshotStamp, SqlDialect, SqlSnapshotStore, SqlStatements, SqliteExecutor,
};
use partysync::model::{Party, PlayerId, PlayerSetting};
use partysync::node::Node;
use partysync::store::{MemoryStore, SharedStore};
use partysync::{PartyError, Result};
use tempfile::TempDir;
use uuid::Uuid;

// =============================================================================
// Helper Functions
// =============================================================================

fn player() -> PlayerId {
    Uuid::new_v4()
}

fn party(size: usize) -> Party {
    let mut party = Party::new(player(), 1_700_000_000_000);
    for _ in 1..size {
        party.members.push(player());
    }
    party
}

fn sqlite_store() -> SqlSnapshotStore {
    SqlSnapshotStore::new(
        SqlDialect::Sqlite,
        "party_",
        None,
        Box::new(SqliteExecutor::open_in_memory().unwrap()),
    )
    .unwrap()
}

/// One store per backend, named for assertion messages
fn backends(temp: &TempDir) -> Vec<(&'static str, Box<dyn DurableStore>)> {
    vec![
        ("sqlite", Box::new(sqlite_store())),
        (
            "document",
            Box::new(DocumentSnapshotStore::open(&temp.path().join("docs")).unwrap()),
        ),
    ]
}

fn at_revision(party: &Party, revision: u64) -> Party {
    let mut copy = party.clone();
    copy.revision = revision;
    copy
}

fn sorted(mut parties: Vec<Party>) -> Vec<Party> {
    parties.sort_by_key(|p| p.leader);
    parties
}

/// Backend that rejects every write
struct FailingStore;

impl DurableStore for FailingStore {
    fn upsert_snapshot(&self, _party: &Party) -> Result<()> {
        Err(PartyError::Durable("backend down".to_string()))
    }

    fn delete_snapshot(&self, _leader: PlayerId, _stamp: SnapshotStamp) -> Result<()> {
        Err(PartyError::Durable("backend down".to_string()))
    }

    fn load_all_snapshots(&self) -> Result<Vec<Party>> {
        Ok(Vec::new())
    }

    fn setting(&self, _player: PlayerId, _setting: PlayerSetting) -> Result<bool> {
        Err(PartyError::Durable("backend down".to_string()))
    }

    fn set_setting(&self, _player: PlayerId, _setting: PlayerSetting, _enabled: bool) -> Result<()> {
        Err(PartyError::Durable("backend down".to_string()))
    }

    fn players_with_setting(&self, _players: &[PlayerId], _setting: PlayerSetting) -> Result<Vec<PlayerId>> {
        Err(PartyError::Durable("backend down".to_string()))
    }

    fn backend(&self) -> &'static str {
        "failing"
    }
}

// =============================================================================
// Document Log Tests
// =============================================================================

#[test]
fn test_document_upsert_and_load() {
    let temp = TempDir::new().unwrap();
    let docs = DocumentSnapshotStore::open(temp.path()).unwrap();
    let (p1, p2) = (party(2), party(3));

    docs.upsert_snapshot(&p1).unwrap();
    docs.upsert_snapshot(&p2).unwrap();

    assert_eq!(sorted(docs.load_all_snapshots().unwrap()), sorted(vec![p1, p2]));
    assert!(docs.path().exists());
}

#[test]
fn test_document_upsert_replaces_and_delete_removes() {
    let temp = TempDir::new().unwrap();
    let docs = DocumentSnapshotStore::open(temp.path()).unwrap();
    let mut p = party(1);

    docs.upsert_snapshot(&p).unwrap();
    p.members.push(player());
    p.revision = 2;
    docs.upsert_snapshot(&p).unwrap();

    assert_eq!(docs.load_all_snapshots().unwrap(), vec![p.clone()]);

    docs.delete_snapshot(p.leader, SnapshotStamp::removal(&p)).unwrap();
    docs.delete_snapshot(player(), SnapshotStamp::removal(&p)).unwrap();
    assert!(docs.is_empty());
}

#[test]
fn test_document_log_survives_reopen() {
    let temp = TempDir::new().unwrap();
    let (kept, deleted) = (party(2), party(1));
    {
        let docs = DocumentSnapshotStore::open(temp.path()).unwrap();
        docs.upsert_snapshot(&kept).unwrap();
        docs.upsert_snapshot(&deleted).unwrap();
        docs.delete_snapshot(deleted.leader, SnapshotStamp::removal(&deleted)).unwrap();
    }

    let docs = DocumentSnapshotStore::open(temp.path()).unwrap();

    assert_eq!(docs.load_all_snapshots().unwrap(), vec![kept]);
    assert_eq!(docs.recovery().records_replayed, 3);
    assert_eq!(docs.recovery().last_lsn, 3);
    assert_eq!(docs.recovery().truncated_bytes, 0);
}

#[test]
fn test_document_log_truncates_torn_tail() {
    let temp = TempDir::new().unwrap();
    let p = party(2);
    let path = {
        let docs = DocumentSnapshotStore::open(temp.path()).unwrap();
        docs.upsert_snapshot(&p).unwrap();
        docs.path()
    };
    let clean_len = fs::metadata(&path).unwrap().len();

    // Half-written header of a second record
    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&[2, 0, 0, 0, 0, 0, 0]).unwrap();
    drop(file);

    let docs = DocumentSnapshotStore::open(temp.path()).unwrap();

    assert_eq!(docs.recovery().truncated_bytes, 7);
    assert_eq!(fs::metadata(&path).unwrap().len(), clean_len);
    assert_eq!(docs.load_all_snapshots().unwrap(), vec![p.clone()]);

    // Appends continue after the valid prefix
    let next = party(1);
    docs.upsert_snapshot(&next).unwrap();
    drop(docs);
    let docs = DocumentSnapshotStore::open(temp.path()).unwrap();
    assert_eq!(docs.len(), 2);
    assert_eq!(docs.recovery().last_lsn, 2);
}

#[test]
fn test_document_log_stops_at_corrupt_record() {
    let temp = TempDir::new().unwrap();
    let (first, second) = (party(1), party(1));
    let path = {
        let docs = DocumentSnapshotStore::open(temp.path()).unwrap();
        docs.upsert_snapshot(&first).unwrap();
        docs.upsert_snapshot(&second).unwrap();
        docs.path()
    };

    let mut bytes = fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    fs::write(&path, &bytes).unwrap();

    let docs = DocumentSnapshotStore::open(temp.path()).unwrap();

    assert_eq!(docs.recovery().records_replayed, 1);
    assert!(docs.recovery().truncated_bytes > 0);
    assert_eq!(docs.load_all_snapshots().unwrap(), vec![first]);
}

#[test]
fn test_document_log_compaction() {
    let temp = TempDir::new().unwrap();
    let docs = DocumentSnapshotStore::open(temp.path()).unwrap();
    let mut p = party(1);

    for revision in 1..=10 {
        p.revision = revision;
        docs.upsert_snapshot(&p).unwrap();
    }
    let before = fs::metadata(docs.path()).unwrap().len();

    docs.compact().unwrap();

    assert!(fs::metadata(docs.path()).unwrap().len() < before);
    assert_eq!(docs.load_all_snapshots().unwrap(), vec![p.clone()]);

    drop(docs);
    let docs = DocumentSnapshotStore::open(temp.path()).unwrap();
    assert_eq!(docs.recovery().records_replayed, 1);
    assert_eq!(docs.load_all_snapshots().unwrap()[0].revision, 10);
}

#[test]
fn test_document_log_compacts_automatically() {
    let temp = TempDir::new().unwrap();
    let docs = DocumentSnapshotStore::open(temp.path()).unwrap();
    let mut p = party(1);

    for revision in 1..=200 {
        p.revision = revision;
        docs.upsert_snapshot(&p).unwrap();
    }
    drop(docs);

    let docs = DocumentSnapshotStore::open(temp.path()).unwrap();
    assert!(docs.recovery().records_replayed < 200);
    assert_eq!(docs.load_all_snapshots().unwrap()[0].revision, 200);
}

// =============================================================================
// SQL Tests
// =============================================================================

#[test]
fn test_sqlite_upsert_load_delete() {
    let sql = sqlite_store();
    let mut p = party(2);

    sql.upsert_snapshot(&p).unwrap();
    p.open = true;
    p.revision = 2;
    sql.upsert_snapshot(&p).unwrap();

    assert_eq!(sql.load_all_snapshots().unwrap(), vec![p.clone()]);

    sql.delete_snapshot(p.leader, SnapshotStamp::removal(&p)).unwrap();
    assert!(sql.load_all_snapshots().unwrap().is_empty());
    assert_eq!(sql.backend(), "sqlite");
}

#[test]
fn test_sqlite_file_survives_reopen() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("db").join("parties.sqlite");
    let p = party(3);
    {
        let executor = SqliteExecutor::open(&path).unwrap();
        let sql = SqlSnapshotStore::new(SqlDialect::Sqlite, "test_", None, Box::new(executor)).unwrap();
        sql.upsert_snapshot(&p).unwrap();
    }

    let executor = SqliteExecutor::open(&path).unwrap();
    let sql = SqlSnapshotStore::new(SqlDialect::Sqlite, "test_", None, Box::new(executor)).unwrap();

    assert_eq!(sql.load_all_snapshots().unwrap(), vec![p]);
    assert_eq!(sql.statements().table, "test_parties");
}

#[test]
fn test_statements_mysql() {
    let stmts = SqlStatements::new(SqlDialect::MySql, "party_", None).unwrap();

    assert_eq!(stmts.table, "party_parties");
    assert_eq!(stmts.settings_table, "party_settings");
    assert!(stmts.create[0].contains("LONGTEXT"));
    assert!(stmts.create[1].contains("notifications TINYINT NOT NULL DEFAULT 1"));
    assert!(stmts.upsert.contains("ON DUPLICATE KEY UPDATE"));
    assert!(stmts.upsert.contains("VALUES (?, ?, ?, ?, ?)"));
    assert!(stmts.upsert.ends_with("seq = IF(VALUES(seq) > seq, VALUES(seq), seq)"));
    assert!(stmts
        .upsert_setting(PlayerSetting::Notifications)
        .contains("ON DUPLICATE KEY UPDATE notifications = VALUES(notifications)"));
}

#[test]
fn test_statements_mariadb_match_mysql() {
    let mysql = SqlStatements::new(SqlDialect::MySql, "p_", None).unwrap();
    let maria = SqlStatements::new(SqlDialect::MariaDb, "p_", None).unwrap();
    assert_eq!(mysql, maria);
}

#[test]
fn test_statements_postgres() {
    let stmts = SqlStatements::new(SqlDialect::Postgres, "party_", Some("games")).unwrap();

    assert_eq!(stmts.table, "games.party_parties");
    assert_eq!(stmts.create[0], "CREATE SCHEMA IF NOT EXISTS games");
    assert!(stmts.create[1].contains("JSONB"));
    assert!(stmts.upsert.contains("VALUES ($1, $2::jsonb, $3, $4, $5)"));
    assert!(stmts.upsert.contains("ON CONFLICT (leader)"));
    assert!(stmts.upsert.contains("WHERE EXCLUDED.seq > cur.seq"));
    assert!(stmts.select_all.contains("snapshot::text"));
    assert!(stmts.select_all.contains("deleted = 0"));
    assert_eq!(
        stmts.select_settings_in(PlayerSetting::Notifications, 3),
        "SELECT player, notifications FROM games.party_settings WHERE player IN ($1, $2, $3)"
    );
}

#[test]
fn test_statements_reject_unsafe_identifiers() {
    assert!(SqlStatements::new(SqlDialect::Sqlite, "x; DROP TABLE y", None).is_err());
    assert!(SqlStatements::new(SqlDialect::Postgres, "ok_", Some("bad-schema")).is_err());
    assert!(SqlStatements::new(SqlDialect::Postgres, "ok_", Some("")).is_err());
    assert!(SqlStatements::new(SqlDialect::Sqlite, "", None).is_ok());
}

// =============================================================================
// Snapshot Ordering Tests
// =============================================================================

#[test]
fn test_stale_upsert_keeps_newer_snapshot() {
    let temp = TempDir::new().unwrap();
    let p = party(2);

    for (name, store) in backends(&temp) {
        store.upsert_snapshot(&at_revision(&p, 3)).unwrap();
        store.upsert_snapshot(&at_revision(&p, 1)).unwrap();

        let loaded = store.load_all_snapshots().unwrap();
        assert_eq!(loaded.len(), 1, "{}", name);
        assert_eq!(loaded[0].revision, 3, "{}", name);
    }
}

#[test]
fn test_late_upsert_cannot_resurrect_deleted_party() {
    let temp = TempDir::new().unwrap();
    let p = at_revision(&party(2), 4);

    for (name, store) in backends(&temp) {
        store.upsert_snapshot(&p).unwrap();
        store.delete_snapshot(p.leader, SnapshotStamp::removal(&p)).unwrap();

        // Mirrors on other nodes delivering older states afterwards
        store.upsert_snapshot(&p).unwrap();
        store.upsert_snapshot(&at_revision(&p, 2)).unwrap();

        assert!(store.load_all_snapshots().unwrap().is_empty(), "{}", name);
    }
}

#[test]
fn test_stale_delete_keeps_newer_snapshot() {
    let temp = TempDir::new().unwrap();
    let p = party(1);

    for (name, store) in backends(&temp) {
        store.upsert_snapshot(&at_revision(&p, 5)).unwrap();
        store
            .delete_snapshot(p.leader, SnapshotStamp::removal(&at_revision(&p, 2)))
            .unwrap();

        assert_eq!(store.load_all_snapshots().unwrap().len(), 1, "{}", name);
    }
}

#[test]
fn test_new_party_after_delete_is_stored() {
    let temp = TempDir::new().unwrap();
    let old = party(2);
    let fresh = Party::new(old.leader, old.created_at + 1);

    for (name, store) in backends(&temp) {
        store.upsert_snapshot(&old).unwrap();
        store.delete_snapshot(old.leader, SnapshotStamp::removal(&old)).unwrap();
        store.upsert_snapshot(&fresh).unwrap();

        assert_eq!(store.load_all_snapshots().unwrap(), vec![fresh.clone()], "{}", name);
    }
}

#[test]
fn test_leader_key_regained_within_same_party() {
    let temp = TempDir::new().unwrap();
    let p = party(2);
    let (a, b) = (p.members[0], p.members[1]);

    for (name, store) in backends(&temp) {
        // a hands leadership to b, then b hands it back
        store.upsert_snapshot(&p).unwrap();
        let mut handed = at_revision(&p, 2);
        handed.leader = b;
        store.delete_snapshot(a, SnapshotStamp::of(&handed)).unwrap();
        store.upsert_snapshot(&handed).unwrap();

        let mut back = at_revision(&p, 3);
        back.leader = a;
        store.delete_snapshot(b, SnapshotStamp::of(&back)).unwrap();
        store.upsert_snapshot(&back).unwrap();

        assert_eq!(store.load_all_snapshots().unwrap(), vec![back.clone()], "{}", name);
    }
}

#[test]
fn test_document_tombstone_survives_compaction_and_reopen() {
    let temp = TempDir::new().unwrap();
    let p = party(2);
    {
        let docs = DocumentSnapshotStore::open(temp.path()).unwrap();
        docs.upsert_snapshot(&p).unwrap();
        docs.delete_snapshot(p.leader, SnapshotStamp::removal(&p)).unwrap();
        docs.compact().unwrap();
    }

    let docs = DocumentSnapshotStore::open(temp.path()).unwrap();
    assert_eq!(docs.recovery().records_replayed, 1);

    docs.upsert_snapshot(&p).unwrap();
    assert!(docs.is_empty());
}

#[test]
fn test_sqlite_tombstone_survives_reopen() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("parties.sqlite");
    let p = party(2);
    {
        let executor = SqliteExecutor::open(&path).unwrap();
        let sql = SqlSnapshotStore::new(SqlDialect::Sqlite, "party_", None, Box::new(executor)).unwrap();
        sql.upsert_snapshot(&p).unwrap();
        sql.delete_snapshot(p.leader, SnapshotStamp::removal(&p)).unwrap();
    }

    let executor = SqliteExecutor::open(&path).unwrap();
    let sql = SqlSnapshotStore::new(SqlDialect::Sqlite, "party_", None, Box::new(executor)).unwrap();
    sql.upsert_snapshot(&p).unwrap();

    assert!(sql.load_all_snapshots().unwrap().is_empty());
}

#[test]
fn test_stamp_order_matches_sort_key_order() {
    let p = party(1);
    let stamps = vec![
        SnapshotStamp::of(&at_revision(&p, 9)),
        SnapshotStamp::of(&at_revision(&p, 10)),
        SnapshotStamp::removal(&at_revision(&p, 10)),
        SnapshotStamp::of(&Party::new(p.leader, p.created_at + 1)),
    ];

    for pair in stamps.windows(2) {
        assert!(pair[0] < pair[1]);
        assert!(pair[0].sort_key() < pair[1].sort_key());
    }
}

// =============================================================================
// Player Setting Tests
// =============================================================================

#[test]
fn test_settings_default_enabled_and_toggle() {
    let temp = TempDir::new().unwrap();
    let p = player();

    for (name, store) in backends(&temp) {
        assert!(store.setting(p, PlayerSetting::Notifications).unwrap(), "{}", name);

        store.set_setting(p, PlayerSetting::Notifications, false).unwrap();
        assert!(!store.setting(p, PlayerSetting::Notifications).unwrap(), "{}", name);

        store.set_setting(p, PlayerSetting::Notifications, true).unwrap();
        assert!(store.setting(p, PlayerSetting::Notifications).unwrap(), "{}", name);
    }
}

#[test]
fn test_players_with_setting_filters_in_input_order() {
    let temp = TempDir::new().unwrap();
    let (a, b, c, d) = (player(), player(), player(), player());

    for (name, store) in backends(&temp) {
        store.set_setting(b, PlayerSetting::Notifications, false).unwrap();
        store.set_setting(c, PlayerSetting::Notifications, true).unwrap();
        store.set_setting(d, PlayerSetting::Notifications, false).unwrap();

        let enabled = store
            .players_with_setting(&[d, c, b, a], PlayerSetting::Notifications)
            .unwrap();
        assert_eq!(enabled, vec![c, a], "{}", name);
        assert!(store
            .players_with_setting(&[], PlayerSetting::Notifications)
            .unwrap()
            .is_empty());
    }
}

#[test]
fn test_document_settings_survive_compaction_and_reopen() {
    let temp = TempDir::new().unwrap();
    let (quiet, loud) = (player(), player());
    {
        let docs = DocumentSnapshotStore::open(temp.path()).unwrap();
        docs.set_setting(quiet, PlayerSetting::Notifications, true).unwrap();
        docs.set_setting(quiet, PlayerSetting::Notifications, false).unwrap();
        docs.set_setting(loud, PlayerSetting::Notifications, true).unwrap();
        docs.compact().unwrap();
    }

    let docs = DocumentSnapshotStore::open(temp.path()).unwrap();

    assert_eq!(docs.recovery().records_replayed, 2);
    assert!(!docs.setting(quiet, PlayerSetting::Notifications).unwrap());
    assert!(docs.setting(loud, PlayerSetting::Notifications).unwrap());
}

#[test]
fn test_sqlite_settings_survive_reopen() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("settings.sqlite");
    let quiet = player();
    {
        let executor = SqliteExecutor::open(&path).unwrap();
        let sql = SqlSnapshotStore::new(SqlDialect::Sqlite, "party_", None, Box::new(executor)).unwrap();
        sql.set_setting(quiet, PlayerSetting::Notifications, false).unwrap();
    }

    let executor = SqliteExecutor::open(&path).unwrap();
    let sql = SqlSnapshotStore::new(SqlDialect::Sqlite, "party_", None, Box::new(executor)).unwrap();

    assert!(!sql.setting(quiet, PlayerSetting::Notifications).unwrap());
}

#[test]
fn test_player_setting_names() {
    assert_eq!(
        "notifications".parse::<PlayerSetting>().unwrap(),
        PlayerSetting::Notifications
    );
    assert_eq!(
        " NOTIFICATIONS ".parse::<PlayerSetting>().unwrap(),
        PlayerSetting::Notifications
    );
    assert_eq!(PlayerSetting::Notifications.to_string(), "notifications");

    let err = "volume".parse::<PlayerSetting>().unwrap_err();
    assert!(matches!(err, PartyError::UnknownSetting(ref name) if name == "volume"));
    assert!(err.is_validation());
}

// =============================================================================
// Backend Selection Tests
// =============================================================================

#[test]
fn test_open_durable_disabled() {
    assert!(open_durable(&Config::default(), None).unwrap().is_none());
}

#[test]
fn test_open_durable_sqlite_and_document() {
    let temp = TempDir::new().unwrap();

    let sqlite = Config::builder()
        .durable(DurableBackend::Sqlite {
            path: temp.path().join("snap.db"),
        })
        .build();
    assert_eq!(open_durable(&sqlite, None).unwrap().unwrap().backend(), "sqlite");

    let document = Config::builder()
        .durable(DurableBackend::Document {
            dir: temp.path().join("docs"),
        })
        .build();
    assert_eq!(open_durable(&document, None).unwrap().unwrap().backend(), "document");
}

#[test]
fn test_open_durable_external_sql_needs_executor() {
    let config = Config::builder()
        .durable(DurableBackend::Postgres(SqlEndpoint::default()))
        .build();

    assert!(matches!(open_durable(&config, None), Err(PartyError::Config(_))));

    // SQLite accepts the MySQL-family DDL, so it can stand in as the driver
    let maria = Config::builder()
        .durable(DurableBackend::MariaDb(SqlEndpoint::default()))
        .table_prefix("m_")
        .build();
    let executor = Box::new(SqliteExecutor::open_in_memory().unwrap());
    let store = open_durable(&maria, Some(executor)).unwrap().unwrap();
    assert_eq!(store.backend(), "mariadb");
}

// =============================================================================
// Mirror Tests
// =============================================================================

#[test]
fn test_mirror_flush_writes_last_state() {
    let sql: Arc<dyn DurableStore> = Arc::new(sqlite_store());
    let mirror = SnapshotMirror::start(Arc::clone(&sql), 16).unwrap();
    let mut p = party(1);
    let gone = party(2);

    for revision in 1..=5 {
        p.revision = revision;
        mirror.enqueue(MirrorOp::Upsert(p.clone()));
    }
    mirror.enqueue(MirrorOp::Upsert(gone.clone()));
    mirror.enqueue(MirrorOp::removal(&gone));
    mirror.flush();

    assert_eq!(sql.load_all_snapshots().unwrap(), vec![p]);
    let stats = mirror.stats();
    assert_eq!(stats.applied + stats.coalesced, 7);
    assert_eq!(stats.failed, 0);
}

#[test]
fn test_mirror_out_of_order_ops_keep_newest_state() {
    let sql: Arc<dyn DurableStore> = Arc::new(sqlite_store());
    let mirror = SnapshotMirror::start(Arc::clone(&sql), 16).unwrap();
    let p = party(2);
    let gone = at_revision(&party(1), 3);

    mirror.enqueue(MirrorOp::Upsert(at_revision(&p, 5)));
    mirror.enqueue(MirrorOp::Upsert(at_revision(&p, 3)));
    mirror.enqueue(MirrorOp::removal(&gone));
    mirror.enqueue(MirrorOp::Upsert(gone.clone()));
    mirror.flush();

    let snapshots = sql.load_all_snapshots().unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].leader, p.leader);
    assert_eq!(snapshots[0].revision, 5);
}

#[test]
fn test_mirror_counts_failures() {
    let mirror = SnapshotMirror::start(Arc::new(FailingStore), 4).unwrap();

    mirror.enqueue(MirrorOp::Upsert(party(1)));
    mirror.enqueue(MirrorOp::removal(&party(1)));
    mirror.flush();

    assert_eq!(mirror.stats().failed, 2);
    assert_eq!(mirror.backend(), "failing");
}

#[test]
fn test_mirror_shutdown_drains_queue() {
    let sql: Arc<dyn DurableStore> = Arc::new(sqlite_store());
    let mirror = SnapshotMirror::start(Arc::clone(&sql), 64).unwrap();
    let parties: Vec<Party> = (0..10).map(|_| party(1)).collect();

    for p in &parties {
        mirror.enqueue(MirrorOp::Upsert(p.clone()));
    }
    mirror.shutdown();
    mirror.shutdown();

    assert_eq!(sql.load_all_snapshots().unwrap().len(), 10);
    mirror.enqueue(MirrorOp::Upsert(party(1)));
}

#[test]
fn test_coordinator_mirrors_lifecycle() {
    let sql: Arc<dyn DurableStore> = Arc::new(sqlite_store());
    let mirror = Arc::new(SnapshotMirror::start(Arc::clone(&sql), 8).unwrap());
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let coord = Coordinator::new(store, &Config::default()).with_mirror(Arc::clone(&mirror));
    let (a, b, c) = (player(), player(), player());

    coord.create_party(a).unwrap();
    coord.invite(a, b).unwrap();
    coord.accept_invite(b, a).unwrap();
    coord.create_party(c).unwrap();
    coord.leave_party(a).unwrap();
    coord.disband(c).unwrap();
    mirror.flush();

    let snapshots = sql.load_all_snapshots().unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].leader, b);
    assert_eq!(snapshots[0].members, vec![b]);
}

// =============================================================================
// Warm Start Tests
// =============================================================================

#[test]
fn test_warm_start_restores_cold_store() {
    let sql = sqlite_store();
    let (p1, p2) = (party(3), party(1));
    sql.upsert_snapshot(&p1).unwrap();
    sql.upsert_snapshot(&p2).unwrap();

    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let report = warm_start(store.as_ref(), &sql).unwrap();

    assert!(report.store_was_cold);
    assert_eq!(report.restored, 2);

    let coord = Coordinator::new(store, &Config::default());
    assert_eq!(coord.party(p1.leader).unwrap(), Some(p1.clone()));
    assert_eq!(coord.party_of(p1.members[2]).unwrap().unwrap().id, p1.id);

    // Restored parties are live
    let newcomer = player();
    coord.invite(p1.leader, newcomer).unwrap();
    assert_eq!(coord.accept_invite(newcomer, p1.leader).unwrap().size(), 4);
}

#[test]
fn test_warm_start_skips_populated_store() {
    let sql = sqlite_store();
    sql.upsert_snapshot(&party(2)).unwrap();

    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    Coordinator::new(Arc::clone(&store), &Config::default())
        .create_party(player())
        .unwrap();

    let report = warm_start(store.as_ref(), &sql).unwrap();
    assert!(!report.store_was_cold);
    assert_eq!(report.restored, 0);
}

#[test]
fn test_warm_start_skips_invalid_and_conflicting_snapshots() {
    let sql = sqlite_store();
    let valid = party(2);
    let mut leaderless = party(2);
    leaderless.members.remove(0);
    let mut overlapping = party(1);
    overlapping.members.push(valid.members[1]);

    sql.upsert_snapshot(&valid).unwrap();
    sql.upsert_snapshot(&leaderless).unwrap();
    sql.upsert_snapshot(&overlapping).unwrap();

    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let report = warm_start(store.as_ref(), &sql).unwrap();

    // The leaderless snapshot is invalid; of the two sharing a member,
    // whichever loads second conflicts
    assert_eq!(report.restored, 1);
    assert_eq!(report.skipped, 2);
}

#[test]
fn test_node_recovers_parties_after_full_restart() {
    let temp = TempDir::new().unwrap();
    let config = Config::builder()
        .node_id("node-a")
        .durable(DurableBackend::Document {
            dir: temp.path().to_path_buf(),
        })
        .build();
    let (a, b, c) = (player(), player(), player());

    {
        let node = Node::start(config.clone()).unwrap();
        let coord = node.coordinator();
        coord.create_party(a).unwrap();
        coord.invite(a, b).unwrap();
        coord.accept_invite(b, a).unwrap();
        coord.create_party(c).unwrap();
        coord.disband(c).unwrap();
        node.shutdown();
    }

    // Fresh in-memory store: everything comes back from snapshots
    let node = Node::start(config).unwrap();

    assert_eq!(node.warm_start_report().restored, 1);
    let party = node.coordinator().party_of(b).unwrap().unwrap();
    assert_eq!(party.leader, a);
    assert_eq!(party.members, vec![a, b]);
    assert!(node.coordinator().party(c).unwrap().is_none());
    assert_eq!(node.projection().party_of(b).unwrap().leader, a);
}
