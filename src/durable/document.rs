//! Document snapshot backend
//!
//! Append-only log of JSON party documents keyed by leader, plus player
//! settings.
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ Record 1                                │
//! │ ┌─────────┬─────────┬────────┬────────┐ │
//! │ │ LSN (8) │ CRC (4) │Len (4) │ Data   │ │
//! │ └─────────┴─────────┴────────┴────────┘ │
//! ├─────────────────────────────────────────┤
//! │ Record 2 ...                            │
//! └─────────────────────────────────────────┘
//! Data = bincode(LogRecord); CRC32 covers Data
//! ```
//!
//! ## Ordering
//! Each leader entry remembers the stamp of its last accepted write. Stale
//! writes are dropped before they reach the log. A delete leaves a tombstone
//! entry that lives on through compaction.
//!
//! ## Recovery
//! On open the log is replayed into an in-memory index. The first record
//! that is incomplete or fails its CRC marks a torn tail: the file is
//! truncated there and everything before it is kept.
//!
//! ## Compaction
//! Superseded records accumulate; once they outnumber live entries the log
//! is rewritten with one record per entry and setting, and swapped in by
//! rename.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{PartyError, Result};
use crate::model::{self, Party, PlayerId, PlayerSetting};
use super::{DurableStore, SnapshotStamp};

/// LSN (8) + CRC (4) + length (4)
pub const RECORD_HEADER_SIZE: usize = 16;

const LOG_FILENAME: &str = "snapshots.log";
const COMPACT_FILENAME: &str = "snapshots.log.compact";

/// Dead records tolerated before compaction is considered
const COMPACT_MIN_DEAD: usize = 64;

/// Largest record accepted on replay
const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

/// Logged operation
#[derive(Debug, Clone, Serialize, Deserialize)]
enum LogRecord {
    /// `document` is the JSON form of the party
    Upsert {
        leader: PlayerId,
        stamp: SnapshotStamp,
        document: Vec<u8>,
    },
    Delete {
        leader: PlayerId,
        stamp: SnapshotStamp,
    },
    Setting {
        player: PlayerId,
        setting: PlayerSetting,
        enabled: bool,
    },
}

/// What replay found when the log was opened
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogRecovery {
    /// Records applied to the index
    pub records_replayed: u64,

    /// Last valid LSN
    pub last_lsn: u64,

    /// Bytes cut from a torn or corrupt tail
    pub truncated_bytes: u64,
}

/// Last accepted write under one leader; `document` is None for a tombstone
#[derive(Debug, Clone)]
struct Entry {
    stamp: SnapshotStamp,
    document: Option<Vec<u8>>,
}

/// In-memory state rebuilt from the log
#[derive(Debug, Default)]
struct Index {
    entries: BTreeMap<PlayerId, Entry>,
    settings: BTreeMap<(PlayerId, PlayerSetting), bool>,
    /// Records in the file that no longer describe current state
    dead_records: usize,
}

impl Index {
    /// Whether `record` would be ignored because a newer write is indexed
    fn is_stale(&self, record: &LogRecord) -> bool {
        let (leader, stamp) = match record {
            LogRecord::Upsert { leader, stamp, .. } | LogRecord::Delete { leader, stamp } => {
                (leader, stamp)
            }
            LogRecord::Setting { .. } => return false,
        };
        self.entries
            .get(leader)
            .map_or(false, |entry| entry.stamp >= *stamp)
    }

    fn apply(&mut self, record: LogRecord) {
        if self.is_stale(&record) {
            self.dead_records += 1;
            return;
        }
        let replaced = match record {
            LogRecord::Upsert {
                leader,
                stamp,
                document,
            } => self
                .entries
                .insert(
                    leader,
                    Entry {
                        stamp,
                        document: Some(document),
                    },
                )
                .is_some(),
            LogRecord::Delete { leader, stamp } => self
                .entries
                .insert(
                    leader,
                    Entry {
                        stamp,
                        document: None,
                    },
                )
                .is_some(),
            LogRecord::Setting {
                player,
                setting,
                enabled,
            } => self.settings.insert((player, setting), enabled).is_some(),
        };
        if replaced {
            self.dead_records += 1;
        }
    }

    fn live_documents(&self) -> usize {
        self.entries.values().filter(|e| e.document.is_some()).count()
    }

    /// Records a fully compacted log would hold
    fn live_records(&self) -> usize {
        self.entries.len() + self.settings.len()
    }

    fn setting(&self, player: PlayerId, setting: PlayerSetting) -> bool {
        self.settings.get(&(player, setting)).copied().unwrap_or(true)
    }
}

struct DocumentLog {
    file: File,
    index: Index,
    next_lsn: u64,
}

/// [`DurableStore`] writing to a local document log
pub struct DocumentSnapshotStore {
    dir: PathBuf,
    log: Mutex<DocumentLog>,
    recovery: LogRecovery,
}

impl DocumentSnapshotStore {
    /// Open or create the log in `dir`, replaying what is there
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILENAME);

        let mut bytes = Vec::new();
        if path.exists() {
            File::open(&path)?.read_to_end(&mut bytes)?;
        }
        let (index, recovery) = replay(&bytes);

        if recovery.truncated_bytes > 0 {
            tracing::warn!(
                "Document log {:?}: truncating {} bytes of torn tail after LSN {}",
                path,
                recovery.truncated_bytes,
                recovery.last_lsn
            );
            let keep = bytes.len() as u64 - recovery.truncated_bytes;
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(keep)?;
            file.sync_all()?;
        }
        if recovery.records_replayed > 0 {
            tracing::debug!(
                "Document log recovery: {} records, {} documents, last_lsn={}",
                recovery.records_replayed,
                index.live_documents(),
                recovery.last_lsn
            );
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            log: Mutex::new(DocumentLog {
                file,
                index,
                next_lsn: recovery.last_lsn + 1,
            }),
            recovery,
        })
    }

    /// Replay statistics from [`open`](Self::open)
    pub fn recovery(&self) -> &LogRecovery {
        &self.recovery
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(LOG_FILENAME)
    }

    /// Number of live documents; tombstones are not counted
    pub fn len(&self) -> usize {
        self.log.lock().index.live_documents()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrite the log with only current entries and settings
    pub fn compact(&self) -> Result<()> {
        let mut log = self.log.lock();
        self.compact_locked(&mut log)
    }

    fn compact_locked(&self, log: &mut DocumentLog) -> Result<()> {
        let tmp_path = self.dir.join(COMPACT_FILENAME);
        let mut tmp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;

        let mut lsn = 0;
        for (leader, entry) in &log.index.entries {
            lsn += 1;
            let record = match &entry.document {
                Some(document) => LogRecord::Upsert {
                    leader: *leader,
                    stamp: entry.stamp,
                    document: document.clone(),
                },
                None => LogRecord::Delete {
                    leader: *leader,
                    stamp: entry.stamp,
                },
            };
            tmp.write_all(&frame(lsn, &record)?)?;
        }
        for ((player, setting), enabled) in &log.index.settings {
            lsn += 1;
            let record = LogRecord::Setting {
                player: *player,
                setting: *setting,
                enabled: *enabled,
            };
            tmp.write_all(&frame(lsn, &record)?)?;
        }
        tmp.sync_all()?;
        drop(tmp);

        fs::rename(&tmp_path, self.path())?;
        log.file = OpenOptions::new().append(true).open(self.path())?;
        log.next_lsn = lsn + 1;
        let dropped = log.index.dead_records;
        log.index.dead_records = 0;

        tracing::debug!(
            "Compacted document log: {} live, {} dropped",
            log.index.live_records(),
            dropped
        );
        Ok(())
    }

    fn append(&self, record: LogRecord) -> Result<()> {
        let mut log = self.log.lock();
        if log.index.is_stale(&record) {
            tracing::debug!("Skipping stale document log write: {:?}", record_key(&record));
            return Ok(());
        }

        let lsn = log.next_lsn;
        log.file.write_all(&frame(lsn, &record)?)?;
        log.file.sync_data()?;
        log.next_lsn += 1;
        log.index.apply(record);

        let index = &log.index;
        if index.dead_records >= COMPACT_MIN_DEAD && index.dead_records > index.live_records() {
            if let Err(e) = self.compact_locked(&mut log) {
                tracing::warn!("Document log compaction failed: {}", e);
            }
        }
        Ok(())
    }
}

fn record_key(record: &LogRecord) -> PlayerId {
    match record {
        LogRecord::Upsert { leader, .. } | LogRecord::Delete { leader, .. } => *leader,
        LogRecord::Setting { player, .. } => *player,
    }
}

impl DurableStore for DocumentSnapshotStore {
    fn upsert_snapshot(&self, party: &Party) -> Result<()> {
        self.append(LogRecord::Upsert {
            leader: party.leader,
            stamp: SnapshotStamp::of(party),
            document: model::encode(party)?,
        })
    }

    fn delete_snapshot(&self, leader: PlayerId, stamp: SnapshotStamp) -> Result<()> {
        self.append(LogRecord::Delete { leader, stamp })
    }

    fn load_all_snapshots(&self) -> Result<Vec<Party>> {
        let log = self.log.lock();
        let mut parties = Vec::with_capacity(log.index.entries.len());
        for (leader, entry) in &log.index.entries {
            let Some(document) = &entry.document else {
                continue;
            };
            match model::decode::<Party>(&leader.to_string(), document) {
                Ok(party) => parties.push(party),
                Err(e) => tracing::warn!("Skipping unreadable snapshot: {}", e),
            }
        }
        Ok(parties)
    }

    fn setting(&self, player: PlayerId, setting: PlayerSetting) -> Result<bool> {
        Ok(self.log.lock().index.setting(player, setting))
    }

    fn set_setting(&self, player: PlayerId, setting: PlayerSetting, enabled: bool) -> Result<()> {
        self.append(LogRecord::Setting {
            player,
            setting,
            enabled,
        })
    }

    fn players_with_setting(&self, players: &[PlayerId], setting: PlayerSetting) -> Result<Vec<PlayerId>> {
        let log = self.log.lock();
        Ok(players
            .iter()
            .copied()
            .filter(|player| log.index.setting(*player, setting))
            .collect())
    }

    fn backend(&self) -> &'static str {
        "document"
    }
}

// =============================================================================
// Framing
// =============================================================================

fn frame(lsn: u64, record: &LogRecord) -> Result<Vec<u8>> {
    let data = bincode::serialize(record)?;
    let crc = crc32fast::hash(&data);

    let mut out = Vec::with_capacity(RECORD_HEADER_SIZE + data.len());
    out.extend_from_slice(&lsn.to_le_bytes());
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&data);
    Ok(out)
}

/// Parse one record at the start of `bytes`; returns it with its total size
fn parse_record(bytes: &[u8]) -> Result<(u64, LogRecord, usize)> {
    if bytes.len() < RECORD_HEADER_SIZE {
        return Err(PartyError::Corruption("incomplete record header".to_string()));
    }
    let mut lsn = [0u8; 8];
    lsn.copy_from_slice(&bytes[0..8]);
    let mut crc = [0u8; 4];
    crc.copy_from_slice(&bytes[8..12]);
    let mut len = [0u8; 4];
    len.copy_from_slice(&bytes[12..16]);

    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_RECORD_SIZE {
        return Err(PartyError::Corruption(format!("record length {} too large", len)));
    }
    let end = RECORD_HEADER_SIZE + len;
    if bytes.len() < end {
        return Err(PartyError::Corruption("incomplete record data".to_string()));
    }

    let data = &bytes[RECORD_HEADER_SIZE..end];
    if crc32fast::hash(data) != u32::from_le_bytes(crc) {
        return Err(PartyError::Corruption("record CRC mismatch".to_string()));
    }
    let record = bincode::deserialize(data)?;
    Ok((u64::from_le_bytes(lsn), record, end))
}

/// Rebuild the index from raw log bytes
fn replay(bytes: &[u8]) -> (Index, LogRecovery) {
    let mut index = Index::default();
    let mut recovery = LogRecovery::default();
    let mut pos = 0;

    while pos < bytes.len() {
        let (lsn, record, size) = match parse_record(&bytes[pos..]) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!("Document log replay stopped at offset {}: {}", pos, e);
                recovery.truncated_bytes = (bytes.len() - pos) as u64;
                break;
            }
        };
        index.apply(record);
        recovery.records_replayed += 1;
        recovery.last_lsn = lsn;
        pos += size;
    }

    (index, recovery)
}
