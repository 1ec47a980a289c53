//! In-memory store
//!
//! BTreeMap keyspace behind a RwLock, with TTL evaluated against a [`Clock`].
//!
//! ## Concurrency Model
//! - `get`/`scan` take the read lock (many concurrent readers)
//! - `commit` takes the write lock, so check-then-apply is atomic
//! - pub/sub fan-out uses bounded crossbeam channels; a subscriber that
//!   falls too far behind loses messages instead of stalling publishers

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{self, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};

use crate::clock::{system_clock, SharedClock};
use crate::error::Result;
use super::{CommitOutcome, Message, SharedStore, Subscription, Transaction, Version, Versioned, WriteOp};

/// Per-subscriber queue depth
const SUBSCRIBER_CAPACITY: usize = 1024;

/// A stored value
#[derive(Debug, Clone)]
struct Slot {
    value: Bytes,
    version: Version,
    /// Unix millis; live while `now < expires_at`
    expires_at: Option<u64>,
}

impl Slot {
    fn is_live(&self, now: u64) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

#[derive(Debug, Default)]
struct Keyspace {
    data: BTreeMap<String, Slot>,
    /// Last version handed out
    last_version: u64,
}

impl Keyspace {
    fn live(&self, key: &str, now: u64) -> Option<&Slot> {
        self.data.get(key).filter(|slot| slot.is_live(now))
    }
}

/// Shared store held entirely in process memory
pub struct MemoryStore {
    keyspace: RwLock<Keyspace>,

    /// channel -> subscriber queues
    channels: Mutex<HashMap<String, Vec<Sender<Message>>>>,

    clock: SharedClock,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Store whose TTLs are measured against `clock`
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            keyspace: RwLock::new(Keyspace::default()),
            channels: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Drop expired entries; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut keyspace = self.keyspace.write();
        let before = keyspace.data.len();
        keyspace.data.retain(|_, slot| slot.is_live(now));
        let purged = before - keyspace.data.len();
        if purged > 0 {
            tracing::debug!("Purged {} expired keys", purged);
        }
        purged
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.keyspace
            .read()
            .data
            .values()
            .filter(|slot| slot.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Disconnect every subscriber, as a lost pub/sub connection would
    pub fn close_subscriptions(&self) {
        let dropped: usize = self.channels.lock().drain().map(|(_, subs)| subs.len()).sum();
        tracing::debug!("Closed {} subscriptions", dropped);
    }

    /// Last version handed out by a commit
    pub fn last_version(&self) -> Version {
        Version(self.keyspace.read().last_version)
    }
}

/// Expiry instant for a key written at `now`, saturating for huge TTLs
fn expiry(now: u64, ttl: Duration) -> u64 {
    now.saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX))
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Versioned>> {
        let now = self.clock.now_millis();
        let keyspace = self.keyspace.read();
        Ok(keyspace.live(key, now).map(|slot| Versioned {
            value: slot.value.clone(),
            version: slot.version,
        }))
    }

    fn scan(&self, prefix: &str) -> Result<Vec<(String, Versioned)>> {
        let now = self.clock.now_millis();
        let keyspace = self.keyspace.read();
        let entries = keyspace
            .data
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(_, slot)| slot.is_live(now))
            .map(|(key, slot)| {
                (
                    key.clone(),
                    Versioned {
                        value: slot.value.clone(),
                        version: slot.version,
                    },
                )
            })
            .collect();
        Ok(entries)
    }

    fn commit(&self, txn: Transaction) -> Result<CommitOutcome> {
        let now = self.clock.now_millis();
        let mut keyspace = self.keyspace.write();

        for (key, expected) in &txn.checks {
            let current = keyspace.live(key, now).map(|slot| slot.version);
            if current != *expected {
                tracing::trace!(
                    "Commit conflict on {}: expected {:?}, found {:?}",
                    key,
                    expected,
                    current
                );
                return Ok(CommitOutcome::Conflict { key: key.clone() });
            }
        }

        keyspace.last_version += 1;
        let version = Version(keyspace.last_version);

        for op in txn.writes {
            match op {
                WriteOp::Put { key, value, ttl } => {
                    let expires_at = ttl.map(|ttl| expiry(now, ttl));
                    keyspace.data.insert(
                        key,
                        Slot {
                            value,
                            version,
                            expires_at,
                        },
                    );
                }
                WriteOp::Delete { key } => {
                    keyspace.data.remove(&key);
                }
            }
        }

        Ok(CommitOutcome::Committed { version })
    }

    fn publish(&self, channel: &str, payload: Bytes) -> Result<usize> {
        let mut channels = self.channels.lock();
        let Some(subscribers) = channels.get_mut(channel) else {
            return Ok(0);
        };

        let message = Message {
            channel: channel.to_string(),
            payload,
        };
        let mut delivered = 0;
        subscribers.retain(|sender| match sender.try_send(message.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Subscriber on {} is full, dropping message", channel);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });

        if subscribers.is_empty() {
            channels.remove(channel);
        }
        Ok(delivered)
    }

    fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let (sender, receiver) = channel::bounded(SUBSCRIBER_CAPACITY);
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(sender);
        Ok(Subscription::new(receiver))
    }

    fn ping(&self) -> Result<()> {
        Ok(())
    }
}
