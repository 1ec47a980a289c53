//! Shared State Store
//!
//! The authoritative keyspace every node coordinates through.
//!
//! ## Model
//! ```text
//! key ──► (value, version, expires_at?)
//!
//! commit(Transaction {
//!     checks: [(key, expected version | absent)],
//!     writes: [put(key, value, ttl?) | delete(key)],
//! })
//!   ├─ every check holds ──► apply all writes, stamp them with ONE new version
//!   └─ any check fails   ──► Conflict { key }, nothing applied
//! ```
//!
//! Versions come from a single store-wide counter, so a key that is deleted
//! and re-created never reuses a version an earlier reader may have observed.
//! Keys past their expiry read as absent.
//!
//! ## Implementations
//! - [`MemoryStore`]: in-process keyspace, also the engine behind the store server
//! - [`RemoteStore`]: TCP client for the store server

mod memory;
mod remote;

use std::any::Any;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{Receiver, RecvTimeoutError, TryRecvError};

use crate::error::{PartyError, Result};

pub use memory::MemoryStore;
pub use remote::RemoteStore;

// =============================================================================
// Values
// =============================================================================

/// Store-wide commit counter value
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(pub u64);

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A value together with the version of the commit that wrote it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: Bytes,
    pub version: Version,
}

// =============================================================================
// Transactions
// =============================================================================

/// A single write inside a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put {
        key: String,
        value: Bytes,
        ttl: Option<Duration>,
    },
    Delete {
        key: String,
    },
}

impl WriteOp {
    pub fn key(&self) -> &str {
        match self {
            WriteOp::Put { key, .. } | WriteOp::Delete { key } => key,
        }
    }
}

/// Multi-key conditional write
///
/// Applied atomically if and only if every key in `checks` is still at the
/// expected version (`None` = the key must be absent).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    pub checks: Vec<(String, Option<Version>)>,
    pub writes: Vec<WriteOp>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key` to be at `version` at commit time
    ///
    /// The first expectation recorded for a key wins.
    pub fn expect(mut self, key: impl Into<String>, version: Option<Version>) -> Self {
        let key = key.into();
        if !self.checks.iter().any(|(k, _)| *k == key) {
            self.checks.push((key, version));
        }
        self
    }

    pub fn put(self, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.write(WriteOp::Put {
            key: key.into(),
            value: value.into(),
            ttl: None,
        })
    }

    pub fn put_with_ttl(
        self,
        key: impl Into<String>,
        value: impl Into<Bytes>,
        ttl: Duration,
    ) -> Self {
        self.write(WriteOp::Put {
            key: key.into(),
            value: value.into(),
            ttl: Some(ttl),
        })
    }

    pub fn delete(self, key: impl Into<String>) -> Self {
        self.write(WriteOp::Delete { key: key.into() })
    }

    pub fn write(mut self, op: WriteOp) -> Self {
        self.writes.push(op);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

/// Result of a commit attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// All writes applied under this version
    Committed { version: Version },

    /// `key` was not at the expected version; nothing was applied
    Conflict { key: String },
}

impl CommitOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, CommitOutcome::Committed { .. })
    }
}

// =============================================================================
// Pub/Sub
// =============================================================================

/// A payload delivered on a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub channel: String,
    pub payload: Bytes,
}

/// Live subscription to one channel
///
/// Messages published while the subscription is disconnected are lost. A
/// disconnected subscription reports `Disconnected` on receive and must be
/// replaced.
pub struct Subscription {
    receiver: Receiver<Message>,

    /// Tears down the transport when the subscription is dropped
    _guard: Option<Box<dyn Any + Send>>,
}

impl Subscription {
    pub fn new(receiver: Receiver<Message>) -> Self {
        Self {
            receiver,
            _guard: None,
        }
    }

    pub(crate) fn with_guard(receiver: Receiver<Message>, guard: Box<dyn Any + Send>) -> Self {
        Self {
            receiver,
            _guard: Some(guard),
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> std::result::Result<Message, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> std::result::Result<Message, TryRecvError> {
        self.receiver.try_recv()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("pending", &self.receiver.len())
            .finish()
    }
}

// =============================================================================
// SharedStore
// =============================================================================

/// Client contract of the shared state store
///
/// Every call is a blocking I/O boundary. Transport failures surface as
/// [`PartyError::StoreUnavailable`].
pub trait SharedStore: Send + Sync {
    /// Current value and version, `None` if absent or expired
    fn get(&self, key: &str) -> Result<Option<Versioned>>;

    /// All live entries whose key starts with `prefix`, in key order
    fn scan(&self, prefix: &str) -> Result<Vec<(String, Versioned)>>;

    /// Atomically apply `txn` if all of its checks hold
    fn commit(&self, txn: Transaction) -> Result<CommitOutcome>;

    /// Broadcast to current subscribers; returns how many received it
    fn publish(&self, channel: &str, payload: Bytes) -> Result<usize>;

    fn subscribe(&self, channel: &str) -> Result<Subscription>;

    fn ping(&self) -> Result<()>;

    /// Write `key` only if it is still at `expected`; `false` on conflict
    fn conditional_set(&self, key: &str, expected: Option<Version>, value: Bytes) -> Result<bool> {
        let txn = Transaction::new().expect(key, expected).put(key, value);
        Ok(self.commit(txn)?.is_committed())
    }

    fn set_with_expiry(&self, key: &str, value: Bytes, ttl: Duration) -> Result<Version> {
        unconditional(self.commit(Transaction::new().put_with_ttl(key, value, ttl))?)
    }

    fn set(&self, key: &str, value: Bytes) -> Result<Version> {
        unconditional(self.commit(Transaction::new().put(key, value))?)
    }

    fn delete(&self, key: &str) -> Result<()> {
        unconditional(self.commit(Transaction::new().delete(key))?)?;
        Ok(())
    }
}

fn unconditional(outcome: CommitOutcome) -> Result<Version> {
    match outcome {
        CommitOutcome::Committed { version } => Ok(version),
        CommitOutcome::Conflict { key } => Err(PartyError::Protocol(format!(
            "conflict on unconditional write to {}",
            key
        ))),
    }
}
