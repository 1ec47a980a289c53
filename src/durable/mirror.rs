//! Asynchronous snapshot mirror
//!
//! Committed party states are queued here and written to the durable store
//! by a single background thread, so persistence never sits on the live path.
//!
//! Each batch takes up to `batch_size` queued ops and keeps only the newest
//! op per leader. Backend failures are logged and counted, never returned.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::Result;
use crate::model::{Party, PlayerId};
use super::{DurableStore, SnapshotStamp};

/// A snapshot change to persist
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorOp {
    Upsert(Party),
    /// The party left this leader key at `stamp`
    Delete { leader: PlayerId, stamp: SnapshotStamp },
}

impl MirrorOp {
    /// Tombstone for `party` leaving its current leader key
    pub fn removal(party: &Party) -> Self {
        MirrorOp::Delete {
            leader: party.leader,
            stamp: SnapshotStamp::removal(party),
        }
    }

    /// Snapshot key the op applies to
    pub fn leader(&self) -> PlayerId {
        match self {
            MirrorOp::Upsert(party) => party.leader,
            MirrorOp::Delete { leader, .. } => *leader,
        }
    }

    pub fn stamp(&self) -> SnapshotStamp {
        match self {
            MirrorOp::Upsert(party) => SnapshotStamp::of(party),
            MirrorOp::Delete { stamp, .. } => *stamp,
        }
    }
}

/// Counters since the mirror started
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MirrorStats {
    /// Ops written to the backend
    pub applied: u64,
    /// Ops the backend rejected
    pub failed: u64,
    /// Ops superseded by a later op for the same leader in one batch
    pub coalesced: u64,
}

#[derive(Default)]
struct Counters {
    applied: AtomicU64,
    failed: AtomicU64,
    coalesced: AtomicU64,
}

enum Request {
    Op(MirrorOp),
    Flush(Sender<()>),
    Shutdown,
}

/// Handle to the mirror thread
pub struct SnapshotMirror {
    sender: Sender<Request>,
    handle: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
    backend: &'static str,
}

impl SnapshotMirror {
    /// Start a mirror writing to `durable`
    pub fn start(durable: Arc<dyn DurableStore>, batch_size: usize) -> Result<Self> {
        let (sender, receiver) = channel::unbounded();
        let counters = Arc::new(Counters::default());
        let backend = durable.backend();

        let worker_counters = Arc::clone(&counters);
        let handle = thread::Builder::new()
            .name("snapshot-mirror".to_string())
            .spawn(move || run(receiver, durable, batch_size.max(1), worker_counters))?;

        Ok(Self {
            sender,
            handle: Mutex::new(Some(handle)),
            counters,
            backend,
        })
    }

    /// Queue an op; never blocks on the backend
    pub fn enqueue(&self, op: MirrorOp) {
        if self.sender.send(Request::Op(op)).is_err() {
            tracing::warn!("Snapshot mirror ({}) stopped, dropping op", self.backend);
        }
    }

    /// Block until everything queued so far has been written
    pub fn flush(&self) {
        let (ack, done) = channel::bounded(1);
        if self.sender.send(Request::Flush(ack)).is_ok() {
            let _ = done.recv();
        }
    }

    /// Write what is queued, then stop the thread
    pub fn shutdown(&self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        let _ = self.sender.send(Request::Shutdown);
        if handle.join().is_err() {
            tracing::warn!("Snapshot mirror thread panicked");
        }
    }

    pub fn stats(&self) -> MirrorStats {
        MirrorStats {
            applied: self.counters.applied.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            coalesced: self.counters.coalesced.load(Ordering::SeqCst),
        }
    }

    pub fn backend(&self) -> &'static str {
        self.backend
    }
}

impl Drop for SnapshotMirror {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    receiver: Receiver<Request>,
    durable: Arc<dyn DurableStore>,
    batch_size: usize,
    counters: Arc<Counters>,
) {
    tracing::debug!("Snapshot mirror started ({})", durable.backend());
    let mut batch = Vec::with_capacity(batch_size);

    while let Ok(first) = receiver.recv() {
        let mut next = Some(first);
        let mut stop = false;

        while let Some(request) = next.take() {
            match request {
                Request::Op(op) => batch.push(op),
                Request::Flush(ack) => {
                    write_batch(&mut batch, durable.as_ref(), &counters);
                    let _ = ack.send(());
                }
                Request::Shutdown => {
                    stop = true;
                    break;
                }
            }
            if batch.len() >= batch_size {
                write_batch(&mut batch, durable.as_ref(), &counters);
            }
            next = receiver.try_recv().ok();
        }

        write_batch(&mut batch, durable.as_ref(), &counters);
        if stop {
            break;
        }
    }

    tracing::debug!("Snapshot mirror stopped ({})", durable.backend());
}

/// Apply the newest op per leader, in first-seen order
fn write_batch(batch: &mut Vec<MirrorOp>, durable: &dyn DurableStore, counters: &Counters) {
    if batch.is_empty() {
        return;
    }

    let mut order: Vec<PlayerId> = Vec::new();
    let mut latest: HashMap<PlayerId, MirrorOp> = HashMap::new();
    let total = batch.len() as u64;
    for op in batch.drain(..) {
        let leader = op.leader();
        match latest.get(&leader) {
            Some(kept) if kept.stamp() > op.stamp() => {}
            Some(_) => {
                latest.insert(leader, op);
            }
            None => {
                latest.insert(leader, op);
                order.push(leader);
            }
        }
    }
    counters
        .coalesced
        .fetch_add(total - order.len() as u64, Ordering::SeqCst);

    for leader in order {
        let Some(op) = latest.remove(&leader) else {
            continue;
        };
        let result = match &op {
            MirrorOp::Upsert(party) => durable.upsert_snapshot(party),
            MirrorOp::Delete { leader, stamp } => durable.delete_snapshot(*leader, *stamp),
        };
        match result {
            Ok(()) => {
                counters.applied.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(
                    "Snapshot mirror ({}) failed for {}: {}",
                    durable.backend(),
                    leader,
                    e
                );
            }
        }
    }
}
