//! Startup reconciliation
//!
//! Warms a cold shared store from durable snapshots.

use bytes::Bytes;

use crate::error::Result;
use crate::model::{self, keys, MemberRecord};
use crate::store::{CommitOutcome, SharedStore, Transaction};
use super::DurableStore;

/// Outcome of [`warm_start`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WarmStart {
    /// The store held no party records when checked
    pub store_was_cold: bool,
    /// Parties written to the store
    pub restored: usize,
    /// Snapshots skipped as invalid or already present
    pub skipped: usize,
}

/// Restore parties from `durable` if `store` holds none
///
/// Each party is restored in its own transaction that requires its record
/// and every member index entry to be absent, so concurrent warm starts on
/// several nodes, or live parties created meanwhile, are never overwritten.
pub fn warm_start(store: &dyn SharedStore, durable: &dyn DurableStore) -> Result<WarmStart> {
    if !store.scan(keys::PARTY_PREFIX)?.is_empty() {
        tracing::debug!("Shared store already holds parties, skipping warm start");
        return Ok(WarmStart::default());
    }

    let snapshots = durable.load_all_snapshots()?;
    let mut report = WarmStart {
        store_was_cold: true,
        ..WarmStart::default()
    };

    for party in snapshots {
        if party.members.is_empty() || !party.is_member(party.leader) {
            tracing::warn!("Skipping invalid snapshot for leader {}", party.leader);
            report.skipped += 1;
            continue;
        }

        let party_key = keys::party(party.leader);
        let mut txn = Transaction::new().expect(party_key.as_str(), None);
        for member in &party.members {
            txn = txn.expect(keys::member(*member), None);
        }
        txn = txn.put(party_key, Bytes::from(model::encode(&party)?));
        for member in &party.members {
            txn = txn.put(
                keys::member(*member),
                Bytes::from(model::encode(&MemberRecord::new(party.leader))?),
            );
        }

        match store.commit(txn)? {
            CommitOutcome::Committed { .. } => report.restored += 1,
            CommitOutcome::Conflict { key } => {
                tracing::debug!("Snapshot of {} not restored, {} exists", party.leader, key);
                report.skipped += 1;
            }
        }
    }

    tracing::info!(
        "Warm start from {}: {} parties restored, {} skipped",
        durable.backend(),
        report.restored,
        report.skipped
    );
    Ok(report)
}
