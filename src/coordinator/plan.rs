//! Read tracking and mutation planning
//!
//! Every read made while planning an operation records the version it saw.
//! Those versions become the checks of the commit, so the plan only applies
//! if nothing it looked at changed in between.

use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::durable::MirrorOp;
use crate::error::Result;
use crate::model::{self, keys, Invitation, MemberRecord, Outbox, Party, PartyEvent, PlayerId};
use crate::store::{SharedStore, Transaction, WriteOp};

/// Reads against the store, remembering what was seen
pub(crate) struct Reads<'a> {
    store: &'a dyn SharedStore,
    txn: Transaction,
    pub(crate) now: u64,
}

impl<'a> Reads<'a> {
    pub(crate) fn new(store: &'a dyn SharedStore, now: u64) -> Self {
        Self {
            store,
            txn: Transaction::new(),
            now,
        }
    }

    /// Decoded record at `key`; its absence is recorded too
    pub(crate) fn get<T: DeserializeOwned>(&mut self, key: &str) -> Result<Option<T>> {
        match self.store.get(key)? {
            Some(versioned) => {
                self.txn = std::mem::take(&mut self.txn).expect(key, Some(versioned.version));
                Ok(Some(model::decode(key, &versioned.value)?))
            }
            None => {
                self.txn = std::mem::take(&mut self.txn).expect(key, None);
                Ok(None)
            }
        }
    }

    pub(crate) fn party(&mut self, leader: PlayerId) -> Result<Option<Party>> {
        self.get(&keys::party(leader))
    }

    pub(crate) fn membership(&mut self, player: PlayerId) -> Result<Option<MemberRecord>> {
        self.get(&keys::member(player))
    }

    /// Party `player` belongs to, following the member index
    ///
    /// An index entry pointing at a party that does not list the player is
    /// treated as no membership; the plan then overwrites it.
    pub(crate) fn party_of(&mut self, player: PlayerId) -> Result<Option<Party>> {
        let Some(record) = self.membership(player)? else {
            return Ok(None);
        };
        Ok(self
            .party(record.leader)?
            .filter(|party| party.is_member(player)))
    }

    /// Live invitation from `leader` to `invitee`
    pub(crate) fn invitation(&mut self, leader: PlayerId, invitee: PlayerId) -> Result<Option<Invitation>> {
        let now = self.now;
        Ok(self
            .get::<Invitation>(&keys::invite(leader, invitee))?
            .filter(|invite| !invite.is_expired(now)))
    }

    /// Every invitation sent on behalf of `leader`'s party, expired or not
    ///
    /// The outbox is read too, so an invitation issued after this call
    /// conflicts with the commit.
    pub(crate) fn invitations_from(&mut self, leader: PlayerId) -> Result<Vec<Invitation>> {
        self.get::<Outbox>(&keys::outbox(leader))?;
        Ok(self
            .scan::<Invitation>(&keys::invites_of(leader))?
            .into_iter()
            .map(|(_, invite)| invite)
            .collect())
    }

    /// Every record under `prefix`, each recorded as read
    pub(crate) fn scan<T: DeserializeOwned>(&mut self, prefix: &str) -> Result<Vec<(String, T)>> {
        let entries = self.store.scan(prefix)?;
        let mut records = Vec::with_capacity(entries.len());
        for (key, versioned) in entries {
            let record = model::decode(&key, &versioned.value)?;
            self.txn = std::mem::take(&mut self.txn).expect(key.as_str(), Some(versioned.version));
            records.push((key, record));
        }
        Ok(records)
    }

    /// Checks collected so far, ready to receive writes
    pub(crate) fn into_transaction(self) -> Transaction {
        self.txn
    }
}

/// Planned result of one operation
pub(crate) struct Mutation<T> {
    pub(crate) writes: Vec<WriteOp>,
    pub(crate) events: Vec<PartyEvent>,
    pub(crate) mirror: Vec<MirrorOp>,
    pub(crate) outcome: T,
}

impl<T> Mutation<T> {
    pub(crate) fn new(outcome: T) -> Self {
        Self {
            writes: Vec::new(),
            events: Vec::new(),
            mirror: Vec::new(),
            outcome,
        }
    }

    pub(crate) fn put<R: Serialize>(&mut self, key: String, record: &R) -> Result<()> {
        self.writes.push(WriteOp::Put {
            key,
            value: Bytes::from(model::encode(record)?),
            ttl: None,
        });
        Ok(())
    }

    pub(crate) fn put_with_ttl<R: Serialize>(&mut self, key: String, record: &R, ttl: Duration) -> Result<()> {
        self.writes.push(WriteOp::Put {
            key,
            value: Bytes::from(model::encode(record)?),
            ttl: Some(ttl),
        });
        Ok(())
    }

    pub(crate) fn delete(&mut self, key: String) {
        self.writes.push(WriteOp::Delete { key });
    }

    pub(crate) fn event(&mut self, event: PartyEvent) {
        self.events.push(event);
    }

    pub(crate) fn mirror(&mut self, op: MirrorOp) {
        self.mirror.push(op);
    }

    /// Store the party record and queue its snapshot
    pub(crate) fn save_party(&mut self, party: &Party) -> Result<()> {
        self.put(keys::party(party.leader), party)?;
        self.mirror(MirrorOp::Upsert(party.clone()));
        Ok(())
    }

    /// Point `player`'s member index at `leader`
    pub(crate) fn save_membership(&mut self, player: PlayerId, leader: PlayerId) -> Result<()> {
        self.put(keys::member(player), &MemberRecord::new(leader))
    }

    /// Write both halves of an invitation and rewrite the leader's outbox,
    /// which expires along with it
    pub(crate) fn save_invitation(&mut self, invite: &Invitation, ttl: Duration) -> Result<()> {
        self.put_with_ttl(keys::invite(invite.leader, invite.invitee), invite, ttl)?;
        self.put_with_ttl(keys::inbox(invite.invitee, invite.leader), invite, ttl)?;
        self.put_with_ttl(
            keys::outbox(invite.leader),
            &Outbox::new(invite.leader, invite.created_at),
            ttl,
        )
    }

    /// Delete both halves of an invitation
    pub(crate) fn drop_invitation(&mut self, leader: PlayerId, invitee: PlayerId) {
        self.delete(keys::invite(leader, invitee));
        self.delete(keys::inbox(invitee, leader));
    }
}
