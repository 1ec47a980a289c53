//! Party Coordinator
//!
//! Validates and applies party lifecycle operations against the shared store.
//!
//! ## Mutation protocol
//! ```text
//!   ┌──────────────► read (versions recorded)
//!   │                   │
//!   │                plan (validate, compute next state)
//!   │                   │
//!   │                commit(checks + writes)        one atomic step
//!   │                   │
//!   │   Conflict ◄──────┼──────► Committed
//!   └── retry (bounded)         │
//!                               ├─► projection.apply(events)
//!                               ├─► bus.publish(events)      best effort
//!                               └─► mirror.enqueue(snapshots) async
//! ```
//!
//! A validation failure aborts before anything is written. Lost races are
//! retried up to `conflict_retries` times, then reported as
//! [`PartyError::ConcurrentModification`]. An unreachable store is retried
//! with exponential backoff and reported as [`PartyError::StoreUnavailable`].
//!
//! Every commit also creates a `commit:{attempt}` marker that must be absent
//! beforehand. When the store fails after receiving a commit, the same
//! transaction is resent; a conflict on the marker means the first send
//! applied, and the operation completes as committed.
//!
//! ## Policies
//! - A leader leaving hands the party to the earliest-joined other member.
//! - The party record lives under its leader's key, so a leadership change
//!   moves it, along with every outstanding invitation.
//! - Accepting an invitation while leading a party of one dissolves that
//!   party; any larger party must be left first.
//! - Joining a party consumes all of the joiner's invitations.

mod plan;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use uuid::Uuid;

use crate::bus::{EventBus, PARTY_EVENTS, PARTY_MESSAGES};
use crate::clock::{system_clock, SharedClock};
use crate::config::Config;
use crate::durable::{MirrorOp, SnapshotMirror, SnapshotStamp};
use crate::error::{PartyError, Result};
use crate::model::{
    self, keys, EventKind, Invitation, MemberRecord, Party, PartyEvent, PartyMessage, PlayerId,
};
use crate::projection::Projection;
use crate::retry::Backoff;
use crate::store::{CommitOutcome, SharedStore, Transaction, WriteOp};

use plan::{Mutation, Reads};

/// How long a commit marker outlives its commit
const COMMIT_MARKER_TTL: Duration = Duration::from_secs(300);

/// Result of one pass of [`Coordinator::execute`]
enum Attempt<T> {
    Committed(Mutation<T>),
    Conflict,
    /// The store failed before acknowledging; the commit may have applied
    Unconfirmed {
        mutation: Mutation<T>,
        txn: Transaction,
        marker: String,
        reason: String,
    },
}

/// What happened to a party when a member left
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// The member left; the party continues as given
    Left(Party),
    /// The leader left; the party continues under a new leader
    LeaderChanged(Party),
    /// The last member left; this was the party's final state
    Disbanded(Party),
}

impl LeaveOutcome {
    /// The party after the change, None when it was disbanded
    pub fn party(&self) -> Option<&Party> {
        match self {
            LeaveOutcome::Left(party) | LeaveOutcome::LeaderChanged(party) => Some(party),
            LeaveOutcome::Disbanded(_) => None,
        }
    }
}

/// Party lifecycle state machine
pub struct Coordinator {
    store: Arc<dyn SharedStore>,
    bus: Option<EventBus>,
    mirror: Option<Arc<SnapshotMirror>>,
    projection: Option<Arc<Projection>>,
    clock: SharedClock,

    node_id: String,
    invite_ttl: Duration,
    member_limit: Option<usize>,
    conflict_retries: u32,
    store_retries: u32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl Coordinator {
    /// Coordinator over `store` with policy from `config`
    pub fn new(store: Arc<dyn SharedStore>, config: &Config) -> Self {
        Self {
            store,
            bus: None,
            mirror: None,
            projection: None,
            clock: system_clock(),
            node_id: config.node_id.clone(),
            invite_ttl: config.invite_ttl(),
            member_limit: config.member_limit,
            conflict_retries: config.conflict_retries.max(1),
            store_retries: config.store_retries.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// Publish committed changes on `bus`
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Mirror committed snapshots through `mirror`
    pub fn with_mirror(mut self, mirror: Arc<SnapshotMirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Apply committed changes to this node's `projection` directly
    pub fn with_projection(mut self, projection: Arc<Projection>) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }

    // =========================================================================
    // Lifecycle Operations
    // =========================================================================

    /// Create a party with `leader` as its only member
    pub fn create_party(&self, leader: PlayerId) -> Result<Party> {
        self.execute("create_party", |reads| {
            if reads.party_of(leader)?.is_some() || reads.party(leader)?.is_some() {
                return Err(PartyError::AlreadyInParty(leader));
            }

            let party = Party::new(leader, reads.now);
            let mut m = Mutation::new(party.clone());
            m.save_party(&party)?;
            m.save_membership(leader, leader)?;
            m.event(PartyEvent::for_party(EventKind::PartyCreated, &party, vec![leader]));
            Ok(m)
        })
    }

    /// Invite `invitee` into the party led by `leader`
    pub fn invite(&self, leader: PlayerId, invitee: PlayerId) -> Result<Invitation> {
        if leader == invitee {
            return Err(PartyError::CannotTargetSelf(leader));
        }
        let ttl = self.invite_ttl;

        self.execute("invite", |reads| {
            let party = reads.party(leader)?.ok_or(PartyError::NotPartyLeader(leader))?;
            if party.is_member(invitee) {
                return Err(PartyError::InviteeAlreadyMember(invitee));
            }
            if reads.invitation(leader, invitee)?.is_some() {
                return Err(PartyError::AlreadyInvited { leader, invitee });
            }
            self.check_capacity(&party)?;

            let invite = Invitation::new(leader, invitee, reads.now, ttl);
            let mut m = Mutation::new(invite.clone());
            m.save_invitation(&invite, ttl)?;
            m.event(PartyEvent::for_party(
                EventKind::InviteCreated {
                    invitee,
                    expires_at: invite.expires_at,
                },
                &party,
                vec![invitee],
            ));
            Ok(m)
        })
    }

    /// Join the party led by `leader` using its invitation to `invitee`
    pub fn accept_invite(&self, invitee: PlayerId, leader: PlayerId) -> Result<Party> {
        self.execute("accept_invite", |reads| {
            let missing = || PartyError::InviteExpiredOrMissing { leader, invitee };
            reads.invitation(leader, invitee)?.ok_or_else(missing)?;
            let party = reads.party(leader)?.ok_or_else(missing)?;
            if party.is_member(invitee) {
                return Err(PartyError::InviteeAlreadyMember(invitee));
            }

            let mut m = Mutation::new(());
            if let Some(current) = reads.party_of(invitee)? {
                if current.size() > 1 {
                    return Err(PartyError::InviteeAlreadyInOtherParty(invitee));
                }
                // A party of one is dissolved by joining elsewhere
                dissolve(reads, &mut m, &current)?;
            }
            self.check_capacity(&party)?;

            let joined = self.admit(reads, m, &party, invitee)?;
            Ok(joined)
        })
    }

    /// Remove the invitation from `leader` to `invitee`; no-op if it is gone
    pub fn decline_invite(&self, invitee: PlayerId, leader: PlayerId) -> Result<()> {
        self.execute("decline_invite", |reads| {
            let mut m = Mutation::new(());
            if reads.invitation(leader, invitee)?.is_none() {
                return Ok(m);
            }
            m.drop_invitation(leader, invitee);
            if let Some(party) = reads.party(leader)? {
                m.event(PartyEvent::for_party(
                    EventKind::InviteRemoved { invitee },
                    &party,
                    vec![invitee],
                ));
            }
            Ok(m)
        })
    }

    /// Leave the current party
    pub fn leave_party(&self, member: PlayerId) -> Result<LeaveOutcome> {
        self.execute("leave_party", |reads| {
            let party = reads.party_of(member)?.ok_or(PartyError::NotInParty(member))?;
            remove_member(reads, &party, member, EventKind::MemberLeft)
        })
    }

    /// Remove `target` from the party led by `leader`
    pub fn kick(&self, leader: PlayerId, target: PlayerId) -> Result<Party> {
        if leader == target {
            return Err(PartyError::CannotTargetSelf(leader));
        }

        let outcome = self.execute("kick", |reads| {
            let party = reads.party(leader)?.ok_or(PartyError::NotPartyLeader(leader))?;
            if !party.is_member(target) {
                return Err(PartyError::TargetNotMember(target));
            }
            reads.membership(target)?;
            remove_member(reads, &party, target, EventKind::MemberKicked)
        })?;

        match outcome {
            LeaveOutcome::Left(party) | LeaveOutcome::LeaderChanged(party) => Ok(party),
            LeaveOutcome::Disbanded(former) => Err(PartyError::PartyNotFound(former.leader)),
        }
    }

    /// Hand leadership of `leader`'s party to `new_leader`
    pub fn transfer_leadership(&self, leader: PlayerId, new_leader: PlayerId) -> Result<Party> {
        if leader == new_leader {
            return Err(PartyError::CannotTargetSelf(leader));
        }

        self.execute("transfer_leadership", |reads| {
            let party = reads.party(leader)?.ok_or(PartyError::NotPartyLeader(leader))?;
            if !party.is_member(new_leader) {
                return Err(PartyError::TargetNotMember(new_leader));
            }

            let next = party.with_leader(new_leader);
            let mut m = Mutation::new(next.clone());
            rekey(reads, &mut m, &party, &next)?;
            m.event(PartyEvent::for_party(
                EventKind::LeaderChanged { previous: leader },
                &next,
                vec![leader, new_leader],
            ));
            Ok(m)
        })
    }

    /// Delete the party led by `leader` with all of its invitations
    ///
    /// Returns the party's final state.
    pub fn disband(&self, leader: PlayerId) -> Result<Party> {
        self.execute("disband", |reads| {
            let party = reads.party(leader)?.ok_or(PartyError::NotPartyLeader(leader))?;
            let mut m = Mutation::new(party.clone());
            dissolve(reads, &mut m, &party)?;
            Ok(m)
        })
    }

    /// The player left the network; leave their party if they have one
    ///
    /// Repeated notifications for a player already out of every party do
    /// nothing and publish nothing.
    pub fn disconnect(&self, player: PlayerId) -> Result<Option<LeaveOutcome>> {
        self.execute("disconnect", |reads| match reads.party_of(player)? {
            Some(party) => {
                let m = remove_member(reads, &party, player, EventKind::MemberLeft)?;
                Ok(Mutation {
                    outcome: Some(m.outcome),
                    writes: m.writes,
                    events: m.events,
                    mirror: m.mirror,
                })
            }
            None => Ok(Mutation::new(None)),
        })
    }

    /// Join an open party without an invitation
    pub fn join_party(&self, player: PlayerId, leader: PlayerId) -> Result<Party> {
        if player == leader {
            return Err(PartyError::CannotTargetSelf(player));
        }

        self.execute("join_party", |reads| {
            let party = reads.party(leader)?.ok_or(PartyError::PartyNotFound(leader))?;
            if party.is_member(player) || reads.party_of(player)?.is_some() {
                return Err(PartyError::AlreadyInParty(player));
            }
            if !party.open {
                return Err(PartyError::PartyClosed(leader));
            }
            self.check_capacity(&party)?;

            self.admit(reads, Mutation::new(()), &party, player)
        })
    }

    /// Open or close `leader`'s party to uninvited joins
    pub fn set_open(&self, leader: PlayerId, open: bool) -> Result<Party> {
        self.execute("set_open", |reads| {
            let party = reads.party(leader)?.ok_or(PartyError::NotPartyLeader(leader))?;
            if party.open == open {
                return Ok(Mutation::new(party));
            }

            let next = party.with_open(open);
            let mut m = Mutation::new(next.clone());
            m.save_party(&next)?;
            m.event(PartyEvent::for_party(EventKind::PolicyChanged, &next, Vec::new()));
            Ok(m)
        })
    }

    /// Ask every node to move `leader`'s party to `server`
    ///
    /// Nothing is stored; the request only travels on the bus.
    pub fn switch_server(&self, leader: PlayerId, server: &str) -> Result<Party> {
        let party = self.party(leader)?.ok_or(PartyError::NotPartyLeader(leader))?;
        let event = PartyEvent::for_party(
            EventKind::ServerSwitch {
                server: server.to_string(),
            },
            &party,
            party.members.clone(),
        );
        self.broadcast(vec![event]);
        Ok(party)
    }

    /// Send `text` to every member of `sender`'s party
    ///
    /// Recipients are the members at send time. A publish failure is returned
    /// to the caller rather than dropped.
    pub fn message_party(&self, sender: PlayerId, text: &str) -> Result<PartyMessage> {
        let text = text.trim();
        if text.is_empty() {
            return Err(PartyError::EmptyMessage);
        }
        let party = self.party_of(sender)?.ok_or(PartyError::NotInParty(sender))?;
        let message = PartyMessage::new(&party, sender, text, self.clock.now_millis(), &self.node_id);

        let bus = self
            .bus
            .as_ref()
            .ok_or_else(|| PartyError::BusUnavailable("no event bus configured".to_string()))?;
        let reached = bus.publish(PARTY_MESSAGES, &message)?;
        tracing::debug!(
            "Message from {} to party {} reached {} subscribers",
            sender,
            party.id,
            reached
        );
        Ok(message)
    }

    // =========================================================================
    // Authoritative Reads
    // =========================================================================

    /// Party led by `leader`
    pub fn party(&self, leader: PlayerId) -> Result<Option<Party>> {
        self.read(|| {
            let key = keys::party(leader);
            match self.store.get(&key)? {
                Some(versioned) => Ok(Some(model::decode(&key, &versioned.value)?)),
                None => Ok(None),
            }
        })
    }

    /// Party `player` belongs to
    pub fn party_of(&self, player: PlayerId) -> Result<Option<Party>> {
        self.read(|| {
            let key = keys::member(player);
            let Some(versioned) = self.store.get(&key)? else {
                return Ok(None);
            };
            let record: MemberRecord = model::decode(&key, &versioned.value)?;
            let party_key = keys::party(record.leader);
            match self.store.get(&party_key)? {
                Some(versioned) => {
                    let party: Party = model::decode(&party_key, &versioned.value)?;
                    Ok(party.is_member(player).then_some(party))
                }
                None => Ok(None),
            }
        })
    }

    /// Live invitations addressed to `invitee`
    pub fn invitations_for(&self, invitee: PlayerId) -> Result<Vec<Invitation>> {
        self.live_invitations(&keys::inbox_of(invitee))
    }

    /// Live invitations sent on behalf of `leader`'s party
    pub fn invitations_of(&self, leader: PlayerId) -> Result<Vec<Invitation>> {
        self.live_invitations(&keys::invites_of(leader))
    }

    fn live_invitations(&self, prefix: &str) -> Result<Vec<Invitation>> {
        let now = self.clock.now_millis();
        self.read(|| {
            let mut invites = Vec::new();
            for (key, versioned) in self.store.scan(prefix)? {
                let invite: Invitation = model::decode(&key, &versioned.value)?;
                if !invite.is_expired(now) {
                    invites.push(invite);
                }
            }
            Ok(invites)
        })
    }

    // =========================================================================
    // Internal
    // =========================================================================

    /// Add `player` to `party`, consuming every invitation they hold
    fn admit(
        &self,
        reads: &mut Reads<'_>,
        mut m: Mutation<()>,
        party: &Party,
        player: PlayerId,
    ) -> Result<Mutation<Party>> {
        for (_, invite) in reads.scan::<Invitation>(&keys::inbox_of(player))? {
            m.drop_invitation(invite.leader, player);
        }

        let next = party.with_member(player);
        m.save_party(&next)?;
        m.save_membership(player, next.leader)?;
        m.event(PartyEvent::for_party(EventKind::MemberJoined, &next, vec![player]));

        Ok(Mutation {
            writes: m.writes,
            events: m.events,
            mirror: m.mirror,
            outcome: next,
        })
    }

    fn check_capacity(&self, party: &Party) -> Result<()> {
        match self.member_limit {
            Some(limit) if party.size() >= limit => Err(PartyError::PartyFull {
                leader: party.leader,
                limit,
            }),
            _ => Ok(()),
        }
    }

    /// Run the optimistic read-plan-commit loop for one operation
    fn execute<T, F>(&self, op: &'static str, mut plan: F) -> Result<T>
    where
        F: FnMut(&mut Reads<'_>) -> Result<Mutation<T>>,
    {
        let mut conflicts = 0;
        let mut unavailable = 0;
        let mut backoff = Backoff::new(self.backoff_base, self.backoff_max);

        loop {
            let now = self.clock.now_millis();
            let landed = match self.attempt(now, &mut plan) {
                Ok(Attempt::Committed(mutation)) => Some(mutation),
                Ok(Attempt::Conflict) => None,
                Ok(Attempt::Unconfirmed {
                    mutation,
                    txn,
                    marker,
                    reason,
                }) => {
                    let resent = self.resend(op, txn, &marker, reason, &mut unavailable, &mut backoff)?;
                    resent.then_some(mutation)
                }
                Err(PartyError::StoreUnavailable(reason)) => {
                    unavailable += 1;
                    if unavailable >= self.store_retries {
                        return Err(PartyError::StoreUnavailable(reason));
                    }
                    let delay = backoff.next_delay();
                    tracing::warn!("{}: store unavailable ({}), retry in {:?}", op, reason, delay);
                    thread::sleep(delay);
                    continue;
                }
                Err(e) => return Err(e),
            };

            match landed {
                Some(mutation) => {
                    tracing::debug!(
                        "{} committed ({} writes, {} events)",
                        op,
                        mutation.writes.len(),
                        mutation.events.len()
                    );
                    return Ok(self.finish(mutation));
                }
                None => {
                    conflicts += 1;
                    if conflicts >= self.conflict_retries {
                        tracing::warn!("{} gave up after {} conflicts", op, conflicts);
                        return Err(PartyError::ConcurrentModification {
                            attempts: conflicts,
                        });
                    }
                }
            }
        }
    }

    /// One read-plan-commit pass
    fn attempt<T, F>(&self, now: u64, plan: &mut F) -> Result<Attempt<T>>
    where
        F: FnMut(&mut Reads<'_>) -> Result<Mutation<T>>,
    {
        let mut reads = Reads::new(self.store.as_ref(), now);
        let mutation = plan(&mut reads)?;
        if mutation.writes.is_empty() {
            return Ok(Attempt::Committed(mutation));
        }

        // The marker is checked first, so a resend of a commit that already
        // applied conflicts on the marker and nowhere else
        let marker = keys::commit_marker(Uuid::new_v4());
        let mut txn = reads.into_transaction();
        txn.checks.insert(0, (marker.clone(), None));
        txn.writes = mutation.writes.clone();
        txn.writes.push(WriteOp::Put {
            key: marker.clone(),
            value: Bytes::from(self.node_id.clone()),
            ttl: Some(COMMIT_MARKER_TTL),
        });

        match self.store.commit(txn.clone()) {
            Ok(CommitOutcome::Committed { version }) => {
                tracing::trace!("Committed {} writes at {}", mutation.writes.len(), version);
                Ok(Attempt::Committed(mutation))
            }
            Ok(CommitOutcome::Conflict { key }) => {
                tracing::debug!("Conflict on {}", key);
                Ok(Attempt::Conflict)
            }
            Err(PartyError::StoreUnavailable(reason)) => Ok(Attempt::Unconfirmed {
                mutation,
                txn,
                marker,
                reason,
            }),
            Err(e) => Err(e),
        }
    }

    /// Send `txn` again after its acknowledgement was lost
    ///
    /// Returns true once it is known to have applied, false if it lost a race
    /// and has to be planned again.
    fn resend(
        &self,
        op: &'static str,
        txn: Transaction,
        marker: &str,
        mut reason: String,
        unavailable: &mut u32,
        backoff: &mut Backoff,
    ) -> Result<bool> {
        loop {
            *unavailable += 1;
            if *unavailable >= self.store_retries {
                return Err(PartyError::StoreUnavailable(reason));
            }
            let delay = backoff.next_delay();
            tracing::warn!("{}: commit unconfirmed ({}), resend in {:?}", op, reason, delay);
            thread::sleep(delay);

            match self.store.commit(txn.clone()) {
                Ok(CommitOutcome::Committed { .. }) => return Ok(true),
                Ok(CommitOutcome::Conflict { key }) if key == marker => {
                    tracing::debug!("{}: earlier send had applied", op);
                    return Ok(true);
                }
                Ok(CommitOutcome::Conflict { key }) => {
                    tracing::debug!("Conflict on {} after resend", key);
                    return Ok(false);
                }
                Err(PartyError::StoreUnavailable(next)) => reason = next,
                Err(e) => return Err(e),
            }
        }
    }

    /// Propagate a committed mutation and hand back its outcome
    fn finish<T>(&self, mutation: Mutation<T>) -> T {
        self.broadcast(mutation.events);

        if let Some(mirror) = &self.mirror {
            for op in mutation.mirror {
                mirror.enqueue(op);
            }
        }
        mutation.outcome
    }

    /// Apply locally, then publish; publish failures are logged and dropped
    fn broadcast(&self, events: Vec<PartyEvent>) {
        let now = self.clock.now_millis();
        for event in events {
            let event = event.stamped(&self.node_id, now);
            if let Some(projection) = &self.projection {
                projection.apply(&event);
            }
            if let Some(bus) = &self.bus {
                if let Err(e) = bus.publish(PARTY_EVENTS, &event) {
                    tracing::warn!("Dropping {:?} event for party {}: {}", event.kind, event.party, e);
                }
            }
        }
    }

    /// Run a read, retrying while the store is unavailable
    fn read<T>(&self, mut f: impl FnMut() -> Result<T>) -> Result<T> {
        let mut backoff = Backoff::new(self.backoff_base, self.backoff_max);
        let mut failures = 0;
        loop {
            match f() {
                Err(PartyError::StoreUnavailable(reason)) => {
                    failures += 1;
                    if failures >= self.store_retries {
                        return Err(PartyError::StoreUnavailable(reason));
                    }
                    thread::sleep(backoff.next_delay());
                }
                other => return other,
            }
        }
    }
}

// =============================================================================
// Planning helpers
// =============================================================================

/// Remove `member` from `party`, handing over or disbanding as needed
fn remove_member(
    reads: &mut Reads<'_>,
    party: &Party,
    member: PlayerId,
    kind: EventKind,
) -> Result<Mutation<LeaveOutcome>> {
    if party.size() <= 1 {
        let mut m = Mutation::new(LeaveOutcome::Disbanded(party.clone()));
        dissolve(reads, &mut m, party)?;
        return Ok(m);
    }

    let next = party.without_member(member);
    if party.is_leader(member) {
        let mut m = Mutation::new(LeaveOutcome::LeaderChanged(next.clone()));
        rekey(reads, &mut m, party, &next)?;
        m.delete(keys::member(member));
        m.event(PartyEvent::for_party(
            EventKind::LeaderChanged { previous: member },
            &next,
            vec![member, next.leader],
        ));
        return Ok(m);
    }

    let mut m = Mutation::new(LeaveOutcome::Left(next.clone()));
    m.save_party(&next)?;
    m.delete(keys::member(member));
    m.event(PartyEvent::for_party(kind, &next, vec![member]));
    Ok(m)
}

/// Move the party record from `old`'s leader key to `next`'s, carrying the
/// member index and outstanding invitations along
fn rekey<T>(reads: &mut Reads<'_>, m: &mut Mutation<T>, old: &Party, next: &Party) -> Result<()> {
    if reads.party(next.leader)?.is_some() {
        return Err(PartyError::AlreadyInParty(next.leader));
    }

    m.delete(keys::party(old.leader));
    m.delete(keys::outbox(old.leader));
    m.mirror(MirrorOp::Delete {
        leader: old.leader,
        stamp: SnapshotStamp::of(next),
    });
    m.save_party(next)?;
    for member in &next.members {
        m.save_membership(*member, next.leader)?;
    }

    let now = reads.now;
    for invite in reads.invitations_from(old.leader)? {
        m.drop_invitation(old.leader, invite.invitee);
        if invite.invitee == next.leader {
            continue;
        }
        if let Some(remaining) = invite.remaining(now) {
            m.save_invitation(&invite.reissued_by(next.leader), remaining)?;
        }
    }
    Ok(())
}

/// Delete the party, its member index and its invitations
fn dissolve<T>(reads: &mut Reads<'_>, m: &mut Mutation<T>, party: &Party) -> Result<()> {
    for invite in reads.invitations_from(party.leader)? {
        m.drop_invitation(party.leader, invite.invitee);
    }
    m.delete(keys::outbox(party.leader));
    m.delete(keys::party(party.leader));
    for member in &party.members {
        m.delete(keys::member(*member));
    }
    m.mirror(MirrorOp::removal(party));
    m.event(PartyEvent::disbanded(party));
    Ok(())
}
