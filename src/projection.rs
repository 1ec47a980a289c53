//! Node-Local Projection
//!
//! A disposable read cache of party state for one node.
//!
//! ```text
//! bus events ──────┐
//! local commits ───┼──► Projection ──► party_of(player), pending_invites(player)
//! resync(store) ───┘
//! ```
//!
//! Nothing here is authoritative and the coordinator never consults it.
//! Events carry the resulting party state; an event whose revision is older
//! than what the projection already holds for that party is ignored. Entries
//! not refreshed within `entry_ttl` read as missing until the next resync.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::clock::SharedClock;
use crate::error::Result;
use crate::model::{self, keys, EventKind, Invitation, Party, PartyEvent, PartyId, PartySummary, PlayerId};
use crate::store::SharedStore;

/// An invitation as seen by the projection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInvite {
    pub leader: PlayerId,
    pub expires_at: u64,
}

/// Callback run for every event the projection receives
pub type EventListener = Box<dyn Fn(&PartyEvent) + Send + Sync>;

#[derive(Debug, Clone)]
struct Entry {
    summary: Arc<PartySummary>,
    refreshed: Instant,
}

#[derive(Debug, Default)]
struct State {
    /// player -> party they are in
    members: HashMap<PlayerId, Entry>,
    /// party lineage -> newest revision applied (disbanded parties included)
    revisions: HashMap<PartyId, u64>,
    /// invitee -> leader -> invitation
    invites: HashMap<PlayerId, HashMap<PlayerId, PendingInvite>>,
}

impl State {
    fn set_party(&mut self, summary: PartySummary, affected: &[PlayerId], now: Instant) {
        let summary = Arc::new(summary);
        for member in &summary.members {
            self.members.insert(
                *member,
                Entry {
                    summary: Arc::clone(&summary),
                    refreshed: now,
                },
            );
        }
        for player in affected {
            if !summary.members.contains(player) {
                self.drop_member(*player, summary.id);
            }
        }
    }

    /// Forget `player`'s membership if it is in party `id`
    fn drop_member(&mut self, player: PlayerId, id: PartyId) {
        if self
            .members
            .get(&player)
            .map_or(false, |entry| entry.summary.id == id)
        {
            self.members.remove(&player);
        }
    }

    fn drop_invites_from(&mut self, leader: PlayerId) {
        self.invites.retain(|_, from| {
            from.remove(&leader);
            !from.is_empty()
        });
    }
}

/// Per-node cache of who is in which party
pub struct Projection {
    state: RwLock<State>,
    entry_ttl: Duration,
    clock: SharedClock,
    listeners: RwLock<Vec<EventListener>>,
}

impl Projection {
    pub fn new(entry_ttl: Duration, clock: SharedClock) -> Self {
        Self {
            state: RwLock::new(State::default()),
            entry_ttl,
            clock,
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a callback for every received event, stale ones included
    pub fn add_listener(&self, listener: EventListener) {
        self.listeners.write().push(listener);
    }

    /// Fold one event into the cache
    pub fn apply(&self, event: &PartyEvent) {
        self.fold(event);
        for listener in self.listeners.read().iter() {
            listener(event);
        }
    }

    fn fold(&self, event: &PartyEvent) {
        let now = Instant::now();
        let mut state = self.state.write();

        if let Some(&seen) = state.revisions.get(&event.party) {
            if event.revision < seen {
                tracing::trace!(
                    "Ignoring stale {:?} for party {} (rev {} < {})",
                    event.kind,
                    event.party,
                    event.revision,
                    seen
                );
                return;
            }
        }
        state.revisions.insert(event.party, event.revision);

        match event.summary() {
            Some(summary) => state.set_party(summary, &event.affected, now),
            None => {
                for player in &event.affected {
                    state.drop_member(*player, event.party);
                }
            }
        }

        match &event.kind {
            EventKind::InviteCreated { invitee, expires_at } => {
                state.invites.entry(*invitee).or_default().insert(
                    event.leader,
                    PendingInvite {
                        leader: event.leader,
                        expires_at: *expires_at,
                    },
                );
            }
            EventKind::InviteRemoved { invitee } => {
                if let Some(from) = state.invites.get_mut(invitee) {
                    from.remove(&event.leader);
                    if from.is_empty() {
                        state.invites.remove(invitee);
                    }
                }
            }
            EventKind::MemberJoined => {
                for player in &event.affected {
                    state.invites.remove(player);
                }
            }
            EventKind::LeaderChanged { previous } => {
                let leader = event.leader;
                for from in state.invites.values_mut() {
                    if let Some(mut invite) = from.remove(previous) {
                        invite.leader = leader;
                        from.insert(leader, invite);
                    }
                }
            }
            EventKind::PartyDisbanded => state.drop_invites_from(event.leader),
            EventKind::PartyCreated
            | EventKind::MemberLeft
            | EventKind::MemberKicked
            | EventKind::PolicyChanged
            | EventKind::ServerSwitch { .. } => {}
        }
    }

    /// Rebuild the cache from the shared store
    ///
    /// Returns the number of parties loaded. Revisions of parties absent
    /// from the store are forgotten.
    pub fn resync(&self, store: &dyn SharedStore) -> Result<usize> {
        let mut parties = Vec::new();
        for (key, versioned) in store.scan(keys::PARTY_PREFIX)? {
            match model::decode::<Party>(&key, &versioned.value) {
                Ok(party) => parties.push(party),
                Err(e) => tracing::warn!("Resync skipping {}: {}", key, e),
            }
        }
        let mut invites = Vec::new();
        for (key, versioned) in store.scan(keys::INVITE_PREFIX)? {
            match model::decode::<Invitation>(&key, &versioned.value) {
                Ok(invite) => invites.push(invite),
                Err(e) => tracing::warn!("Resync skipping {}: {}", key, e),
            }
        }

        let now = Instant::now();
        let mut fresh = State::default();
        for party in &parties {
            fresh.revisions.insert(party.id, party.revision);
            fresh.set_party(party.summary(), &[], now);
        }
        for invite in invites {
            fresh.invites.entry(invite.invitee).or_default().insert(
                invite.leader,
                PendingInvite {
                    leader: invite.leader,
                    expires_at: invite.expires_at,
                },
            );
        }

        let mut state = self.state.write();
        // Events applied while the scan was running may be newer than it
        for (player, entry) in state.members.drain() {
            let newer = fresh
                .revisions
                .get(&entry.summary.id)
                .map_or(false, |rev| entry.summary.revision > *rev);
            if newer {
                fresh.members.insert(player, entry);
            }
        }
        // Keep the newest revision seen, so older events stay ignored
        for (id, seen) in state.revisions.drain() {
            if let Some(rev) = fresh.revisions.get_mut(&id) {
                *rev = (*rev).max(seen);
            }
        }
        *state = fresh;

        tracing::debug!("Projection resynced: {} parties", parties.len());
        Ok(parties.len())
    }

    /// Cached party of `player`, None if unknown or stale
    pub fn party_of(&self, player: PlayerId) -> Option<PartySummary> {
        let state = self.state.read();
        state
            .members
            .get(&player)
            .filter(|entry| entry.refreshed.elapsed() < self.entry_ttl)
            .map(|entry| entry.summary.as_ref().clone())
    }

    /// Unexpired invitations addressed to `invitee`
    pub fn pending_invites(&self, invitee: PlayerId) -> Vec<PendingInvite> {
        let now = self.clock.now_millis();
        let state = self.state.read();
        let mut pending: Vec<PendingInvite> = state
            .invites
            .get(&invitee)
            .map(|from| {
                from.values()
                    .filter(|invite| invite.expires_at > now)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        pending.sort_by_key(|invite| invite.expires_at);
        pending
    }

    /// Players with a cached membership
    pub fn len(&self) -> usize {
        self.state.read().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        *self.state.write() = State::default();
    }
}
