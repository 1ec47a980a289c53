//! Party lifecycle events
//!
//! Each event carries the resulting party state so a subscriber can update
//! its projection without reading the store.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Party, PartyId, PartySummary, PlayerId};

/// What happened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    PartyCreated,
    InviteCreated { invitee: PlayerId, expires_at: u64 },
    InviteRemoved { invitee: PlayerId },
    MemberJoined,
    MemberLeft,
    MemberKicked,
    LeaderChanged { previous: PlayerId },
    PolicyChanged,
    PartyDisbanded,
    /// The party is asked to follow its leader to `server`
    ServerSwitch { server: String },
}

/// Envelope published on the party topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyEvent {
    pub event_id: Uuid,

    /// Node that committed the change
    pub origin: String,

    /// Commit time (unix millis)
    pub at: u64,

    pub kind: EventKind,

    pub party: PartyId,

    /// Party revision after the change
    pub revision: u64,

    /// Leader after the change (last leader when disbanded)
    pub leader: PlayerId,

    /// Members after the change; empty when disbanded
    #[serde(default)]
    pub members: Vec<PlayerId>,

    #[serde(default)]
    pub open: bool,

    /// Players whose membership or invitations changed
    #[serde(default)]
    pub affected: Vec<PlayerId>,
}

impl PartyEvent {
    /// Event describing `party` as it stands after the change
    pub fn for_party(kind: EventKind, party: &Party, affected: Vec<PlayerId>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            origin: String::new(),
            at: 0,
            kind,
            party: party.id,
            revision: party.revision,
            leader: party.leader,
            members: party.members.clone(),
            open: party.open,
            affected,
        }
    }

    /// Event for a party that no longer exists; `former` is its final state
    pub fn disbanded(former: &Party) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            origin: String::new(),
            at: 0,
            kind: EventKind::PartyDisbanded,
            party: former.id,
            revision: former.revision + 1,
            leader: former.leader,
            members: Vec::new(),
            open: false,
            affected: former.members.clone(),
        }
    }

    pub(crate) fn stamped(mut self, origin: &str, at: u64) -> Self {
        self.origin = origin.to_string();
        self.at = at;
        self
    }

    /// Resulting party state, None when the party is gone
    pub fn summary(&self) -> Option<PartySummary> {
        if self.members.is_empty() {
            return None;
        }
        Some(PartySummary {
            id: self.party,
            leader: self.leader,
            members: self.members.clone(),
            open: self.open,
            revision: self.revision,
        })
    }
}
