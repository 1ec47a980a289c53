//! Party records

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{default_schema, PartyId, PlayerId, SCHEMA_VERSION};

/// Authoritative party record, stored under `party:{leader}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    #[serde(default = "default_schema")]
    pub schema: u32,

    /// Lineage id, unchanged by leadership transfer
    pub id: PartyId,

    pub leader: PlayerId,

    /// Members in join order; always contains the leader
    pub members: Vec<PlayerId>,

    /// Creation time (unix millis)
    pub created_at: u64,

    /// Whether players may join without an invitation
    #[serde(default)]
    pub open: bool,

    /// Incremented on every committed change of this record
    #[serde(default)]
    pub revision: u64,
}

impl Party {
    /// A party of one
    pub fn new(leader: PlayerId, created_at: u64) -> Self {
        Self {
            schema: SCHEMA_VERSION,
            id: Uuid::new_v4(),
            leader,
            members: vec![leader],
            created_at,
            open: false,
            revision: 1,
        }
    }

    pub fn is_leader(&self, player: PlayerId) -> bool {
        self.leader == player
    }

    pub fn is_member(&self, player: PlayerId) -> bool {
        self.members.contains(&player)
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// Members other than the leader, in join order
    pub fn non_leaders(&self) -> impl Iterator<Item = PlayerId> + '_ {
        self.members.iter().copied().filter(move |m| *m != self.leader)
    }

    /// Earliest-joined member who is not the leader
    pub fn successor(&self) -> Option<PlayerId> {
        self.non_leaders().next()
    }

    /// Next revision with `player` appended
    pub(crate) fn with_member(&self, player: PlayerId) -> Self {
        let mut next = self.bumped();
        if !next.members.contains(&player) {
            next.members.push(player);
        }
        next
    }

    /// Next revision with `player` removed; a departing leader hands over to
    /// the successor
    pub(crate) fn without_member(&self, player: PlayerId) -> Self {
        let mut next = self.bumped();
        next.members.retain(|m| *m != player);
        if next.leader == player {
            if let Some(successor) = next.members.first().copied() {
                next.leader = successor;
            }
        }
        next
    }

    pub(crate) fn with_leader(&self, leader: PlayerId) -> Self {
        let mut next = self.bumped();
        next.leader = leader;
        next
    }

    pub(crate) fn with_open(&self, open: bool) -> Self {
        let mut next = self.bumped();
        next.open = open;
        next
    }

    fn bumped(&self) -> Self {
        let mut next = self.clone();
        next.schema = SCHEMA_VERSION;
        next.revision = self.revision + 1;
        next
    }

    pub fn summary(&self) -> PartySummary {
        PartySummary {
            id: self.id,
            leader: self.leader,
            members: self.members.clone(),
            open: self.open,
            revision: self.revision,
        }
    }
}

/// What a node needs to answer "which party is this player in"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartySummary {
    pub id: PartyId,
    pub leader: PlayerId,
    pub members: Vec<PlayerId>,
    pub open: bool,
    pub revision: u64,
}

impl PartySummary {
    pub fn is_leader(&self, player: PlayerId) -> bool {
        self.leader == player
    }
}

/// Membership index entry, stored under `member:{player}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    #[serde(default = "default_schema")]
    pub schema: u32,

    /// Leader of the party the player belongs to
    pub leader: PlayerId,
}

impl MemberRecord {
    pub fn new(leader: PlayerId) -> Self {
        Self {
            schema: SCHEMA_VERSION,
            leader,
        }
    }
}

/// A connected player, stored under `online:{player}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerSession {
    #[serde(default = "default_schema")]
    pub schema: u32,

    pub id: PlayerId,

    pub name: String,

    /// Front-end node the player is connected through
    pub node: String,

    /// Login time (unix millis)
    #[serde(default)]
    pub since: u64,
}

impl PlayerSession {
    pub fn new(id: PlayerId, name: impl Into<String>, node: impl Into<String>, since: u64) -> Self {
        Self {
            schema: SCHEMA_VERSION,
            id,
            name: name.into(),
            node: node.into(),
            since,
        }
    }
}
