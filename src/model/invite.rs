//! Invitation records

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{default_schema, PlayerId, SCHEMA_VERSION};

/// A time-limited offer for `invitee` to join the party led by `leader`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitation {
    #[serde(default = "default_schema")]
    pub schema: u32,

    pub leader: PlayerId,

    pub invitee: PlayerId,

    /// Creation time (unix millis)
    pub created_at: u64,

    /// Expiry time (unix millis); unusable from this instant on
    pub expires_at: u64,
}

impl Invitation {
    pub fn new(leader: PlayerId, invitee: PlayerId, created_at: u64, ttl: Duration) -> Self {
        Self {
            schema: SCHEMA_VERSION,
            leader,
            invitee,
            created_at,
            expires_at: created_at.saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)),
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// Time left before expiry, None once expired
    pub fn remaining(&self, now: u64) -> Option<Duration> {
        if self.is_expired(now) {
            None
        } else {
            Some(Duration::from_millis(self.expires_at - now))
        }
    }

    /// Same offer re-issued on behalf of a new leader, keeping its expiry
    pub(crate) fn reissued_by(&self, leader: PlayerId) -> Self {
        Self {
            schema: SCHEMA_VERSION,
            leader,
            ..self.clone()
        }
    }
}

/// Stored under `outbox:{leader}` and rewritten whenever `leader` issues an
/// invitation
///
/// A prefix scan only records the invitations present when it ran. Every
/// operation that sweeps a leader's invitations reads this record as well,
/// so an invitation issued after the sweep makes its commit conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outbox {
    #[serde(default = "default_schema")]
    pub schema: u32,

    pub leader: PlayerId,

    /// Creation time of the latest invitation (unix millis)
    #[serde(default)]
    pub last_issued: u64,
}

impl Outbox {
    pub fn new(leader: PlayerId, last_issued: u64) -> Self {
        Self {
            schema: SCHEMA_VERSION,
            leader,
            last_issued,
        }
    }
}
