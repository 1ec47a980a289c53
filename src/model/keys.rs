//! Store key layout

use uuid::Uuid;

use super::PlayerId;

pub const PARTY_PREFIX: &str = "party:";
pub const MEMBER_PREFIX: &str = "member:";
pub const INVITE_PREFIX: &str = "invite:";
pub const INBOX_PREFIX: &str = "inbox:";
pub const ONLINE_PREFIX: &str = "online:";
pub const OUTBOX_PREFIX: &str = "outbox:";
pub const COMMIT_PREFIX: &str = "commit:";

pub fn party(leader: PlayerId) -> String {
    format!("{}{}", PARTY_PREFIX, leader)
}

pub fn member(player: PlayerId) -> String {
    format!("{}{}", MEMBER_PREFIX, player)
}

pub fn invite(leader: PlayerId, invitee: PlayerId) -> String {
    format!("{}{}:{}", INVITE_PREFIX, leader, invitee)
}

/// Prefix of every invitation sent on behalf of `leader`'s party
pub fn invites_of(leader: PlayerId) -> String {
    format!("{}{}:", INVITE_PREFIX, leader)
}

/// Rewritten by every invitation issued on behalf of `leader`'s party
pub fn outbox(leader: PlayerId) -> String {
    format!("{}{}", OUTBOX_PREFIX, leader)
}

pub fn inbox(invitee: PlayerId, leader: PlayerId) -> String {
    format!("{}{}:{}", INBOX_PREFIX, invitee, leader)
}

/// Prefix of every invitation addressed to `invitee`
pub fn inbox_of(invitee: PlayerId) -> String {
    format!("{}{}:", INBOX_PREFIX, invitee)
}

pub fn online(player: PlayerId) -> String {
    format!("{}{}", ONLINE_PREFIX, player)
}

/// Marker written by one commit attempt, so a resend can tell whether it landed
pub fn commit_marker(attempt: Uuid) -> String {
    format!("{}{}", COMMIT_PREFIX, attempt)
}
