//! Data Model
//!
//! Records held in the shared store and the events broadcast on the bus.
//!
//! ## Keyspace
//! ```text
//! party:{leader}             -> Party          (authoritative party record)
//! member:{player}            -> MemberRecord   (one-party-per-player index)
//! invite:{leader}:{invitee}  -> Invitation     (TTL, party-side)
//! inbox:{invitee}:{leader}   -> Invitation     (TTL, invitee-side index)
//! online:{player}            -> PlayerSession  (presence)
//! outbox:{leader}            -> Outbox         (rewritten on every invite)
//! commit:{attempt}           -> node id        (TTL, commit acknowledgement)
//! ```
//!
//! Chat travels as [`PartyMessage`]s on its own bus topic and is not stored.
//!
//! All records are JSON with a `schema` field. Unknown fields are ignored and
//! absent optional fields take defaults, so readers and writers of adjacent
//! schema versions interoperate.

mod event;
mod invite;
mod message;
mod party;
mod setting;
pub mod keys;

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{PartyError, Result};

pub use event::{EventKind, PartyEvent};
pub use invite::{Invitation, Outbox};
pub use message::PartyMessage;
pub use party::{MemberRecord, Party, PartySummary, PlayerSession};
pub use setting::PlayerSetting;

/// Identity of a player
pub type PlayerId = Uuid;

/// Stable identity of a party across leadership changes
pub type PartyId = Uuid;

/// Current record schema version
pub const SCHEMA_VERSION: u32 = 1;

pub(crate) fn default_schema() -> u32 {
    SCHEMA_VERSION
}

/// Serialize a record to its wire form
pub fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(record)?)
}

/// Deserialize a record from its wire form
///
/// A record that does not parse is corruption in the store, not a caller error.
pub fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| PartyError::Corruption(format!("record {}: {}", key, e)))
}
