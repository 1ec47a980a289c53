//! Party chat messages
//!
//! Published on their own bus topic and never stored. Each message names its
//! recipients, so a node delivers it to whichever of them it hosts.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{default_schema, Party, PartyId, PlayerId, SCHEMA_VERSION};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyMessage {
    #[serde(default = "default_schema")]
    pub schema: u32,

    pub message_id: Uuid,

    pub party: PartyId,

    pub sender: PlayerId,

    /// Every member at send time, sender included
    #[serde(default)]
    pub recipients: Vec<PlayerId>,

    pub text: String,

    /// Unix millis
    pub sent_at: u64,

    /// Node that accepted the message
    #[serde(default)]
    pub origin: String,
}

impl PartyMessage {
    pub fn new(party: &Party, sender: PlayerId, text: &str, sent_at: u64, origin: &str) -> Self {
        Self {
            schema: SCHEMA_VERSION,
            message_id: Uuid::new_v4(),
            party: party.id,
            sender,
            recipients: party.members.clone(),
            text: text.to_string(),
            sent_at,
            origin: origin.to_string(),
        }
    }

    pub fn is_for(&self, player: PlayerId) -> bool {
        self.recipients.contains(&player)
    }
}
