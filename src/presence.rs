//! Presence registry
//!
//! Which players are online, under what name, and through which node.
//! Sessions live in the shared store under `online:{player}`, so every node
//! can resolve a display name typed by a player on another node.
//!
//! A logout only counts as a disconnect from the network when the session
//! still belongs to the node reporting it; a player who already reconnected
//! through another node keeps their party.

use std::sync::Arc;

use bytes::Bytes;

use crate::clock::SharedClock;
use crate::coordinator::{Coordinator, LeaveOutcome};
use crate::error::Result;
use crate::model::{self, keys, PlayerId, PlayerSession};
use crate::store::{SharedStore, Transaction};

pub struct Presence {
    store: Arc<dyn SharedStore>,
    coordinator: Arc<Coordinator>,
    node_id: String,
    clock: SharedClock,
}

impl Presence {
    pub fn new(coordinator: Arc<Coordinator>, clock: SharedClock) -> Self {
        Self {
            store: Arc::clone(coordinator.store()),
            node_id: coordinator.node_id().to_string(),
            coordinator,
            clock,
        }
    }

    /// Record `player` as connected through this node
    pub fn login(&self, player: PlayerId, name: &str) -> Result<PlayerSession> {
        let session = PlayerSession::new(player, name, self.node_id.as_str(), self.clock.now_millis());
        self.store
            .set(&keys::online(player), Bytes::from(model::encode(&session)?))?;
        tracing::debug!("{} ({}) online via {}", name, player, self.node_id);
        Ok(session)
    }

    /// Record `player` as gone and run disconnect handling
    ///
    /// Returns what happened to their party, or None if they had none or
    /// their session has moved to another node.
    pub fn logout(&self, player: PlayerId) -> Result<Option<LeaveOutcome>> {
        let key = keys::online(player);
        if let Some(versioned) = self.store.get(&key)? {
            let session: PlayerSession = model::decode(&key, &versioned.value)?;
            if session.node != self.node_id {
                tracing::debug!("{} now online via {}, keeping party", player, session.node);
                return Ok(None);
            }
            let txn = Transaction::new()
                .expect(key.as_str(), Some(versioned.version))
                .delete(key.as_str());
            if !self.store.commit(txn)?.is_committed() {
                tracing::debug!("Session of {} changed during logout, keeping party", player);
                return Ok(None);
            }
        }
        self.coordinator.disconnect(player)
    }

    pub fn session(&self, player: PlayerId) -> Result<Option<PlayerSession>> {
        let key = keys::online(player);
        match self.store.get(&key)? {
            Some(versioned) => Ok(Some(model::decode(&key, &versioned.value)?)),
            None => Ok(None),
        }
    }

    pub fn is_online(&self, player: PlayerId) -> Result<bool> {
        Ok(self.store.get(&keys::online(player))?.is_some())
    }

    /// Online player whose name matches, ignoring case
    pub fn find_by_name(&self, name: &str) -> Result<Option<PlayerSession>> {
        Ok(self
            .online_players()?
            .into_iter()
            .find(|session| session.name.eq_ignore_ascii_case(name)))
    }

    pub fn online_players(&self) -> Result<Vec<PlayerSession>> {
        let mut sessions = Vec::new();
        for (key, versioned) in self.store.scan(keys::ONLINE_PREFIX)? {
            sessions.push(model::decode(&key, &versioned.value)?);
        }
        Ok(sessions)
    }
}
