//! Error types for partysync
//!
//! Provides a unified error type for all operations. Variants fall into four
//! classes (see [`ErrorClass`]): caller/state validation failures, lost
//! optimistic races, unavailable infrastructure, and internal faults.

use thiserror::Error;

use crate::model::PlayerId;

/// Result type alias using PartyError
pub type Result<T> = std::result::Result<T, PartyError>;

/// Unified error type for partysync operations
#[derive(Debug, Error)]
pub enum PartyError {
    // -------------------------------------------------------------------------
    // Validation Errors (never retried)
    // -------------------------------------------------------------------------
    #[error("player {0} is already in a party")]
    AlreadyInParty(PlayerId),

    #[error("player {0} is not the leader of a party")]
    NotPartyLeader(PlayerId),

    #[error("player {invitee} already has an outstanding invitation from {leader}")]
    AlreadyInvited { leader: PlayerId, invitee: PlayerId },

    #[error("player {0} is already a member of the inviting party")]
    InviteeAlreadyMember(PlayerId),

    #[error("no valid invitation from {leader} for {invitee}")]
    InviteExpiredOrMissing { leader: PlayerId, invitee: PlayerId },

    #[error("player {0} must leave their current party first")]
    InviteeAlreadyInOtherParty(PlayerId),

    #[error("player {0} is not in a party")]
    NotInParty(PlayerId),

    #[error("player {0} is not a member of this party")]
    TargetNotMember(PlayerId),

    #[error("player {0} cannot target themselves")]
    CannotTargetSelf(PlayerId),

    #[error("party led by {leader} is full ({limit} members)")]
    PartyFull { leader: PlayerId, limit: usize },

    #[error("party led by {0} is not open for joining")]
    PartyClosed(PlayerId),

    #[error("no party is led by {0}")]
    PartyNotFound(PlayerId),

    #[error("party messages cannot be empty")]
    EmptyMessage,

    #[error("unknown setting {0:?}")]
    UnknownSetting(String),

    // -------------------------------------------------------------------------
    // Race Errors (retried internally, surfaced once retries are exhausted)
    // -------------------------------------------------------------------------
    #[error("concurrent modification after {attempts} attempts")]
    ConcurrentModification { attempts: u32 },

    // -------------------------------------------------------------------------
    // Infrastructure Errors
    // -------------------------------------------------------------------------
    #[error("shared store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("event bus unavailable: {0}")]
    BusUnavailable(String),

    #[error("durable store error: {0}")]
    Durable(String),

    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Data Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    // -------------------------------------------------------------------------
    // Protocol Errors
    // -------------------------------------------------------------------------
    #[error("Protocol error: {0}")]
    Protocol(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Coarse classification used by callers and by the retry loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Caller input or current state violates a precondition
    Validation,
    /// An optimistic write lost a race
    Conflict,
    /// Store, bus or durable backend cannot be reached
    Unavailable,
    /// Corrupt data, protocol or configuration faults
    Internal,
}

impl PartyError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PartyError::AlreadyInParty(_)
            | PartyError::NotPartyLeader(_)
            | PartyError::AlreadyInvited { .. }
            | PartyError::InviteeAlreadyMember(_)
            | PartyError::InviteExpiredOrMissing { .. }
            | PartyError::InviteeAlreadyInOtherParty(_)
            | PartyError::NotInParty(_)
            | PartyError::TargetNotMember(_)
            | PartyError::CannotTargetSelf(_)
            | PartyError::PartyFull { .. }
            | PartyError::PartyClosed(_)
            | PartyError::PartyNotFound(_)
            | PartyError::EmptyMessage
            | PartyError::UnknownSetting(_) => ErrorClass::Validation,
            PartyError::ConcurrentModification { .. } => ErrorClass::Conflict,
            PartyError::StoreUnavailable(_)
            | PartyError::BusUnavailable(_)
            | PartyError::Durable(_)
            | PartyError::Io(_) => ErrorClass::Unavailable,
            PartyError::Serialization(_)
            | PartyError::Corruption(_)
            | PartyError::Protocol(_)
            | PartyError::Config(_) => ErrorClass::Internal,
        }
    }

    /// True for validation failures, which are surfaced immediately
    pub fn is_validation(&self) -> bool {
        self.class() == ErrorClass::Validation
    }
}

impl From<serde_json::Error> for PartyError {
    fn from(err: serde_json::Error) -> Self {
        PartyError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for PartyError {
    fn from(err: bincode::Error) -> Self {
        PartyError::Serialization(err.to_string())
    }
}
