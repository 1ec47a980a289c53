//! Command definitions
//!
//! Represents requests from store clients.

use crate::store::Transaction;

/// Command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandType {
    Get = 0x01,
    Set = 0x02,
    Delete = 0x03,
    Ping = 0x04,
    Commit = 0x05,
    Scan = 0x06,
    Publish = 0x07,
    Subscribe = 0x08,
}

/// A parsed command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Get a value and its version
    Get { key: String },

    /// Unconditionally set a value; `ttl_ms == 0` means no expiry
    Set { key: String, value: Vec<u8>, ttl_ms: u64 },

    /// Delete a key
    Delete { key: String },

    /// Ping (health check)
    Ping,

    /// Apply a transaction if every version expectation holds
    Commit { txn: Transaction },

    /// All live keys starting with `prefix`
    Scan { prefix: String },

    /// Broadcast a payload to a channel's subscribers
    Publish { channel: String, payload: Vec<u8> },

    /// Switch this connection to push mode for `channel`
    Subscribe { channel: String },
}

impl Command {
    /// Get the command type
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::Get { .. } => CommandType::Get,
            Command::Set { .. } => CommandType::Set,
            Command::Delete { .. } => CommandType::Delete,
            Command::Ping => CommandType::Ping,
            Command::Commit { .. } => CommandType::Commit,
            Command::Scan { .. } => CommandType::Scan,
            Command::Publish { .. } => CommandType::Publish,
            Command::Subscribe { .. } => CommandType::Subscribe,
        }
    }
}
