//! # PartySync
//!
//! Party state synchronization for a network of game-server front-end nodes:
//! - Shared versioned key-value store with atomic multi-key commits and TTLs
//! - Optimistic coordinator for the party lifecycle (create, invite, join,
//!   leave, kick, transfer, disband, disconnect)
//! - Pub/sub event bus keeping per-node projections current, plus party chat
//!   on its own topic
//! - Asynchronous snapshot mirror into a durable backend, used to warm a
//!   cold store on startup
//! - Per-player settings kept in the same durable backend
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Front-end Node                          │
//! │   Presence ──► Coordinator ──► Mirror ──► Durable snapshots │
//! │                    │     ▲                (SQL / document)  │
//! │        Projection ◄┘     │                                  │
//! └───────────▲──────────────┼──────────────────────────────────┘
//!             │ events       │ read / commit
//! ┌───────────┴──────────────▼──────────────────────────────────┐
//! │          Shared Store (in-process or store server)          │
//! │     versioned keys · conditional commits · TTL · pub/sub    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod clock;
pub mod retry;

pub mod model;
pub mod protocol;
pub mod store;
pub mod network;
pub mod bus;
pub mod durable;
pub mod coordinator;
pub mod projection;
pub mod presence;
pub mod node;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{PartyError, Result};
pub use config::Config;
pub use coordinator::{Coordinator, LeaveOutcome};
pub use model::{Invitation, Party, PartyEvent, PartyId, PartyMessage, PlayerId, PlayerSetting};
pub use node::{MessageListener, Node, NodeBuilder};
pub use presence::Presence;
pub use projection::Projection;
pub use store::{MemoryStore, RemoteStore, SharedStore};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of PartySync
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
