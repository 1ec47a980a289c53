//! Network Module
//!
//! TCP server hosting the shared store.
//!
//! ## Architecture
//! - Single non-blocking acceptor loop (also drives TTL purging)
//! - One thread per connection, bounded by `max_connections`
//! - Commands executed directly against the [`MemoryStore`](crate::store::MemoryStore)
//! - SUBSCRIBE turns a connection into a push stream of MESSAGE frames

mod connection;
mod server;

pub use connection::Connection;
pub use server::{Server, ShutdownHandle};
