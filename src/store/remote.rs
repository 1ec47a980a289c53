//! Remote store client
//!
//! Talks to a `partysync-store` server over TCP.
//!
//! ## Connections
//! ```text
//! RemoteStore
//!   ├─ pool: [conn, conn, ...]    request/response, reused
//!   └─ per subscribe():           dedicated push connection
//!                                 + reader thread ──► crossbeam channel
//! ```
//!
//! Every request runs under the configured timeout. A connection that fails
//! mid-request is discarded rather than returned to the pool, since its
//! framing state is unknown.

use std::io::{BufReader, BufWriter, ErrorKind};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;

use crate::error::{PartyError, Result};
use crate::protocol::{self, read_response, write_command, Command, Response, Status};
use super::{CommitOutcome, SharedStore, Subscription, Transaction, Version, Versioned};

/// Idle connections kept for reuse
const MAX_IDLE_CONNECTIONS: usize = 8;

/// Queue depth between a subscription's reader thread and its consumer
const SUBSCRIPTION_CAPACITY: usize = 1024;

/// One request/response connection
struct ClientConnection {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl ClientConnection {
    fn open(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(|e| unavailable(addr, e))?;
        Self::configure(&stream, timeout).map_err(|e| unavailable(addr, e))?;

        let read_stream = stream.try_clone().map_err(|e| unavailable(addr, e))?;
        Ok(Self {
            reader: BufReader::new(read_stream),
            writer: BufWriter::new(stream),
        })
    }

    fn configure(stream: &TcpStream, timeout: Duration) -> std::io::Result<()> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))
    }

    fn request(&mut self, command: &Command) -> Result<Response> {
        write_command(&mut self.writer, command)?;
        read_response(&mut self.reader)
    }
}

/// [`SharedStore`] backed by a store server
pub struct RemoteStore {
    addr: SocketAddr,
    timeout: Duration,
    pool: Mutex<Vec<ClientConnection>>,
}

impl RemoteStore {
    /// Resolve `addr` and verify the server answers a PING
    pub fn connect(addr: &str, timeout: Duration) -> Result<Self> {
        let resolved = addr
            .to_socket_addrs()
            .map_err(|e| PartyError::Config(format!("invalid store address {}: {}", addr, e)))?
            .next()
            .ok_or_else(|| PartyError::Config(format!("store address {} did not resolve", addr)))?;

        let store = Self {
            addr: resolved,
            timeout,
            pool: Mutex::new(Vec::new()),
        };
        store.ping()?;
        tracing::info!("Connected to store at {}", resolved);
        Ok(store)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Send one command on a pooled connection
    fn call(&self, command: Command) -> Result<Response> {
        let pooled = self.pool.lock().pop();
        let mut conn = match pooled {
            Some(conn) => conn,
            None => ClientConnection::open(self.addr, self.timeout)?,
        };

        match conn.request(&command) {
            Ok(response) => {
                let mut pool = self.pool.lock();
                if pool.len() < MAX_IDLE_CONNECTIONS {
                    pool.push(conn);
                }
                drop(pool);
                check_status(response)
            }
            Err(PartyError::Io(e)) => {
                tracing::debug!("Dropping connection to {}: {}", self.addr, e);
                Err(unavailable(self.addr, e))
            }
            Err(e) => Err(e),
        }
    }
}

impl SharedStore for RemoteStore {
    fn get(&self, key: &str) -> Result<Option<Versioned>> {
        let response = self.call(Command::Get {
            key: key.to_string(),
        })?;
        match response.status {
            Status::NotFound => Ok(None),
            _ => Ok(Some(protocol::decode_versioned(response.body())?)),
        }
    }

    fn scan(&self, prefix: &str) -> Result<Vec<(String, Versioned)>> {
        let response = self.call(Command::Scan {
            prefix: prefix.to_string(),
        })?;
        protocol::decode_entries(response.body())
    }

    fn commit(&self, txn: Transaction) -> Result<CommitOutcome> {
        let response = self.call(Command::Commit { txn })?;
        match response.status {
            Status::Conflict => Ok(CommitOutcome::Conflict {
                key: String::from_utf8_lossy(response.body()).into_owned(),
            }),
            _ => Ok(CommitOutcome::Committed {
                version: protocol::decode_version(response.body())?,
            }),
        }
    }

    fn publish(&self, channel: &str, payload: Bytes) -> Result<usize> {
        let response = self.call(Command::Publish {
            channel: channel.to_string(),
            payload: payload.to_vec(),
        })?;
        protocol::decode_receivers(response.body())
    }

    fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut conn = ClientConnection::open(self.addr, self.timeout)?;
        let ack = conn
            .request(&Command::Subscribe {
                channel: channel.to_string(),
            })
            .map_err(|e| match e {
                PartyError::Io(e) => unavailable(self.addr, e),
                other => other,
            })?;
        check_status(ack)?;

        // Push frames arrive whenever they are published
        let stream = conn
            .reader
            .get_ref()
            .try_clone()
            .map_err(|e| unavailable(self.addr, e))?;
        conn.reader
            .get_ref()
            .set_read_timeout(None)
            .map_err(|e| unavailable(self.addr, e))?;

        let (sender, receiver) = channel::bounded(SUBSCRIPTION_CAPACITY);
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stopped);
        let channel_name = channel.to_string();
        thread::Builder::new()
            .name(format!("store-sub-{}", channel))
            .spawn(move || pump_messages(conn, sender, flag, channel_name))?;

        tracing::debug!("Subscribed to {} on {}", channel, self.addr);
        Ok(Subscription::with_guard(
            receiver,
            Box::new(PushGuard { stream, stopped }),
        ))
    }

    fn ping(&self) -> Result<()> {
        self.call(Command::Ping)?;
        Ok(())
    }

    fn set_with_expiry(&self, key: &str, value: Bytes, ttl: Duration) -> Result<Version> {
        let response = self.call(Command::Set {
            key: key.to_string(),
            value: value.to_vec(),
            ttl_ms: (ttl.as_millis() as u64).max(1),
        })?;
        protocol::decode_version(response.body())
    }

    fn set(&self, key: &str, value: Bytes) -> Result<Version> {
        let response = self.call(Command::Set {
            key: key.to_string(),
            value: value.to_vec(),
            ttl_ms: 0,
        })?;
        protocol::decode_version(response.body())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.call(Command::Delete {
            key: key.to_string(),
        })?;
        Ok(())
    }
}

// =============================================================================
// Push connections
// =============================================================================

/// Closes the push connection when the subscription is dropped
struct PushGuard {
    stream: TcpStream,
    stopped: Arc<AtomicBool>,
}

impl Drop for PushGuard {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Forward MESSAGE frames until the connection or the consumer goes away
fn pump_messages(
    mut conn: ClientConnection,
    sender: Sender<crate::store::Message>,
    stopped: Arc<AtomicBool>,
    channel: String,
) {
    loop {
        let response = match read_response(&mut conn.reader) {
            Ok(response) => response,
            Err(PartyError::Io(ref e)) if e.kind() == ErrorKind::UnexpectedEof => {
                if !stopped.load(Ordering::SeqCst) {
                    tracing::warn!("Subscription to {} closed by server", channel);
                }
                return;
            }
            Err(e) => {
                if !stopped.load(Ordering::SeqCst) {
                    tracing::warn!("Subscription to {} failed: {}", channel, e);
                }
                return;
            }
        };

        if response.status != Status::Message {
            tracing::warn!(
                "Unexpected {:?} frame on subscription to {}",
                response.status,
                channel
            );
            continue;
        }

        match protocol::decode_message(response.body()) {
            Ok(message) => {
                if sender.send(message).is_err() {
                    return;
                }
            }
            Err(e) => tracing::warn!("Malformed message on {}: {}", channel, e),
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn unavailable(addr: SocketAddr, err: std::io::Error) -> PartyError {
    PartyError::StoreUnavailable(format!("{}: {}", addr, err))
}

/// Turn an ERROR response into an error
fn check_status(response: Response) -> Result<Response> {
    if response.status == Status::Error {
        return Err(PartyError::Protocol(
            String::from_utf8_lossy(response.body()).into_owned(),
        ));
    }
    Ok(response)
}
