//! Connection Handler
//!
//! Handles individual client connections.

use std::io::{BufReader, BufWriter, ErrorKind};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::RecvTimeoutError;

use crate::error::{PartyError, Result};
use crate::protocol::{self, read_command, write_response, Command, Response};
use crate::store::{CommitOutcome, MemoryStore, SharedStore};

/// How often a push connection checks for shutdown and peer hang-up
const PUSH_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Handles a single client connection
pub struct Connection {
    /// TCP stream reader (buffered for efficiency)
    reader: BufReader<TcpStream>,

    /// TCP stream writer (buffered for efficiency)
    writer: BufWriter<TcpStream>,

    /// The keyspace being served
    store: Arc<MemoryStore>,

    /// Set when the server is stopping
    shutdown: Arc<AtomicBool>,

    /// Peer address for logging
    peer_addr: String,
}

impl Connection {
    /// Create a new connection handler
    ///
    /// Sets up buffered I/O and disables Nagle's algorithm
    pub fn new(stream: TcpStream, store: Arc<MemoryStore>, shutdown: Arc<AtomicBool>) -> Result<Self> {
        // Get peer address for logging before we split the stream
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        // Disable Nagle's algorithm for low latency
        stream.set_nodelay(true)?;

        // Clone stream for separate read/write handles
        let read_stream = stream.try_clone()?;
        let write_stream = stream;

        Ok(Self {
            reader: BufReader::new(read_stream),
            writer: BufWriter::new(write_stream),
            store,
            shutdown,
            peer_addr,
        })
    }

    /// Configure connection timeouts
    pub fn set_timeouts(&mut self, read_ms: u64, write_ms: u64) -> Result<()> {
        let read_stream = self.reader.get_ref();
        let write_stream = self.writer.get_ref();

        if read_ms > 0 {
            read_stream.set_read_timeout(Some(Duration::from_millis(read_ms)))?;
        }
        if write_ms > 0 {
            write_stream.set_write_timeout(Some(Duration::from_millis(write_ms)))?;
        }

        Ok(())
    }

    /// Handle the connection (blocking until closed)
    ///
    /// Reads commands in a loop and sends responses. A SUBSCRIBE switches the
    /// connection to push mode for the rest of its life.
    pub fn handle(&mut self) -> Result<()> {
        tracing::debug!("Connection established from {}", self.peer_addr);

        loop {
            // Read next command
            let command = match read_command(&mut self.reader) {
                Ok(cmd) => cmd,
                Err(PartyError::Io(ref e)) if is_hangup(e.kind()) => {
                    tracing::debug!("Client {} disconnected ({:?})", self.peer_addr, e.kind());
                    return Ok(());
                }
                Err(PartyError::Io(ref e))
                    if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    // Read timeout (Windows uses TimedOut instead of WouldBlock)
                    tracing::debug!("Read timeout for client {}", self.peer_addr);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!("Error reading from {}: {}", self.peer_addr, e);
                    // Send error response if possible
                    let _ = self.send_response(Response::error(&e.to_string()));
                    return Err(e);
                }
            };

            tracing::trace!("Received command from {}: {:?}", self.peer_addr, command);

            if let Command::Subscribe { channel } = command {
                let result = self.serve_subscription(&channel);
                return self.absorb_hangup(result);
            }

            // Execute command
            let response = self.execute_command(command);

            // Send response
            if let Err(e) = self.send_response(response) {
                return self.absorb_hangup(Err(e));
            }
        }
    }

    /// Execute a command and return a response
    fn execute_command(&self, command: Command) -> Response {
        let result = match command {
            Command::Get { key } => self.store.get(&key).map(|found| match found {
                Some(versioned) => Response::ok(Some(protocol::encode_versioned(&versioned))),
                None => Response::not_found(),
            }),
            Command::Set { key, value, ttl_ms } => {
                let value = Bytes::from(value);
                let written = if ttl_ms > 0 {
                    self.store
                        .set_with_expiry(&key, value, Duration::from_millis(ttl_ms))
                } else {
                    self.store.set(&key, value)
                };
                written.map(|version| Response::ok(Some(protocol::encode_version(version))))
            }
            Command::Delete { key } => self.store.delete(&key).map(|()| Response::ok(None)),
            Command::Ping => Ok(Response::ok(None)),
            Command::Commit { txn } => self.store.commit(txn).map(|outcome| match outcome {
                CommitOutcome::Committed { version } => {
                    Response::ok(Some(protocol::encode_version(version)))
                }
                CommitOutcome::Conflict { key } => Response::conflict(&key),
            }),
            Command::Scan { prefix } => self
                .store
                .scan(&prefix)
                .map(|entries| Response::ok(Some(protocol::encode_entries(&entries)))),
            Command::Publish { channel, payload } => self
                .store
                .publish(&channel, Bytes::from(payload))
                .map(|receivers| Response::ok(Some(protocol::encode_receivers(receivers)))),
            Command::Subscribe { .. } => Err(PartyError::Protocol(
                "SUBSCRIBE is handled by the connection loop".to_string(),
            )),
        };

        result.unwrap_or_else(|e| Response::error(&e.to_string()))
    }

    /// Push every message published on `channel` until the peer or server goes away
    fn serve_subscription(&mut self, channel: &str) -> Result<()> {
        let subscription = self.store.subscribe(channel)?;
        self.send_response(Response::ok(None))?;
        tracing::debug!("Client {} subscribed to {}", self.peer_addr, channel);

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return Ok(());
            }
            match subscription.recv_timeout(PUSH_POLL_INTERVAL) {
                Ok(message) => {
                    self.send_response(Response::message(protocol::encode_message(&message)))?;
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.peer_closed()? {
                        tracing::debug!("Subscriber {} went away", self.peer_addr);
                        return Ok(());
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::debug!("Subscription of {} closed by store", self.peer_addr);
                    return Ok(());
                }
            }
        }
    }

    /// Non-blocking check for EOF on an otherwise silent connection
    fn peer_closed(&self) -> Result<bool> {
        let stream = self.reader.get_ref();
        stream.set_nonblocking(true)?;
        let mut byte = [0u8; 1];
        let result = stream.peek(&mut byte);
        stream.set_nonblocking(false)?;

        Ok(match result {
            Ok(0) => true,
            Ok(_) => false,
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => false,
            Err(_) => true,
        })
    }

    /// Treat a client that vanished mid-write as a normal disconnect
    fn absorb_hangup(&self, result: Result<()>) -> Result<()> {
        match result {
            Err(PartyError::Io(ref e)) if is_hangup(e.kind()) => {
                tracing::debug!(
                    "Client {} disconnected before response could be sent: {}",
                    self.peer_addr,
                    e
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Error writing to {}: {}", self.peer_addr, e);
                Err(e)
            }
            Ok(()) => Ok(()),
        }
    }

    /// Send a response to the client
    fn send_response(&mut self, response: Response) -> Result<()> {
        write_response(&mut self.writer, &response)?;
        Ok(())
    }

    /// Get the peer address string
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }
}

fn is_hangup(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
    )
}
