//! TCP Server
//!
//! Accepts connections and runs each one on its own thread.

use std::collections::HashMap;
use std::io::{BufWriter, ErrorKind};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::Config;
use crate::error::Result;
use crate::protocol::{write_response, Response};
use crate::store::MemoryStore;
use super::Connection;

/// Accept loop sleep when no connection is pending
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How often expired keys are purged from the keyspace
const PURGE_INTERVAL: Duration = Duration::from_secs(1);

/// Cloneable handle that stops a running [`Server`]
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// TCP server exposing a [`MemoryStore`]
pub struct Server {
    config: Config,
    store: Arc<MemoryStore>,
    listener: TcpListener,
    shutdown: Arc<AtomicBool>,

    /// Streams of live connections, closed on shutdown
    connections: Arc<Mutex<HashMap<u64, TcpStream>>>,
    active: Arc<AtomicUsize>,
    next_id: AtomicU64,
}

impl Server {
    /// Bind the listen address from `config`
    pub fn bind(config: Config, store: Arc<MemoryStore>) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr)?;
        listener.set_nonblocking(true)?;

        Ok(Self {
            config,
            store,
            listener,
            shutdown: Arc::new(AtomicBool::new(false)),
            connections: Arc::new(Mutex::new(HashMap::new())),
            active: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicU64::new(0),
        })
    }

    /// Actual bound address (useful when binding port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
        }
    }

    /// Signal the server to shutdown gracefully
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Number of connections being served
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Start the server (blocking until shutdown)
    pub fn run(&self) -> Result<()> {
        tracing::info!("Store server listening on {}", self.local_addr()?);
        let mut last_purge = Instant::now();

        while !self.shutdown.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = self.dispatch(stream, peer) {
                        tracing::warn!("Failed to start connection from {}: {}", peer, e);
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
            }

            if last_purge.elapsed() >= PURGE_INTERVAL {
                self.store.purge_expired();
                last_purge = Instant::now();
            }
        }

        let open: Vec<TcpStream> = self.connections.lock().drain().map(|(_, s)| s).collect();
        tracing::info!("Store server stopping, closing {} connections", open.len());
        for stream in open {
            let _ = stream.shutdown(Shutdown::Both);
        }
        Ok(())
    }

    /// Hand an accepted stream to its own thread, or refuse it when full
    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        stream.set_nonblocking(false)?;

        if self.active.load(Ordering::SeqCst) >= self.config.max_connections {
            tracing::warn!("Refusing {}: connection limit reached", peer);
            let mut writer = BufWriter::new(stream);
            let _ = write_response(&mut writer, &Response::error("too many connections"));
            return Ok(());
        }

        let tracked = stream.try_clone()?;
        let mut connection = Connection::new(stream, Arc::clone(&self.store), Arc::clone(&self.shutdown))?;
        connection.set_timeouts(self.config.read_timeout_ms, self.config.write_timeout_ms)?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.connections.lock().insert(id, tracked);
        self.active.fetch_add(1, Ordering::SeqCst);

        let connections = Arc::clone(&self.connections);
        let active = Arc::clone(&self.active);
        let spawned = thread::Builder::new()
            .name(format!("conn-{}", id))
            .spawn(move || {
                if let Err(e) = connection.handle() {
                    tracing::debug!("Connection {} ended with error: {}", connection.peer_addr(), e);
                }
                connections.lock().remove(&id);
                active.fetch_sub(1, Ordering::SeqCst);
            });

        if let Err(e) = spawned {
            self.connections.lock().remove(&id);
            self.active.fetch_sub(1, Ordering::SeqCst);
            return Err(e.into());
        }
        Ok(())
    }
}
