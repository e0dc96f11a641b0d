//! In-process networking over duplex pipes.
//!
//! Every clone of a [`MemoryNetworkProvider`] shares one address table, so
//! several nodes started from the same provider can reach each other by
//! `host:port` exactly as they would over TCP.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use super::{port_of, NetworkProvider, TcpListenerTrait};

/// Buffer size of each direction of a pipe.
const PIPE_CAPACITY: usize = 256 * 1024;

/// First port handed out for binds on port `0`.
const FIRST_EPHEMERAL_PORT: u16 = 40000;

type Incoming = (DuplexStream, String);

#[derive(Debug)]
struct Registration {
    generation: u64,
    incoming: mpsc::UnboundedSender<Incoming>,
}

#[derive(Debug)]
struct AddressTable {
    listeners: HashMap<String, Registration>,
    next_ephemeral: u16,
    next_generation: u64,
    next_client: u64,
}

impl AddressTable {
    fn ephemeral_port(&mut self, host: &str) -> io::Result<u16> {
        for _ in 0..u16::MAX {
            let port = self.next_ephemeral;
            self.next_ephemeral = match self.next_ephemeral.checked_add(1) {
                Some(next) => next,
                None => FIRST_EPHEMERAL_PORT,
            };
            if !self.listeners.contains_key(&format!("{host}:{port}")) {
                return Ok(port);
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "no ephemeral port left",
        ))
    }
}

/// In-memory network shared by all its clones.
#[derive(Debug, Clone)]
pub struct MemoryNetworkProvider {
    table: Arc<Mutex<AddressTable>>,
}

impl MemoryNetworkProvider {
    /// Create an empty network.
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(AddressTable {
                listeners: HashMap::new(),
                next_ephemeral: FIRST_EPHEMERAL_PORT,
                next_generation: 0,
                next_client: 0,
            })),
        }
    }

    /// Addresses with a live listener.
    pub fn bound_addresses(&self) -> Vec<String> {
        let table = lock(&self.table);
        let mut addrs: Vec<String> = table.listeners.keys().cloned().collect();
        addrs.sort();
        addrs
    }
}

impl Default for MemoryNetworkProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(table: &Mutex<AddressTable>) -> std::sync::MutexGuard<'_, AddressTable> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl NetworkProvider for MemoryNetworkProvider {
    type TcpStream = DuplexStream;
    type TcpListener = MemoryListener;

    async fn bind(&self, addr: &str) -> io::Result<Self::TcpListener> {
        let (host, port) = match (addr.rsplit_once(':'), port_of(addr)) {
            (Some((host, _)), Some(port)) => (host.to_string(), port),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid address {addr}"),
                ))
            }
        };

        let mut table = lock(&self.table);
        let port = if port == 0 {
            table.ephemeral_port(&host)?
        } else {
            port
        };
        let local = format!("{host}:{port}");
        if table.listeners.contains_key(&local) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{local} already bound"),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        table.next_generation += 1;
        let generation = table.next_generation;
        table.listeners.insert(
            local.clone(),
            Registration {
                generation,
                incoming: tx,
            },
        );

        Ok(MemoryListener {
            local,
            generation,
            incoming: tokio::sync::Mutex::new(rx),
            table: Arc::clone(&self.table),
        })
    }

    async fn connect(&self, addr: &str) -> io::Result<Self::TcpStream> {
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        let mut table = lock(&self.table);
        table.next_client += 1;
        let peer = format!("memory-client:{}", table.next_client);
        let registration = table.listeners.get(addr).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("nothing listening on {addr}"),
            )
        })?;
        registration.incoming.send((server, peer)).map_err(|_| {
            io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("listener on {addr} is gone"),
            )
        })?;
        Ok(client)
    }
}

/// Listener half of the in-memory network.
///
/// Dropping it frees the address.
#[derive(Debug)]
pub struct MemoryListener {
    local: String,
    generation: u64,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Incoming>>,
    table: Arc<Mutex<AddressTable>>,
}

#[async_trait]
impl TcpListenerTrait for MemoryListener {
    type TcpStream = DuplexStream;

    async fn accept(&self) -> io::Result<(Self::TcpStream, String)> {
        let mut incoming = self.incoming.lock().await;
        incoming.recv().await.ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "listener closed")
        })
    }

    fn local_addr(&self) -> io::Result<String> {
        Ok(self.local.clone())
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        let mut table = lock(&self.table);
        let ours = table
            .listeners
            .get(&self.local)
            .is_some_and(|r| r.generation == self.generation);
        if ours {
            table.listeners.remove(&self.local);
        }
    }
}
