//! Network provider abstraction.
//!
//! The van only needs to bind a listener and open byte streams; which
//! implementation supplies them is a deployment choice. [`TokioNetworkProvider`]
//! speaks real TCP, [`MemoryNetworkProvider`] wires nodes of the same process
//! together through in-memory pipes.

mod memory;
mod tcp;

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub use memory::{MemoryListener, MemoryNetworkProvider};
pub use tcp::{TokioNetworkProvider, TokioTcpListener};

/// Provider trait for creating network connections and listeners.
///
/// Clone allows every connection task of a van to hold its own handle.
#[async_trait]
pub trait NetworkProvider: Clone + Send + Sync + 'static {
    /// The stream type for this provider.
    type TcpStream: AsyncRead + AsyncWrite + Unpin + Send + 'static;
    /// The listener type for this provider.
    type TcpListener: TcpListenerTrait<TcpStream = Self::TcpStream> + Send + Sync + 'static;

    /// Create a listener bound to the given `host:port` address.
    ///
    /// Port `0` requests an ephemeral port; read it back through
    /// [`TcpListenerTrait::local_addr`].
    async fn bind(&self, addr: &str) -> io::Result<Self::TcpListener>;

    /// Connect to a remote address.
    async fn connect(&self, addr: &str) -> io::Result<Self::TcpStream>;
}

/// Trait for listeners that can accept connections.
#[async_trait]
pub trait TcpListenerTrait {
    /// The stream type that this listener produces.
    type TcpStream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Accept a single incoming connection.
    async fn accept(&self) -> io::Result<(Self::TcpStream, String)>;

    /// Get the local address this listener is bound to.
    fn local_addr(&self) -> io::Result<String>;
}

/// Port component of a `host:port` string.
pub(crate) fn port_of(addr: &str) -> Option<u16> {
    addr.rsplit_once(':').and_then(|(_, port)| port.parse().ok())
}
