//! Real TCP networking on tokio.

use std::io;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use super::{NetworkProvider, TcpListenerTrait};

/// Sockets of the operating system. Nagle is disabled on every stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioNetworkProvider;

impl TokioNetworkProvider {
    /// Create the provider.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NetworkProvider for TokioNetworkProvider {
    type TcpStream = TcpStream;
    type TcpListener = TokioTcpListener;

    async fn bind(&self, addr: &str) -> io::Result<TokioTcpListener> {
        TcpListener::bind(addr).await.map(TokioTcpListener)
    }

    async fn connect(&self, addr: &str) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Listening socket bound by [`TokioNetworkProvider`].
#[derive(Debug)]
pub struct TokioTcpListener(TcpListener);

#[async_trait]
impl TcpListenerTrait for TokioTcpListener {
    type TcpStream = TcpStream;

    async fn accept(&self) -> io::Result<(TcpStream, String)> {
        let (stream, peer) = self.0.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, peer.to_string()))
    }

    fn local_addr(&self) -> io::Result<String> {
        self.0.local_addr().map(|addr| addr.to_string())
    }
}
