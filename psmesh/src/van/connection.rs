//! Per-peer stream tasks.
//!
//! A node writes to a peer over the stream it opened and reads from the
//! streams peers opened to it. Outbound streams get one writer task each;
//! the accept loop spawns one reader per inbound stream and funnels every
//! decoded message into the receive loop's queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use super::metrics::VanMetrics;
use crate::error::{VanError, VanResult};
use crate::message::{Message, Node};
use crate::network::{NetworkProvider, TcpListenerTrait};
use crate::wire;

/// Pause after a failed accept.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Outbound connection to one peer.
#[derive(Debug)]
pub(crate) struct Connection {
    node: Node,
    outbox: mpsc::UnboundedSender<Vec<u8>>,
    writer: JoinHandle<()>,
}

impl Connection {
    /// Connect to `node` and spawn its writer.
    pub(crate) async fn open<N: NetworkProvider>(
        network: &N,
        node: Node,
        metrics: Arc<VanMetrics>,
    ) -> VanResult<Self> {
        let addr = node.address();
        let stream = network
            .connect(&addr)
            .await
            .map_err(|source| VanError::Connect { addr, source })?;
        let (outbox, frames) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(stream, frames, node.id, metrics));
        Ok(Self {
            node,
            outbox,
            writer,
        })
    }

    pub(crate) fn node(&self) -> &Node {
        &self.node
    }

    /// The writer stopped, usually because the peer went away.
    pub(crate) fn is_closed(&self) -> bool {
        self.outbox.is_closed()
    }

    /// Queue a frame. Delivery is not confirmed.
    pub(crate) fn send(&self, frame: Vec<u8>) -> VanResult<()> {
        self.outbox
            .send(frame)
            .map_err(|_| VanError::ConnectionClosed { id: self.node.id })
    }

    /// Stop the writer without flushing.
    pub(crate) fn abort(self) {
        self.writer.abort();
    }

    /// Flush the queued frames and close the stream, aborting after `grace`.
    pub(crate) async fn close(self, grace: Duration) {
        let Self {
            node,
            outbox,
            mut writer,
        } = self;
        drop(outbox);
        if tokio::time::timeout(grace, &mut writer).await.is_err() {
            debug!(node = %node, "writer did not flush in time");
            writer.abort();
        }
    }
}

async fn write_loop<S>(
    mut stream: S,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    id: i32,
    metrics: Arc<VanMetrics>,
) where
    S: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        if let Err(e) = stream.write_all(&frame).await {
            warn!(id, error = %e, "write failed, closing connection");
            metrics.record_send_failure();
            return;
        }
    }
    let _ = stream.shutdown().await;
}

/// Accept peers until the task is aborted.
///
/// Dropping the task drops the listener and every reader it spawned.
pub(crate) async fn accept_loop<L>(
    listener: L,
    inbound: mpsc::UnboundedSender<Message>,
    metrics: Arc<VanMetrics>,
) where
    L: TcpListenerTrait + Send + Sync + 'static,
{
    let mut readers = JoinSet::new();
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "accepted connection");
                readers.spawn(read_loop(stream, peer, inbound.clone(), Arc::clone(&metrics)));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
        while readers.try_join_next().is_some() {}
    }
}

async fn read_loop<S>(
    stream: S,
    peer: String,
    inbound: mpsc::UnboundedSender<Message>,
    metrics: Arc<VanMetrics>,
) where
    S: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    loop {
        match wire::read_frame(&mut reader).await {
            Ok(Some((msg, bytes))) => {
                metrics.record_recv(bytes);
                if inbound.send(msg).is_err() {
                    return;
                }
            }
            Ok(None) => {
                debug!(peer = %peer, "peer closed connection");
                return;
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "dropping connection after read error");
                return;
            }
        }
    }
}
