//! Abstract transport for peer-to-peer file replication.
//!
//! Defines the [`Transport`] trait implemented by
//! [`TcpTransport`](crate::TcpTransport), the decoded [`Rpc`] it delivers,
//! and the hooks it runs for every new connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::connection::PeerConnection;

/// One decoded frame from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rpc {
    /// Registry key (remote address) of the sending peer.
    pub from: String,
    /// Encoded control message; `None` for a stream announcement.
    pub payload: Option<Bytes>,
    /// Set when the frame announced a raw stream.
    pub stream: bool,
}

impl Rpc {
    pub fn message(from: impl Into<String>, payload: Bytes) -> Self {
        Self {
            from: from.into(),
            payload: Some(payload),
            stream: false,
        }
    }

    pub fn stream(from: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            payload: None,
            stream: true,
        }
    }
}

/// Check run on every new connection before its read loop starts.
/// An error rejects the peer and tears the connection down.
pub type HandshakeFn = Arc<dyn Fn(&PeerConnection) -> Result<()> + Send + Sync>;

/// Callback run with every peer that passed the handshake.
/// An error tears the connection down.
pub type OnPeerFn = Arc<dyn Fn(Arc<PeerConnection>) -> Result<()> + Send + Sync>;

/// Handshake that accepts every peer.
pub fn no_handshake() -> HandshakeFn {
    Arc::new(|_: &PeerConnection| -> Result<()> { Ok(()) })
}

/// Metrics tracked by a transport implementation.
#[derive(Debug)]
pub struct TransportMetrics {
    pub messages_received: AtomicU64,
    pub streams_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub peers_connected: AtomicU64,
    pub peers_dropped: AtomicU64,
}

impl TransportMetrics {
    /// Create new zeroed metrics.
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            streams_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            peers_connected: AtomicU64::new(0),
            peers_dropped: AtomicU64::new(0),
        }
    }

    /// Record a decoded control message of `bytes` body length.
    pub fn record_message_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record a stream hand-off.
    pub fn record_stream_received(&self) {
        self.streams_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a peer entering its read loop.
    pub fn record_peer_connected(&self) {
        self.peers_connected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection teardown.
    pub fn record_peer_dropped(&self) {
        self.peers_dropped.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for TransportMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection management and frame delivery for a file server.
#[allow(async_fn_in_trait)]
pub trait Transport: Send + Sync {
    /// Address the transport is accepting connections on.
    fn addr(&self) -> String;

    /// Bind the listener and start accepting connections in the background.
    async fn listen_and_accept(&self) -> Result<()>;

    /// Connect to `addr` and serve the connection in the background.
    async fn dial(&self, addr: &str) -> Result<()>;

    /// Install the callback run for every accepted or dialed peer.
    fn set_on_peer(&self, on_peer: OnPeerFn);

    /// Take the queue of decoded control messages. `None` once taken.
    fn take_rpc_receiver(&self) -> Option<mpsc::Receiver<Rpc>>;

    /// Take the queue of closed peer addresses. `None` once taken.
    fn take_closed_peer_receiver(&self) -> Option<mpsc::UnboundedReceiver<String>>;

    /// Stop accepting new connections.
    fn close(&self);

    /// Get transport metrics.
    fn transport_metrics(&self) -> &TransportMetrics;
}
