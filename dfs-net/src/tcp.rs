//! TCP implementation of [`Transport`].
//!
//! Every accepted or dialed connection gets its own task running
//! [`serve_peer`]: handshake, `on_peer` callback, then the read loop. The read
//! loop only ever consumes tag bytes and control frames; raw streams are left
//! on the socket for whoever calls [`PeerConnection::begin_stream`].

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use bytes::Bytes;
use dfs_protocol::wire::{check_message_len, Tag};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use crate::connection::{Peer, PeerConnection};
use crate::transport::{no_handshake, HandshakeFn, OnPeerFn, Rpc, Transport, TransportMetrics};

/// Capacity of the decoded RPC queue.
pub const RPC_QUEUE_CAPACITY: usize = 1024;

/// Construction options for [`TcpTransport`].
#[derive(Clone)]
pub struct TcpTransportOpts {
    /// Address to bind, e.g. `127.0.0.1:3000`. Port `0` picks a free port.
    pub listen_addr: String,
    pub handshake: HandshakeFn,
}

impl Default for TcpTransportOpts {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".to_string(),
            handshake: no_handshake(),
        }
    }
}

impl std::fmt::Debug for TcpTransportOpts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransportOpts")
            .field("listen_addr", &self.listen_addr)
            .finish_non_exhaustive()
    }
}

/// State shared with every connection task.
struct Shared {
    handshake: HandshakeFn,
    on_peer: Mutex<Option<OnPeerFn>>,
    rpc_tx: mpsc::Sender<Rpc>,
    closed_tx: mpsc::UnboundedSender<String>,
    metrics: TransportMetrics,
}

/// Transport speaking the tagged wire protocol over plain TCP.
pub struct TcpTransport {
    listen_addr: String,
    shared: Arc<Shared>,
    local_addr: Mutex<Option<SocketAddr>>,
    rpc_rx: Mutex<Option<mpsc::Receiver<Rpc>>>,
    closed_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    shutdown: watch::Sender<bool>,
}

impl TcpTransport {
    pub fn new(opts: TcpTransportOpts) -> Self {
        let (rpc_tx, rpc_rx) = mpsc::channel(RPC_QUEUE_CAPACITY);
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        Self {
            listen_addr: opts.listen_addr,
            shared: Arc::new(Shared {
                handshake: opts.handshake,
                on_peer: Mutex::new(None),
                rpc_tx,
                closed_tx,
                metrics: TransportMetrics::new(),
            }),
            local_addr: Mutex::new(None),
            rpc_rx: Mutex::new(Some(rpc_rx)),
            closed_rx: Mutex::new(Some(closed_rx)),
            shutdown,
        }
    }

    /// Bound socket address, once [`Transport::listen_and_accept`] succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("listen_addr", &self.listen_addr)
            .field("local_addr", &self.local_addr())
            .finish_non_exhaustive()
    }
}

impl Transport for TcpTransport {
    fn addr(&self) -> String {
        match self.local_addr() {
            Some(addr) => addr.to_string(),
            None => self.listen_addr.clone(),
        }
    }

    async fn listen_and_accept(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.listen_addr)
            .await
            .with_context(|| format!("failed to listen on {}", self.listen_addr))?;
        let local = listener
            .local_addr()
            .context("listener has no local address")?;
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(local);

        tracing::info!(addr = %local, "tcp transport listening");
        tokio::spawn(accept_loop(
            listener,
            self.shared.clone(),
            self.shutdown.subscribe(),
        ));
        Ok(())
    }

    async fn dial(&self, addr: &str) -> Result<()> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to dial {addr}"))?;
        tracing::debug!(peer = %addr, "dialed peer");
        tokio::spawn(handle_conn(self.shared.clone(), stream, true));
        Ok(())
    }

    fn set_on_peer(&self, on_peer: OnPeerFn) {
        *self
            .shared
            .on_peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(on_peer);
    }

    fn take_rpc_receiver(&self) -> Option<mpsc::Receiver<Rpc>> {
        self.rpc_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn take_closed_peer_receiver(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.closed_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn close(&self) {
        self.shutdown.send_replace(true);
    }

    fn transport_metrics(&self) -> &TransportMetrics {
        &self.shared.metrics
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tracing::debug!(peer = %addr, "accepted connection");
                    tokio::spawn(handle_conn(shared.clone(), stream, false));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                }
            },
            _ = shutdown.wait_for(|closed| *closed) => {
                tracing::info!("tcp transport stopped accepting");
                return;
            }
        }
    }
}

/// Run one connection to completion, then tear it down exactly once.
async fn handle_conn(shared: Arc<Shared>, stream: TcpStream, outbound: bool) {
    let peer = match PeerConnection::new(stream, outbound) {
        Ok(peer) => Arc::new(peer),
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), "failed to set up connection");
            return;
        }
    };
    let addr = peer.key();

    match serve_peer(&shared, &peer).await {
        Ok(()) => tracing::info!(peer = %addr, "peer disconnected"),
        Err(e) => tracing::info!(
            peer = %addr,
            error = %format!("{e:#}"),
            "dropping peer connection"
        ),
    }

    peer.shutdown().await;
    shared.metrics.record_peer_dropped();
    // The receiver goes away with the transport; nothing left to notify then.
    let _ = shared.closed_tx.send(addr);
}

/// Handshake, `on_peer`, then the read loop. Returns `Ok` on a clean EOF.
async fn serve_peer(shared: &Shared, peer: &Arc<PeerConnection>) -> Result<()> {
    (shared.handshake)(peer.as_ref()).context("handshake rejected")?;

    let on_peer = shared
        .on_peer
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    if let Some(on_peer) = on_peer {
        on_peer(peer.clone()).context("on_peer callback rejected peer")?;
    }

    shared.metrics.record_peer_connected();
    tracing::info!(
        peer = %peer.remote_addr(),
        outbound = peer.is_outbound(),
        "peer connected"
    );

    let from = peer.key();
    loop {
        let rpc = {
            let mut reader = peer.reader.lock().await;
            read_rpc(&mut *reader, &from).await?
        };
        let Some(rpc) = rpc else {
            return Ok(());
        };

        if rpc.stream {
            shared.metrics.record_stream_received();
            peer.gate.raise();
            tracing::debug!(peer = %from, "incoming stream, waiting");
            peer.gate.wait_lowered().await;
            tracing::debug!(peer = %from, "stream closed, resuming read loop");
            continue;
        }

        let len = rpc.payload.as_ref().map_or(0, Bytes::len);
        shared.metrics.record_message_received(len);
        if shared.rpc_tx.send(rpc).await.is_err() {
            tracing::debug!(peer = %from, "rpc receiver gone, stopping read loop");
            return Ok(());
        }
    }
}

/// Read one frame header (and the body of a control frame).
///
/// Returns `None` on EOF at a frame boundary.
async fn read_rpc<R>(reader: &mut R, from: &str) -> Result<Option<Rpc>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let tag = match reader.read_u8().await {
        Ok(tag) => tag,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("failed to read frame tag"),
    };

    match Tag::from_byte(tag)? {
        Tag::Stream => Ok(Some(Rpc::stream(from))),
        Tag::Message => {
            let len = reader
                .read_u32()
                .await
                .context("failed to read control frame length")?;
            let len = check_message_len(len)?;
            let mut body = vec![0u8; len];
            reader
                .read_exact(&mut body)
                .await
                .context("failed to read control frame body")?;
            Ok(Some(Rpc::message(from, Bytes::from(body))))
        }
    }
}
