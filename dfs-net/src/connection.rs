//! Peer connections over TCP.

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};

use crate::gate::StreamGate;

/// What the rest of the system may do with a remote node.
#[allow(async_fn_in_trait)]
pub trait Peer: Send + Sync {
    /// Address of the remote end, used as the peer's key everywhere.
    fn remote_addr(&self) -> SocketAddr;

    /// `true` if we dialed the peer, `false` if we accepted it.
    fn is_outbound(&self) -> bool;

    /// Write `data` to the peer as-is. Callers supply the tag byte.
    async fn send_data(&self, data: &[u8]) -> Result<()>;

    /// Release the peer's read loop after a raw stream has been consumed.
    fn close_stream(&self);
}

/// One live TCP connection to a remote node.
///
/// The socket is split so that writes never wait on the read loop. The read
/// half is shared between the connection's read loop and at most one stream
/// consumer at a time; the [`StreamGate`] decides who owns it.
pub struct PeerConnection {
    remote_addr: SocketAddr,
    outbound: bool,
    pub(crate) reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    pub(crate) gate: StreamGate,
}

impl PeerConnection {
    /// Wrap an established stream.
    pub fn new(stream: TcpStream, outbound: bool) -> Result<Self> {
        let remote_addr = stream
            .peer_addr()
            .context("connection has no peer address")?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            remote_addr,
            outbound,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            gate: StreamGate::new(),
        })
    }

    /// Registry key for this peer.
    pub fn key(&self) -> String {
        self.remote_addr.to_string()
    }

    /// The connection's stream gate.
    pub fn gate(&self) -> &StreamGate {
        &self.gate
    }

    /// Exclusive access to the write half.
    ///
    /// Hold the guard across a tag byte and the bytes it announces so no other
    /// frame can be interleaved.
    pub async fn writer(&self) -> MutexGuard<'_, OwnedWriteHalf> {
        self.writer.lock().await
    }

    /// Wait for the read loop to hand over a raw stream and take the read half.
    ///
    /// The returned guard reads directly from the socket. Dropping it lowers
    /// the gate and lets the read loop continue; the caller must have read
    /// exactly the announced number of bytes by then.
    pub async fn begin_stream(&self) -> StreamGuard<'_> {
        loop {
            self.gate.wait_raised().await;
            let reader = self.reader.lock().await;
            // Another consumer may have taken and released the stream while we
            // waited for the lock.
            if self.gate.is_raised() {
                tracing::debug!(peer = %self.remote_addr, "stream consumer attached");
                return StreamGuard {
                    reader,
                    gate: &self.gate,
                };
            }
        }
    }

    /// Half-close the connection; the remote read loop sees EOF.
    pub async fn shutdown(&self) {
        if let Err(e) = self.writer.lock().await.shutdown().await {
            tracing::debug!(peer = %self.remote_addr, error = %e, "shutdown failed");
        }
    }
}

impl Peer for PeerConnection {
    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn is_outbound(&self) -> bool {
        self.outbound
    }

    async fn send_data(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(data)
            .await
            .with_context(|| format!("failed to send to {}", self.remote_addr))?;
        Ok(())
    }

    fn close_stream(&self) {
        self.gate.lower();
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("remote_addr", &self.remote_addr)
            .field("outbound", &self.outbound)
            .field("streaming", &self.gate.is_raised())
            .finish()
    }
}

/// Read access to a peer's socket for the duration of one raw stream.
pub struct StreamGuard<'a> {
    reader: MutexGuard<'a, OwnedReadHalf>,
    gate: &'a StreamGate,
}

impl AsyncRead for StreamGuard<'_> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut *this.reader).poll_read(cx, buf)
    }
}

impl Drop for StreamGuard<'_> {
    fn drop(&mut self) {
        self.gate.lower();
    }
}
