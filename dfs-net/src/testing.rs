//! Shared test utilities for dfs integration tests.
//!
//! Available behind the `test-util` feature or in `#[cfg(test)]` within dfs-net.
//! Provides timing instrumentation, loopback transport setup, and common
//! wait helpers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::connection::PeerConnection;
use crate::peers::PeerRegistry;
use crate::tcp::{TcpTransport, TcpTransportOpts};
use crate::transport::{OnPeerFn, Rpc, Transport};

/// Default timeout for a dialed peer to show up on both ends.
pub const CONNECTION_TIMEOUT_SECS: u64 = 5;

/// Default timeout for a control message to be delivered.
pub const RPC_TIMEOUT_SECS: u64 = 5;

/// Default timeout for a dropped peer to be reported.
pub const PEER_LEFT_TIMEOUT_SECS: u64 = 5;

const POLL_INTERVAL_MS: u64 = 20;

/// Initialise a tracing subscriber for tests.
///
/// Respects the `RUST_LOG` environment variable, defaults to `debug`.
/// Uses `with_test_writer()` to integrate with `cargo test` output capture.
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Stages a replication test moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Transports bound and listening.
    Setup,
    /// Peers registered on both ends.
    Connect,
    /// Objects landed on the receiving peers.
    Replicate,
    /// Objects read back over the network.
    Fetch,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Setup => "setup",
            Phase::Connect => "connect",
            Phase::Replicate => "replicate",
            Phase::Fetch => "fetch",
        }
    }
}

/// Wall-clock timing of the [`Phase`]s of one test.
///
/// Logs each phase as it ends and the slowest one on drop, under the
/// `dfs_test::timer` target.
///
/// # Example
///
/// ```ignore
/// let mut timer = TestTimer::new("store_reaches_every_peer");
/// let (a, b) = (setup_node().await, setup_node().await);
/// timer.phase(Phase::Setup);
/// a.transport.dial(&b.addr()).await?;
/// wait_for_peers(&b.peers, 1, CONNECTION_TIMEOUT_SECS).await;
/// timer.phase(Phase::Connect);
/// ```
pub struct TestTimer {
    test_name: String,
    start: Instant,
    last: Instant,
    phases: Vec<(Phase, Duration)>,
}

impl TestTimer {
    pub fn new(test_name: &str) -> Self {
        let now = Instant::now();
        Self {
            test_name: test_name.to_string(),
            start: now,
            last: now,
            phases: Vec::new(),
        }
    }

    /// Mark the end of `phase`.
    pub fn phase(&mut self, phase: Phase) {
        let now = Instant::now();
        let took = now - self.last;
        tracing::debug!(
            target: "dfs_test::timer",
            test = %self.test_name,
            phase = phase.as_str(),
            took_ms = took.as_millis() as u64,
        );
        self.phases.push((phase, took));
        self.last = now;
    }

    /// The longest phase recorded so far.
    pub fn slowest(&self) -> Option<(Phase, Duration)> {
        self.phases.iter().copied().max_by_key(|(_, took)| *took)
    }
}

impl Drop for TestTimer {
    fn drop(&mut self) {
        let slowest = self.slowest();
        tracing::info!(
            target: "dfs_test::timer",
            test = %self.test_name,
            total_ms = self.start.elapsed().as_millis() as u64,
            slowest = slowest.map(|(phase, _)| phase.as_str()).unwrap_or("none"),
            slowest_ms = slowest.map(|(_, took)| took.as_millis() as u64).unwrap_or(0),
            "test timing"
        );
    }
}

/// A listening loopback transport whose peers land in `peers`.
pub struct TestNode {
    pub transport: TcpTransport,
    pub peers: Arc<PeerRegistry>,
    pub rpc_rx: mpsc::Receiver<Rpc>,
    pub closed_rx: mpsc::UnboundedReceiver<String>,
}

impl TestNode {
    pub fn addr(&self) -> String {
        self.transport.addr()
    }
}

/// `on_peer` callback that records every peer in `peers`.
pub fn register_peer(peers: Arc<PeerRegistry>) -> OnPeerFn {
    Arc::new(move |peer: Arc<PeerConnection>| -> anyhow::Result<()> {
        peers.set(peer.key(), peer);
        Ok(())
    })
}

/// Start a transport on `127.0.0.1:0` with the given options.
pub async fn setup_node_with(opts: TcpTransportOpts) -> TestNode {
    let transport = TcpTransport::new(TcpTransportOpts {
        listen_addr: "127.0.0.1:0".to_string(),
        ..opts
    });
    let peers = Arc::new(PeerRegistry::new());
    transport.set_on_peer(register_peer(peers.clone()));
    transport
        .listen_and_accept()
        .await
        .expect("test transport failed to listen");

    let rpc_rx = transport
        .take_rpc_receiver()
        .expect("rpc receiver already taken");
    let closed_rx = transport
        .take_closed_peer_receiver()
        .expect("closed receiver already taken");

    TestNode {
        transport,
        peers,
        rpc_rx,
        closed_rx,
    }
}

/// Start a transport on `127.0.0.1:0` that accepts every peer.
pub async fn setup_node() -> TestNode {
    setup_node_with(TcpTransportOpts::default()).await
}

/// Wait for `peers` to hold at least `expected_count` connections.
///
/// Panics if the timeout is reached.
pub async fn wait_for_peers(peers: &PeerRegistry, expected_count: usize, timeout_secs: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
    while peers.len() < expected_count {
        if tokio::time::Instant::now() > deadline {
            panic!(
                "timed out waiting for {} peers, got {} (after {}s)",
                expected_count,
                peers.len(),
                timeout_secs,
            );
        }
        tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
    }
}

/// Receive the next RPC. Panics on timeout or a closed queue.
pub async fn recv_rpc(rx: &mut mpsc::Receiver<Rpc>, timeout_secs: u64) -> Rpc {
    tokio::time::timeout(Duration::from_secs(timeout_secs), rx.recv())
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for rpc (after {timeout_secs}s)"))
        .expect("rpc queue closed")
}

/// Receive the next closed-peer notification. Panics on timeout.
pub async fn recv_closed(rx: &mut mpsc::UnboundedReceiver<String>, timeout_secs: u64) -> String {
    tokio::time::timeout(Duration::from_secs(timeout_secs), rx.recv())
        .await
        .unwrap_or_else(|_| {
            panic!("timed out waiting for a closed peer (after {timeout_secs}s)")
        })
        .expect("closed-peer queue closed")
}
