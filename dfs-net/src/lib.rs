//! TCP transport, peer connections, and the stream hand-off between them.

pub mod connection;
pub mod gate;
pub mod peers;
pub mod tcp;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use connection::{Peer, PeerConnection, StreamGuard};
pub use gate::StreamGate;
pub use peers::{LockedMap, PeerRegistry};
pub use tcp::{TcpTransport, TcpTransportOpts};
pub use transport::{no_handshake, HandshakeFn, OnPeerFn, Rpc, Transport, TransportMetrics};
