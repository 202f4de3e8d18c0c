//! Startup registration and bootstrap dialing.

use std::sync::Arc;

use dfs_net::{TcpTransport, TcpTransportOpts, Transport};
use dfs_node::{FileServer, FileServerOpts, MemoryRegistry, Registry};
use dfs_protocol::Node;
use dfs_store::{PathTransform, Storage};
use tempfile::TempDir;

use crate::helpers::{
    init_test_tracing, setup_node, start_server, wait_until, CONNECTION_TIMEOUT_SECS,
};

async fn dead_address() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    addr
}

#[tokio::test]
async fn bootstrap_dials_every_other_node_and_drops_dead_ones() {
    init_test_tracing();
    let peer_a = setup_node().await;
    let peer_c = setup_node().await;
    let dead = dead_address().await;

    let registry = Arc::new(MemoryRegistry::with_nodes([
        Node::with_address(peer_a.addr()),
        Node::with_address(peer_c.addr()),
        Node::with_address(dead.clone()),
    ]));

    let root = TempDir::new().unwrap();
    let server = FileServer::new(FileServerOpts {
        id: "node-d".to_string(),
        enc_key: vec![0u8; 32],
        storage: Storage::new(root.path(), PathTransform::Cas),
        transport: TcpTransport::new(TcpTransportOpts::default()),
        registry: registry.clone(),
    })
    .unwrap();

    let dialed = server.start().await.unwrap();
    assert_eq!(dialed, 2);

    wait_until("both live nodes dialed", CONNECTION_TIMEOUT_SECS, || {
        peer_a.peers.len() == 1 && peer_c.peers.len() == 1 && server.peer_count() == 2
    })
    .await;

    let addrs: Vec<String> = registry
        .list_nodes()
        .await
        .unwrap()
        .into_iter()
        .map(|n| n.address)
        .collect();
    assert!(addrs.contains(&server.addr()), "node registers itself");
    assert!(addrs.contains(&peer_a.addr()));
    assert!(addrs.contains(&peer_c.addr()));
    assert!(!addrs.contains(&dead), "failed dial deregisters the node");
}

#[tokio::test]
async fn self_registration_carries_metadata() {
    init_test_tracing();
    let registry = Arc::new(MemoryRegistry::new());
    let a = start_server("node-a", registry.clone()).await;

    let nodes = registry.list_nodes().await.unwrap();
    assert_eq!(nodes.len(), 1);
    let me = &nodes[0];
    assert_eq!(me.address, a.addr());
    assert_eq!(me.server_id, "node-a");
    assert_eq!(me.ip, "127.0.0.1");
    assert_ne!(me.port, 0);
    assert!(me.created_at > 0);
    assert!(!me.hostname.is_empty(), "hostname comes from the OS");

    a.shutdown().await;
}

#[tokio::test]
async fn bind_failure_is_fatal() {
    init_test_tracing();
    let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = taken.local_addr().unwrap().to_string();

    let root = TempDir::new().unwrap();
    let server = FileServer::new(FileServerOpts {
        id: "node-x".to_string(),
        enc_key: vec![0u8; 32],
        storage: Storage::new(root.path(), PathTransform::Cas),
        transport: TcpTransport::new(TcpTransportOpts {
            listen_addr: addr,
            ..Default::default()
        }),
        registry: Arc::new(MemoryRegistry::new()),
    })
    .unwrap();

    assert!(server.start().await.is_err());
}

#[tokio::test]
async fn server_needs_fresh_transport_queues() {
    let transport = TcpTransport::new(TcpTransportOpts::default());
    let _ = transport.take_rpc_receiver();

    let root = TempDir::new().unwrap();
    let result = FileServer::new(FileServerOpts {
        id: "node-y".to_string(),
        enc_key: vec![0u8; 32],
        storage: Storage::new(root.path(), PathTransform::Cas),
        transport,
        registry: Arc::new(MemoryRegistry::new()),
    });
    assert!(result.is_err());
}
