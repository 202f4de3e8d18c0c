//! Store and fetch between real file servers.

use std::sync::Arc;

use dfs_node::MemoryRegistry;
use dfs_store::crypto::{hash_key, IV_LEN};
use tokio::io::AsyncReadExt;

use crate::helpers::{
    init_test_tracing, start_server, wait_for_object, wait_until, Phase, TestTimer,
    CONNECTION_TIMEOUT_SECS,
};

#[tokio::test]
async fn store_replicates_ciphertext_and_get_fetches_it_back() {
    init_test_tracing();
    let mut timer = TestTimer::new("store_replicates_ciphertext_and_get_fetches_it_back");

    let registry = Arc::new(MemoryRegistry::new());
    let a = start_server("node-a", registry.clone()).await;
    let b = start_server("node-b", registry.clone()).await;
    wait_until("peers on both ends", CONNECTION_TIMEOUT_SECS, || {
        a.server.peer_count() == 1 && b.server.peer_count() == 1
    })
    .await;
    timer.phase(Phase::Connect);

    let key = "pictures/holiday.png";
    let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let n = b.server.store(key, &mut &data[..]).await.unwrap();
    assert_eq!(n, data.len() as u64);

    let replica = a.server.storage().object_path("node-b", &hash_key(key)).unwrap();
    wait_for_object(&replica, data.len() as u64 + IV_LEN as u64, 5).await;
    timer.phase(Phase::Replicate);

    let stored = tokio::fs::read(&replica).await.unwrap();
    assert_ne!(&stored[IV_LEN..], &data[..], "replicas hold ciphertext only");
    assert!(!a.server.storage().has("node-b", key).await.unwrap());

    b.server.delete_local(key).await.unwrap();
    assert!(!b.server.storage().has("node-b", key).await.unwrap());

    let (size, mut file) = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        b.server.get(key),
    )
    .await
    .expect("fetch should complete")
    .unwrap();
    let mut fetched = Vec::new();
    file.read_to_end(&mut fetched).await.unwrap();
    assert_eq!(size, data.len() as u64);
    assert_eq!(fetched, data);
    timer.phase(Phase::Fetch);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn get_prefers_local_copy() {
    init_test_tracing();
    let registry = Arc::new(MemoryRegistry::new());
    let a = start_server("solo", registry).await;

    a.server.store("notes.txt", &mut &b"hello"[..]).await.unwrap();
    let (size, mut file) = a.server.get("notes.txt").await.unwrap();

    let mut content = String::new();
    file.read_to_string(&mut content).await.unwrap();
    assert_eq!(size, 5);
    assert_eq!(content, "hello");

    a.shutdown().await;
}

#[tokio::test]
async fn store_reaches_every_peer() {
    init_test_tracing();
    let registry = Arc::new(MemoryRegistry::new());
    let a = start_server("node-a", registry.clone()).await;
    let b = start_server("node-b", registry.clone()).await;
    let c = start_server("node-c", registry.clone()).await;
    wait_until("full mesh", CONNECTION_TIMEOUT_SECS, || {
        a.server.peer_count() == 2 && b.server.peer_count() == 2 && c.server.peer_count() == 2
    })
    .await;

    let data = vec![0x5au8; 4096];
    c.server.store("blob", &mut &data[..]).await.unwrap();

    for replica_holder in [&a, &b] {
        let path = replica_holder
            .server
            .storage()
            .object_path("node-c", &hash_key("blob"))
            .unwrap();
        wait_for_object(&path, data.len() as u64 + IV_LEN as u64, 5).await;
    }

    // Back-to-back stores on one connection stay in sync.
    c.server.store("blob-2", &mut &data[..128]).await.unwrap();
    let path = a.server.storage().object_path("node-c", &hash_key("blob-2")).unwrap();
    wait_for_object(&path, 128 + IV_LEN as u64, 5).await;

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

#[tokio::test]
async fn clear_removes_local_objects() {
    init_test_tracing();
    let registry = Arc::new(MemoryRegistry::new());
    let a = start_server("node-a", registry).await;

    a.server.store("one", &mut &b"1"[..]).await.unwrap();
    a.server.store("two", &mut &b"2"[..]).await.unwrap();
    a.server.clear().await.unwrap();

    assert!(!a.server.storage().has("node-a", "one").await.unwrap());
    assert!(!a.server.storage().has("node-a", "two").await.unwrap());

    a.shutdown().await;
}
