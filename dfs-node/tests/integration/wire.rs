//! A file server driven by a hand-rolled client speaking the raw wire format.

use std::sync::Arc;
use std::time::Duration;

use dfs_node::MemoryRegistry;
use dfs_protocol::message::decode_message;
use dfs_protocol::wire::{encode_message_frame, INCOMING_MESSAGE, INCOMING_STREAM};
use dfs_protocol::Message;
use dfs_store::crypto::IV_LEN;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::helpers::{
    init_test_tracing, start_server, wait_for_object, wait_until, CONNECTION_TIMEOUT_SECS,
    PEER_LEFT_TIMEOUT_SECS,
};

async fn get_file(client: &mut TcpStream, id: &str, key: &str) {
    let frame = encode_message_frame(&Message::GetFile {
        id: id.to_string(),
        key: key.to_string(),
    })
    .unwrap();
    client.write_all(&frame).await.unwrap();
}

async fn store_file(client: &mut TcpStream, id: &str, key: &str, payload: &[u8]) {
    let frame = encode_message_frame(&Message::StoreFile {
        id: id.to_string(),
        key: key.to_string(),
        size: payload.len() as u64,
    })
    .unwrap();
    client.write_all(&frame).await.unwrap();
    client.write_all(&[INCOMING_STREAM]).await.unwrap();
    client.write_all(payload).await.unwrap();
}

async fn read_reply(client: &mut TcpStream) -> Vec<u8> {
    tokio::time::timeout(Duration::from_secs(5), async {
        assert_eq!(client.read_u8().await.unwrap(), INCOMING_STREAM);
        let size = client.read_u64_le().await.unwrap();
        let mut body = vec![0u8; size as usize];
        client.read_exact(&mut body).await.unwrap();
        body
    })
    .await
    .expect("fetch reply should arrive")
}

#[tokio::test]
async fn fetch_reply_is_tag_size_then_bytes() {
    init_test_tracing();
    let b = start_server("node-b", Arc::new(MemoryRegistry::new())).await;
    b.server
        .storage()
        .write("x", "f", &mut &b"0123456789"[..])
        .await
        .unwrap();

    let mut client = TcpStream::connect(b.addr()).await.unwrap();
    wait_until("client registered", CONNECTION_TIMEOUT_SECS, || {
        b.server.peer_count() == 1
    })
    .await;

    get_file(&mut client, "x", "f").await;

    let mut header = [0u8; 9];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut header))
        .await
        .expect("reply header should arrive")
        .unwrap();
    assert_eq!(header[0], 0x2);
    assert_eq!(u64::from_le_bytes(header[1..].try_into().unwrap()), 10);

    let mut body = [0u8; 10];
    client.read_exact(&mut body).await.unwrap();
    assert_eq!(&body, b"0123456789");

    b.shutdown().await;
}

#[tokio::test]
async fn missing_object_is_not_answered_and_connection_survives() {
    init_test_tracing();
    let b = start_server("node-b", Arc::new(MemoryRegistry::new())).await;
    b.server
        .storage()
        .write("x", "present", &mut &b"here"[..])
        .await
        .unwrap();

    let mut client = TcpStream::connect(b.addr()).await.unwrap();
    wait_until("client registered", CONNECTION_TIMEOUT_SECS, || {
        b.server.peer_count() == 1
    })
    .await;

    get_file(&mut client, "x", "absent").await;
    get_file(&mut client, "x", "present").await;

    assert_eq!(read_reply(&mut client).await, b"here");
    assert_eq!(b.server.peer_count(), 1);

    b.shutdown().await;
}

#[tokio::test]
async fn store_announcement_then_stream_is_written_to_disk() {
    init_test_tracing();
    let b = start_server("node-b", Arc::new(MemoryRegistry::new())).await;

    let mut client = TcpStream::connect(b.addr()).await.unwrap();
    wait_until("client registered", CONNECTION_TIMEOUT_SECS, || {
        b.server.peer_count() == 1
    })
    .await;

    let payload = b"streamed straight off the socket".to_vec();
    store_file(&mut client, "remote", "k", &payload).await;

    let path = b.server.storage().object_path("remote", "k").unwrap();
    wait_for_object(&path, payload.len() as u64, 5).await;
    assert_eq!(tokio::fs::read(&path).await.unwrap(), payload);

    // The read loop is back on control frames once the stream is consumed.
    get_file(&mut client, "remote", "k").await;
    assert_eq!(read_reply(&mut client).await, payload);

    b.shutdown().await;
}

#[tokio::test]
async fn closed_peer_is_evicted() {
    init_test_tracing();
    let b = start_server("node-b", Arc::new(MemoryRegistry::new())).await;

    let client = TcpStream::connect(b.addr()).await.unwrap();
    wait_until("client registered", CONNECTION_TIMEOUT_SECS, || {
        b.server.peer_count() == 1
    })
    .await;

    drop(client);
    wait_until("client evicted", PEER_LEFT_TIMEOUT_SECS, || {
        b.server.peer_count() == 0
    })
    .await;

    b.shutdown().await;
}

#[tokio::test]
async fn garbage_control_body_is_logged_not_fatal() {
    init_test_tracing();
    let b = start_server("node-b", Arc::new(MemoryRegistry::new())).await;
    b.server
        .storage()
        .write("x", "f", &mut &b"ok"[..])
        .await
        .unwrap();

    let mut client = TcpStream::connect(b.addr()).await.unwrap();
    wait_until("client registered", CONNECTION_TIMEOUT_SECS, || {
        b.server.peer_count() == 1
    })
    .await;

    // Well-framed, but variant 9 does not exist.
    client.write_all(&[0x1, 0, 0, 0, 1, 9]).await.unwrap();
    get_file(&mut client, "x", "f").await;
    assert_eq!(read_reply(&mut client).await, b"ok");

    b.shutdown().await;
}

#[tokio::test]
async fn store_outside_storage_root_is_refused() {
    init_test_tracing();
    let b = start_server("node-b", Arc::new(MemoryRegistry::new())).await;
    b.server
        .storage()
        .write("x", "f", &mut &b"still in sync"[..])
        .await
        .unwrap();

    let mut client = TcpStream::connect(b.addr()).await.unwrap();
    wait_until("client registered", CONNECTION_TIMEOUT_SECS, || {
        b.server.peer_count() == 1
    })
    .await;

    let elsewhere = TempDir::new().unwrap();
    let absolute = elsewhere.path().join("escaped");
    let root = b.server.storage().root().to_path_buf();
    let sibling = format!(
        "../{}-escaped",
        root.file_name().unwrap().to_string_lossy()
    );

    store_file(&mut client, absolute.to_str().unwrap(), "k", b"pwned").await;
    store_file(&mut client, &sibling, "k", b"pwned").await;

    // The refused bytes were consumed, so the next frame is read correctly.
    get_file(&mut client, "x", "f").await;
    assert_eq!(read_reply(&mut client).await, b"still in sync");

    assert!(!absolute.exists(), "absolute owner escaped the root");
    assert!(
        !root.parent().unwrap().join(&sibling[3..]).exists(),
        "relative owner escaped the root"
    );
    assert_eq!(b.server.peer_count(), 1);

    b.shutdown().await;
}

/// Read frames off `reader` until `replies` fetch replies and `pushes` store
/// pushes have arrived, checking that no two frames ever interleave.
async fn read_frames<R>(
    reader: &mut R,
    reply_body: &[u8],
    push_size: u64,
    mut replies: usize,
    mut pushes: usize,
) where
    R: AsyncRead + Unpin,
{
    while replies > 0 || pushes > 0 {
        match reader.read_u8().await.unwrap() {
            INCOMING_MESSAGE => {
                let len = reader.read_u32().await.unwrap();
                let mut body = vec![0u8; len as usize];
                reader.read_exact(&mut body).await.unwrap();
                let Message::StoreFile { size, .. } = decode_message(&body).unwrap() else {
                    panic!("expected a store announcement");
                };
                assert_eq!(size, push_size);
                assert_eq!(
                    reader.read_u8().await.unwrap(),
                    INCOMING_STREAM,
                    "announcement must be followed by its stream"
                );
                let mut ciphertext = vec![0u8; size as usize];
                reader.read_exact(&mut ciphertext).await.unwrap();
                pushes -= 1;
            }
            INCOMING_STREAM => {
                let size = reader.read_u64_le().await.unwrap();
                assert_eq!(size, reply_body.len() as u64, "fetch reply header");
                let mut body = vec![0u8; size as usize];
                reader.read_exact(&mut body).await.unwrap();
                assert_eq!(body, reply_body);
                replies -= 1;
            }
            other => panic!("unexpected tag {other:#x}"),
        }
    }
}

#[tokio::test]
async fn fetch_replies_and_store_pushes_never_interleave() {
    const GETS: usize = 20;
    const PUSHES: usize = 10;

    init_test_tracing();
    let b = start_server("node-b", Arc::new(MemoryRegistry::new())).await;
    let reply_body = vec![0xabu8; 8 * 1024];
    b.server
        .storage()
        .write("x", "f", &mut &reply_body[..])
        .await
        .unwrap();

    let client = TcpStream::connect(b.addr()).await.unwrap();
    wait_until("client registered", CONNECTION_TIMEOUT_SECS, || {
        b.server.peer_count() == 1
    })
    .await;

    let (mut reader, mut writer) = client.into_split();
    let get = encode_message_frame(&Message::GetFile {
        id: "x".to_string(),
        key: "f".to_string(),
    })
    .unwrap();
    for _ in 0..GETS {
        writer.write_all(&get).await.unwrap();
    }

    let payload = vec![0x11u8; 8 * 1024];
    let push_size = (payload.len() + IV_LEN) as u64;
    let pushes = async {
        for i in 0..PUSHES {
            b.server
                .store(&format!("pushed-{i}"), &mut &payload[..])
                .await
                .unwrap();
        }
    };
    let frames = read_frames(&mut reader, &reply_body, push_size, GETS, PUSHES);

    tokio::time::timeout(Duration::from_secs(10), async {
        tokio::join!(pushes, frames)
    })
    .await
    .expect("every reply and push should arrive");

    b.shutdown().await;
}
