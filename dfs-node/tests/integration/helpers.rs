//! Shared test helpers for multi-node integration tests.
//!
//! Re-exports from `dfs_net::testing` for convenience and adds file server
//! setup on top of it.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dfs_net::{TcpTransport, TcpTransportOpts};
use dfs_node::{FileServer, FileServerOpts, Registry};
use dfs_store::crypto::new_encryption_key;
use dfs_store::{PathTransform, Storage};
use tempfile::TempDir;
use tokio::task::JoinHandle;

pub use dfs_net::testing::{
    init_test_tracing, setup_node, Phase, TestTimer, CONNECTION_TIMEOUT_SECS,
    PEER_LEFT_TIMEOUT_SECS,
};

/// A running file server with its storage root.
pub struct TestServer {
    pub server: Arc<FileServer<TcpTransport>>,
    pub loop_task: JoinHandle<anyhow::Result<()>>,
    _root: TempDir,
}

impl TestServer {
    pub fn addr(&self) -> String {
        self.server.addr()
    }

    /// Stop the main loop and wait for it to return.
    pub async fn shutdown(self) {
        self.server.stop();
        self.loop_task
            .await
            .expect("server loop panicked")
            .expect("server loop failed");
    }
}

/// Start a file server on a free loopback port and spawn its main loop.
pub async fn start_server(id: &str, registry: Arc<dyn Registry>) -> TestServer {
    let root = TempDir::new().expect("failed to create storage root");
    let transport = TcpTransport::new(TcpTransportOpts::default());

    let server = FileServer::new(FileServerOpts {
        id: id.to_string(),
        enc_key: new_encryption_key().to_vec(),
        storage: Storage::new(root.path(), PathTransform::Cas),
        transport,
        registry,
    })
    .expect("failed to build file server");
    let server = Arc::new(server);

    server.start().await.expect("file server failed to start");
    let loop_task = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    TestServer {
        server,
        loop_task,
        _root: root,
    }
}

/// Poll `cond` until it holds. Panics after `timeout_secs`.
pub async fn wait_until<F>(what: &str, timeout_secs: u64, mut cond: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what} (after {timeout_secs}s)");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Wait until the object at `path` exists with exactly `len` bytes.
pub async fn wait_for_object(path: &Path, len: u64, timeout_secs: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
    loop {
        if let Ok(meta) = tokio::fs::metadata(path).await {
            if meta.len() == len {
                return;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "timed out waiting for {} to hold {len} bytes (after {timeout_secs}s)",
                path.display()
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
