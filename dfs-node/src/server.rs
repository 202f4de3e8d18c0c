//! Replication orchestrator.
//!
//! A [`FileServer`] ties a [`Transport`], the live peer map, the local
//! [`Storage`] and a [`Registry`] together. Control messages from peers are
//! handled one at a time by [`FileServer::run`]; raw object bytes are read
//! straight off the sending peer's connection through its stream gate.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use dfs_net::{Peer, PeerConnection, PeerRegistry, Rpc, Transport};
use dfs_protocol::message::decode_message;
use dfs_protocol::wire::{encode_message_frame, stream_header, INCOMING_STREAM};
use dfs_protocol::{Message, Node};
use dfs_store::crypto::{encrypt_stream, hash_key, IV_LEN};
use dfs_store::Storage;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

use crate::discovery::Registry;

/// Everything a [`FileServer`] is built from.
pub struct FileServerOpts<T> {
    /// Owner id under which this node stores its own objects.
    pub id: String,
    /// 32-byte key used to encrypt objects pushed to peers.
    pub enc_key: Vec<u8>,
    pub storage: Storage,
    pub transport: T,
    pub registry: Arc<dyn Registry>,
}

/// One node of the replication network.
pub struct FileServer<T: Transport> {
    id: String,
    enc_key: Vec<u8>,
    storage: Storage,
    transport: T,
    registry: Arc<dyn Registry>,
    peers: Arc<PeerRegistry>,
    rpc_rx: Mutex<Option<mpsc::Receiver<Rpc>>>,
    closed_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    quit: watch::Sender<bool>,
}

impl<T: Transport> FileServer<T> {
    /// Build a server and hook it into `opts.transport`.
    ///
    /// Fails if the transport's delivery queues were already taken.
    pub fn new(opts: FileServerOpts<T>) -> Result<Self> {
        let rpc_rx = opts
            .transport
            .take_rpc_receiver()
            .context("transport rpc queue already taken")?;
        let closed_rx = opts
            .transport
            .take_closed_peer_receiver()
            .context("transport closed-peer queue already taken")?;

        let peers = Arc::new(PeerRegistry::new());
        opts.transport.set_on_peer({
            let peers = peers.clone();
            Arc::new(move |peer: Arc<PeerConnection>| -> Result<()> {
                tracing::info!(
                    remote_addr = %peer.remote_addr(),
                    outbound = peer.is_outbound(),
                    "connected to remote file server"
                );
                peers.set(peer.key(), peer);
                Ok(())
            })
        });

        let (quit, _) = watch::channel(false);

        Ok(Self {
            id: opts.id,
            enc_key: opts.enc_key,
            storage: opts.storage,
            transport: opts.transport,
            registry: opts.registry,
            peers,
            rpc_rx: Mutex::new(Some(rpc_rx)),
            closed_rx: Mutex::new(Some(closed_rx)),
            quit,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Address peers reach this node on.
    pub fn addr(&self) -> String {
        self.transport.addr()
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Number of live peer connections.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Listen, register with the registry and dial every known node.
    ///
    /// Returns the number of nodes dialed successfully. Failing to bind or
    /// to list the registry is fatal; a failed dial only deregisters that
    /// node.
    pub async fn start(&self) -> Result<usize> {
        tracing::info!(server_addr = %self.transport.addr(), "starting file server");

        self.transport.listen_and_accept().await?;
        self.add_self_node().await;
        self.bootstrap_network().await
    }

    /// [`start`](Self::start) followed by [`run`](Self::run).
    pub async fn serve(&self) -> Result<()> {
        self.start().await?;
        self.run().await
    }

    /// Process control messages and peer departures until [`stop`](Self::stop).
    ///
    /// Messages are handled strictly one after another. A failing message is
    /// logged and the loop carries on.
    pub async fn run(&self) -> Result<()> {
        let mut rpc_rx = self
            .rpc_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .context("file server loop already running")?;
        let mut closed_rx = self
            .closed_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .context("file server loop already running")?;
        let mut quit = self.quit.subscribe();

        loop {
            tokio::select! {
                rpc = rpc_rx.recv() => {
                    let Some(rpc) = rpc else {
                        tracing::warn!("transport rpc queue closed");
                        break;
                    };
                    if let Err(e) = self.handle_rpc(rpc).await {
                        tracing::error!(error = %format!("{e:#}"), "handle message error");
                    }
                }
                addr = closed_rx.recv() => {
                    let Some(addr) = addr else {
                        tracing::warn!("transport closed-peer queue closed");
                        break;
                    };
                    tracing::info!(remote_peer_addr = %addr, "removing peer from list");
                    self.peers.delete(&addr);
                }
                _ = async { let _ = quit.wait_for(|quit| *quit).await; } => break,
            }
        }

        tracing::warn!(server_addr = %self.transport.addr(), "file server stopped");
        self.transport.close();
        if let Err(e) = self.registry.close().await {
            tracing::warn!(error = %e, "failed to close registry");
        }
        Ok(())
    }

    /// Ask [`run`](Self::run) to return.
    pub fn stop(&self) {
        self.quit.send_replace(true);
    }

    /// Store `reader` locally under `key` and push an encrypted copy to every
    /// live peer.
    ///
    /// Peers receive the object under `hash_key(key)` and this node's id.
    /// Each peer's writer is held from the announcement to the last
    /// ciphertext byte. Returns the number of plaintext bytes stored locally.
    pub async fn store<R>(&self, key: &str, reader: &mut R) -> Result<u64>
    where
        R: tokio::io::AsyncRead + Unpin + ?Sized,
    {
        let size = self.storage.write(&self.id, key, reader).await?;

        let peers = self.peers.values();
        let frame = encode_message_frame(&Message::StoreFile {
            id: self.id.clone(),
            key: hash_key(key),
            size: size + IV_LEN as u64,
        })
        .context("failed to encode message")?;

        for peer in &peers {
            let (_, mut file) = self.storage.read(&self.id, key).await?;
            let mut writer = peer.writer().await;
            writer
                .write_all(&frame)
                .await
                .with_context(|| format!("failed to announce {key} to {}", peer.key()))?;
            writer
                .write_all(&[INCOMING_STREAM])
                .await
                .with_context(|| format!("failed to announce stream to {}", peer.key()))?;
            let n = encrypt_stream(&self.enc_key, &mut file, &mut *writer)
                .await
                .with_context(|| format!("failed to stream {key} to {}", peer.key()))?;
            tracing::debug!(peer = %peer.key(), key, bytes = n, "pushed encrypted object");
        }

        tracing::info!(
            server_addr = %self.transport.addr(),
            key,
            bytes = size,
            peers = peers.len(),
            "stored and replicated file"
        );
        Ok(size)
    }

    /// Open `key` for reading, fetching it from the network if it is not on
    /// local disk.
    ///
    /// Every live peer is asked for the object and must answer; a peer that
    /// lacks it never replies and this call waits on it indefinitely.
    pub async fn get(&self, key: &str) -> Result<(u64, File)> {
        if self.storage.has(&self.id, key).await? {
            tracing::info!(
                server_addr = %self.transport.addr(),
                key,
                "serving file from local disk"
            );
            return self.storage.read(&self.id, key).await;
        }

        tracing::info!(
            server_addr = %self.transport.addr(),
            key,
            "file not found locally, fetching from network"
        );

        let peers = self.peers.values();
        let msg = Message::GetFile {
            id: self.id.clone(),
            key: hash_key(key),
        };
        self.broadcast_to(&peers, &msg).await?;

        for peer in &peers {
            let mut stream = peer.begin_stream().await;
            let size = stream
                .read_u64_le()
                .await
                .with_context(|| format!("failed to read reply size from {}", peer.key()))?;
            let n = self
                .storage
                .write_decrypted(&self.enc_key, &self.id, key, &mut (&mut stream).take(size))
                .await?;
            drop(stream);

            tracing::info!(
                server_addr = %self.transport.addr(),
                peer = %peer.key(),
                bytes = n,
                "received file over the network"
            );
        }

        self.storage.read(&self.id, key).await
    }

    /// Remove `key` from local disk only.
    pub async fn delete_local(&self, key: &str) -> Result<()> {
        self.storage.delete(&self.id, key).await
    }

    /// Remove every locally stored object.
    pub async fn clear(&self) -> Result<()> {
        self.storage.clear().await
    }

    /// Encode `msg` once and send it to every live peer.
    ///
    /// The first failed write aborts the remaining sends.
    pub async fn broadcast(&self, msg: &Message) -> Result<()> {
        self.broadcast_to(&self.peers.values(), msg).await
    }

    async fn broadcast_to(&self, peers: &[Arc<PeerConnection>], msg: &Message) -> Result<()> {
        let frame = encode_message_frame(msg).context("failed to encode message")?;
        for peer in peers {
            peer.send_data(&frame).await?;
        }
        tracing::debug!(kind = msg.kind(), peers = peers.len(), "broadcast message");
        Ok(())
    }

    async fn handle_rpc(&self, rpc: Rpc) -> Result<()> {
        let Some(payload) = rpc.payload else {
            return Ok(());
        };
        let msg = decode_message(&payload).context("decoding error")?;
        tracing::debug!(from = %rpc.from, kind = msg.kind(), "received message");

        match msg {
            Message::StoreFile { id, key, size } => {
                self.handle_store_file(&rpc.from, &id, &key, size).await
            }
            Message::GetFile { id, key } => self.handle_get_file(&rpc.from, &id, &key).await,
        }
    }

    /// Read exactly `size` announced bytes from `from` into `(id, key)`.
    ///
    /// A refused or failed write still consumes the announced bytes so the
    /// connection stays in step with the sender.
    async fn handle_store_file(&self, from: &str, id: &str, key: &str, size: u64) -> Result<()> {
        let peer = self.peer(from)?;

        let mut stream = peer.begin_stream().await;
        let written = {
            let mut body = (&mut stream).take(size);
            let written = self.storage.write(id, key, &mut body).await;
            if written.is_err() {
                if let Err(e) = tokio::io::copy(&mut body, &mut tokio::io::sink()).await {
                    tracing::warn!(from, error = %e, "failed to discard refused stream");
                }
            }
            written
        };
        // Releases the peer's read loop.
        drop(stream);
        let n = written.with_context(|| format!("refused object ({id}, {key}) from {from}"))?;

        if n != size {
            bail!("stream from {from} ended after {n} of {size} bytes");
        }
        tracing::info!(
            server_addr = %self.transport.addr(),
            from,
            bytes = n,
            "written file to disk"
        );
        Ok(())
    }

    /// Send `(id, key)` to `from` as `[0x2][u64 LE size][bytes]`.
    async fn handle_get_file(&self, from: &str, id: &str, key: &str) -> Result<()> {
        if !self.storage.has(id, key).await? {
            bail!(
                "[{}] need to serve file ({key}) but it does not exist on disk",
                self.transport.addr()
            );
        }

        let (size, mut file) = self.storage.read(id, key).await?;
        let peer = self.peer(from)?;

        tracing::info!(
            server_addr = %self.transport.addr(),
            key,
            "serving file over the network"
        );

        let mut writer = peer.writer().await;
        writer
            .write_all(&stream_header(size))
            .await
            .with_context(|| format!("failed to send reply header to {from}"))?;
        let n = tokio::io::copy(&mut file, &mut *writer)
            .await
            .with_context(|| format!("failed to send {key} to {from}"))?;

        tracing::info!(
            server_addr = %self.transport.addr(),
            to = from,
            bytes = n,
            "written file over the network"
        );
        Ok(())
    }

    fn peer(&self, addr: &str) -> Result<Arc<PeerConnection>> {
        self.peers
            .get(&addr.to_string())
            .with_context(|| format!("peer ({addr}) could not be found in the peer list"))
    }

    async fn add_self_node(&self) {
        let address = self.transport.addr();
        let (ip, port) = match address.parse::<SocketAddr>() {
            Ok(sock) => (sock.ip().to_string(), sock.port()),
            Err(_) => (String::new(), 0),
        };

        let node = Node {
            server_id: self.id.clone(),
            ip,
            hostname: hostname(),
            port,
            created_at: unix_now(),
            connected: true,
            address,
        };

        if let Err(e) = self.registry.add_node(&node).await {
            tracing::error!(error = %e, "error adding node to registry");
        }
    }

    async fn bootstrap_network(&self) -> Result<usize> {
        let nodes = self
            .registry
            .list_nodes()
            .await
            .context("error retrieving file server nodes from the registry")?;

        let own = self.transport.addr();
        let own = own.as_str();
        let dials = nodes
            .into_iter()
            .filter(|node| node.address != own)
            .map(|node| async move {
                tracing::info!(
                    remote_addr = %node.address,
                    local_addr = %own,
                    "attempting to connect with remote"
                );
                match self.transport.dial(&node.address).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::info!(
                            remote_addr = %node.address,
                            error = %format!("{e:#}"),
                            "dial error, removing node from registry"
                        );
                        if let Err(e) = self.registry.remove_node(&node).await {
                            tracing::warn!(error = %e, "failed to remove dead node");
                        }
                        false
                    }
                }
            });

        let dialed = futures::future::join_all(dials)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count();
        Ok(dialed)
    }
}

fn hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
