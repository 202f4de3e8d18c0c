use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dfs_net::{TcpTransport, TcpTransportOpts};
use dfs_node::{FileRegistry, FileServer, FileServerOpts, Settings};
use dfs_store::Storage;
use tracing_subscriber::EnvFilter;

/// How long `put`/`get` wait for dialed peers to finish connecting.
const PEER_WAIT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "dfs-node")]
#[command(about = "Peer-to-peer content-addressable file replication node")]
#[command(version)]
struct Cli {
    /// Directory holding settings.toml
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Listen address, overrides settings
    #[arg(short, long, global = true)]
    listen: Option<String>,

    /// Storage root, overrides settings
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// Registry file, overrides settings
    #[arg(long, global = true)]
    registry: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the network and serve peers until interrupted
    Serve,

    /// Store a file locally and replicate it to every peer
    Put {
        /// Logical key to store under
        key: String,
        /// File to read
        file: PathBuf,
    },

    /// Fetch a file, from the network if needed
    Get {
        /// Logical key to fetch
        key: String,
        /// Where to write the file
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let config_dir = cli.config_dir.clone().unwrap_or_else(Settings::config_dir);
    let mut settings = Settings::load_or_init(config_dir)?;
    if let Some(listen) = cli.listen {
        settings.listen_addr = listen;
    }
    if let Some(root) = cli.root {
        settings.storage_root = root;
    }
    if let Some(registry) = cli.registry {
        settings.registry_path = registry;
    }

    let server = Arc::new(build_server(&settings)?);

    match cli.command {
        Commands::Serve => {
            tokio::select! {
                res = server.serve() => res?,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupted, shutting down");
                    server.stop();
                }
            }
        }
        Commands::Put { key, file } => {
            let dialed = server.start().await?;
            let loop_task = spawn_loop(server.clone());
            wait_for_peers(&server, dialed).await;

            let mut reader = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("failed to open {}", file.display()))?;
            let n = server.store(&key, &mut reader).await?;
            println!("stored {key} ({n} bytes) on {} peer(s)", server.peer_count());

            server.stop();
            loop_task.await??;
        }
        Commands::Get { key, out } => {
            let dialed = server.start().await?;
            let loop_task = spawn_loop(server.clone());
            wait_for_peers(&server, dialed).await;

            let (size, mut reader) = server.get(&key).await?;
            let mut writer = tokio::fs::File::create(&out)
                .await
                .with_context(|| format!("failed to create {}", out.display()))?;
            tokio::io::copy(&mut reader, &mut writer).await?;
            println!("fetched {key} ({size} bytes) into {}", out.display());

            server.stop();
            loop_task.await??;
        }
    }

    Ok(())
}

fn build_server(settings: &Settings) -> Result<FileServer<TcpTransport>> {
    let transport = TcpTransport::new(TcpTransportOpts {
        listen_addr: settings.listen_addr.clone(),
        ..Default::default()
    });

    FileServer::new(FileServerOpts {
        id: settings.id.clone(),
        enc_key: settings.encryption_key_bytes()?,
        storage: Storage::new(&settings.storage_root, settings.path_transform),
        transport,
        registry: Arc::new(FileRegistry::new(&settings.registry_path)),
    })
}

fn spawn_loop(server: Arc<FileServer<TcpTransport>>) -> tokio::task::JoinHandle<Result<()>> {
    tokio::spawn(async move { server.run().await })
}

/// Give dialed connections a moment to come up before replicating.
async fn wait_for_peers(server: &FileServer<TcpTransport>, expected: usize) {
    let deadline = tokio::time::Instant::now() + PEER_WAIT;
    while server.peer_count() < expected && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    if server.peer_count() < expected {
        tracing::warn!(
            connected = server.peer_count(),
            expected,
            "not every dialed peer connected in time"
        );
    }
}
