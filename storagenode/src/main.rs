use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use storagenode::agent::{AgentConfig, NodeAgent};
use storagenode::{ChunkService, IoOptions, ManifestLog};
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser)]
#[command(name = "storagenode", version, about = "tierfs storage node daemon")]
struct Cli {
    /// Listen address of the storage service.
    #[arg(long, default_value = "127.0.0.1:7404")]
    listen: String,

    /// Chunk data roots; chunks spread round-robin across them.
    #[arg(long, value_name = "DIR", required = true, num_args = 1..)]
    data_root: Vec<PathBuf>,

    /// Manifest log path (defaults to the first data root).
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Cluster manager address for registration/heartbeats.
    #[arg(long)]
    srm_addr: Option<String>,

    /// IP advertised to the cluster manager.
    #[arg(long, default_value = "127.0.0.1")]
    advertise_ip: String,

    /// Hostname override in the registration report.
    #[arg(long)]
    hostname: Option<String>,

    /// Soft cap on cached open descriptors.
    #[arg(long, default_value_t = 128)]
    max_open_files: usize,

    /// fsync chunk writes before acknowledging.
    #[arg(long)]
    sync_on_write: bool,

    #[arg(long, default_value_t = 5_000)]
    heartbeat_interval_ms: u64,

    #[arg(long, default_value_t = 3_000)]
    register_backoff_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "storagenode=info".to_string()),
        )
        .init();

    let cli = Cli::parse();
    for root in &cli.data_root {
        storagenode::disk::ensure_data_dir(root)?;
    }
    let manifest = Arc::new(ManifestLog::open(cli.data_root.clone(), cli.manifest.clone())?);
    let chunks = Arc::new(ChunkService::new(
        manifest,
        IoOptions {
            max_open_files: cli.max_open_files,
            sync_on_write: cli.sync_on_write,
        },
    ));

    let listener = TcpListener::bind(&cli.listen).await?;
    let listen_port = listener.local_addr()?.port() as u32;

    let agent = cli.srm_addr.clone().map(|srm_addr| {
        let agent = NodeAgent::new(AgentConfig {
            srm_addr,
            listen_port,
            advertise_ip: cli.advertise_ip.clone(),
            hostname_override: cli.hostname.clone(),
            mount_point: cli.data_root[0].clone(),
            heartbeat_interval: Duration::from_millis(cli.heartbeat_interval_ms),
            register_backoff: Duration::from_millis(cli.register_backoff_ms),
        });
        agent.start();
        agent
    });

    tokio::select! {
        result = storagenode::service::run(listener, chunks) => result?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    if let Some(agent) = agent {
        agent.stop().await;
    }
    Ok(())
}
