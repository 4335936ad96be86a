use clap::Parser;
use srm::controller::VirtualNodeController;
use srm::{
    ManagerConfig, RequestDispatcher, SimulationConfig, SimulationParams, StorageNodeManager,
    VirtualNodeEngine,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser)]
#[command(name = "srm", version, about = "tierfs cluster manager and gateway")]
struct Cli {
    /// Listen address of the data-plane gateway.
    #[arg(long, default_value = "127.0.0.1:7402")]
    gateway_listen: String,

    /// Listen address of the cluster-management surface.
    #[arg(long, default_value = "127.0.0.1:7403")]
    cluster_listen: String,

    /// Metadata service address for node mirroring (optional).
    #[arg(long)]
    mds_addr: Option<String>,

    /// Heartbeat timeout in milliseconds.
    #[arg(long, default_value_t = 30_000)]
    heartbeat_timeout_ms: u64,

    /// Health sweep interval in milliseconds.
    #[arg(long, default_value_t = 10_000)]
    health_check_interval_ms: u64,

    /// Virtual fleet description (ledger snapshot JSON) to load.
    #[arg(long)]
    virtual_nodes_json: Option<PathBuf>,

    /// Seed an empty fleet instead: ssd,hdd,mix node counts.
    #[arg(long, value_delimiter = ',', num_args = 3)]
    init_virtual_nodes: Option<Vec<u32>>,

    /// Per-node capacity for a seeded fleet.
    #[arg(long, default_value_t = 64 << 30)]
    virtual_capacity_bytes: u64,

    /// Directory of inode batch files to monitor (optional).
    #[arg(long)]
    inode_batch_dir: Option<PathBuf>,

    /// Batch monitor checkpoint path.
    #[arg(long, default_value = "./srm_data/batch_checkpoint.json")]
    batch_checkpoint: PathBuf,

    /// Batch poll interval in milliseconds.
    #[arg(long, default_value_t = 5_000)]
    batch_poll_interval_ms: u64,

    /// Capacity snapshot path (optional).
    #[arg(long)]
    capacity_snapshot: Option<PathBuf>,

    /// Capacity snapshot interval in seconds.
    #[arg(long, default_value_t = 10)]
    capacity_snapshot_interval_secs: u64,

    /// Simulated latency bounds, min,max milliseconds.
    #[arg(long, value_delimiter = ',', num_args = 2, default_value = "5,50")]
    sim_latency_ms: Vec<u64>,

    /// Simulated failure rate in [0, 1].
    #[arg(long, default_value_t = 0.0)]
    sim_failure_rate: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "srm=info".to_string()))
        .init();

    let cli = Cli::parse();
    let manager = StorageNodeManager::new(ManagerConfig {
        heartbeat_timeout: Duration::from_millis(cli.heartbeat_timeout_ms),
        health_check_interval: Duration::from_millis(cli.health_check_interval_ms),
        mds_addr: cli.mds_addr.clone(),
    });
    manager.start().await;

    let sim = SimulationParams {
        min_latency_ms: cli.sim_latency_ms[0],
        max_latency_ms: cli.sim_latency_ms[1],
        failure_rate: cli.sim_failure_rate,
    };
    let engine = Arc::new(VirtualNodeEngine::new(SimulationConfig {
        min_latency_ms: sim.min_latency_ms,
        max_latency_ms: sim.max_latency_ms,
        failure_rate: sim.failure_rate,
        default_read_size: 4096,
    }));

    let controller = VirtualNodeController::new(manager.clone(), sim);
    if let Some(path) = &cli.virtual_nodes_json {
        controller.load_nodes_from_json(path)?;
    } else if let Some(counts) = &cli.init_virtual_nodes {
        controller.init_empty_nodes(counts[0], counts[1], counts[2], cli.virtual_capacity_bytes);
    }
    if let Some(dir) = cli.inode_batch_dir.clone() {
        controller
            .start_inode_monitor(
                dir,
                cli.batch_checkpoint.clone(),
                Duration::from_millis(cli.batch_poll_interval_ms),
            )
            .await;
    }
    if let Some(path) = cli.capacity_snapshot.clone() {
        controller
            .start_snapshot(
                path,
                Duration::from_secs(cli.capacity_snapshot_interval_secs),
            )
            .await;
    }

    let dispatcher = Arc::new(RequestDispatcher::new(manager.clone(), engine));
    let gateway = TcpListener::bind(&cli.gateway_listen).await?;
    let cluster = TcpListener::bind(&cli.cluster_listen).await?;

    tokio::select! {
        result = srm::service::run_gateway(gateway, dispatcher) => result?,
        result = srm::service::run_cluster(cluster, manager.clone()) => result?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    controller.stop().await;
    manager.stop().await;
    Ok(())
}
