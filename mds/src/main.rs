use clap::Parser;
use mds::collector::{ColdCollector, ColdCollectorConfig, ColdSink};
use mds::{MdsCore, MdsOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser)]
#[command(name = "mds", version, about = "tierfs metadata service")]
struct Cli {
    /// Listen address for the metadata RPC surface.
    #[arg(long, default_value = "127.0.0.1:7301")]
    listen: String,

    /// Directory holding the inode file, bitmap, directory pages and path
    /// index.
    #[arg(long, value_name = "DIR", default_value = "./mds_data")]
    data_dir: PathBuf,

    /// Wipe and re-initialize the metadata files.
    #[arg(long)]
    create_new: bool,

    /// Disable the persistent path index (rebuild-by-scan only).
    #[arg(long)]
    no_pathkv: bool,

    /// Cold-scan interval in seconds (0 disables the collector).
    #[arg(long, default_value_t = 86_400)]
    cold_scan_interval_secs: u64,

    /// Percent of allocated inodes reported cold per round.
    #[arg(long, default_value_t = 20.0)]
    cold_percent: f64,
}

/// Default sink: report the cold set in the log until an aggregation
/// backend is attached.
struct LogSink;
impl ColdSink for LogSink {
    fn consume(&self, cold_inodes: &[u64]) {
        info!(count = cold_inodes.len(), "cold inode round");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "mds=info".to_string()))
        .init();

    let cli = Cli::parse();
    let core = MdsCore::open(MdsOptions {
        data_dir: cli.data_dir,
        create_new: cli.create_new,
        enable_pathkv: !cli.no_pathkv,
    })?;
    core.create_root().await?;

    let collector = if cli.cold_scan_interval_secs > 0 {
        Some(ColdCollector::start(
            core.clone(),
            Arc::new(LogSink),
            ColdCollectorConfig {
                scan_interval: Duration::from_secs(cli.cold_scan_interval_secs),
                atime_percent: cli.cold_percent,
                ..ColdCollectorConfig::default()
            },
        ))
    } else {
        None
    };

    let listener = TcpListener::bind(&cli.listen).await?;
    tokio::select! {
        result = mds::service::run(listener, core) => result?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    if let Some(collector) = collector {
        collector.stop().await;
    }
    Ok(())
}
