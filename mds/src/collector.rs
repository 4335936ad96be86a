//! Background cold-inode collector.
//!
//! Periodically runs an atime scan and hands the coldest inodes to a
//! pluggable sink (image aggregation, tiering, reporting). Scan failures
//! are absorbed and logged; the loop stops cooperatively.

use crate::core::MdsCore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Receives each round's cold set. Implementations must not block for
/// long; hand heavy work to their own tasks.
pub trait ColdSink: Send + Sync {
    fn consume(&self, cold_inodes: &[u64]);
}

#[derive(Clone, Debug)]
pub struct ColdCollectorConfig {
    /// Time between scan rounds.
    pub scan_interval: Duration,
    /// Share of the allocated population considered cold each round.
    pub atime_percent: f64,
    /// Upper bound on one round's candidate set.
    pub max_per_round: usize,
}

impl Default for ColdCollectorConfig {
    fn default() -> Self {
        ColdCollectorConfig {
            scan_interval: Duration::from_secs(24 * 3600),
            atime_percent: 20.0,
            max_per_round: 50_000,
        }
    }
}

pub struct ColdCollector {
    shutdown: watch::Sender<bool>,
    worker: Option<JoinHandle<()>>,
}

impl ColdCollector {
    /// Spawns the scan loop. `stop` joins it.
    pub fn start(core: Arc<MdsCore>, sink: Arc<dyn ColdSink>, config: ColdCollectorConfig) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.scan_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a fresh start
            // does not scan an empty store.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::run_round(&core, sink.as_ref(), &config);
                    }
                    _ = shutdown_rx.changed() => {
                        info!("cold collector stopping");
                        return;
                    }
                }
            }
        });
        ColdCollector {
            shutdown,
            worker: Some(worker),
        }
    }

    fn run_round(core: &MdsCore, sink: &dyn ColdSink, config: &ColdCollectorConfig) {
        let mut cold = core.collect_cold_inodes_by_atime_percent(config.atime_percent);
        if cold.len() > config.max_per_round {
            cold.truncate(config.max_per_round);
        }
        if cold.is_empty() {
            debug!("cold scan found nothing");
            return;
        }
        debug!(count = cold.len(), "cold scan round complete");
        sink.consume(&cold);
    }

    /// One immediate scan round, outside the timer. Used by tests and the
    /// admin surface.
    pub fn run_once(core: &MdsCore, sink: &dyn ColdSink, config: &ColdCollectorConfig) {
        Self::run_round(core, sink, config);
    }

    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(worker) = self.worker.take() {
            if let Err(err) = worker.await {
                error!("cold collector join failed: {err}");
            }
        }
    }
}
