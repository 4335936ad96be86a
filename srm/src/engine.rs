//! Virtual node engine: synthesizes data-plane replies with injected
//! latency and failure.

use common::wire::StorageResponse;
use common::{Status, StatusCode};
use rand::Rng;
use std::time::Duration;

#[derive(Clone, Copy, Debug)]
pub struct SimulationConfig {
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    /// Probability in [0, 1] that an op fails before doing anything.
    pub failure_rate: f64,
    /// Synthesized read length when the request does not name one.
    pub default_read_size: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            min_latency_ms: 5,
            max_latency_ms: 50,
            failure_rate: 0.0,
            default_read_size: 4096,
        }
    }
}

pub struct VirtualNodeEngine {
    config: SimulationConfig,
}

impl VirtualNodeEngine {
    pub fn new(config: SimulationConfig) -> Self {
        VirtualNodeEngine { config }
    }

    /// The failure draw happens before any simulated work; failed ops do
    /// not sleep.
    fn draw_failure(&self) -> Option<Status> {
        if rand::rng().random::<f64>() < self.config.failure_rate {
            Some(Status::error(
                StatusCode::VirtualNodeError,
                "simulated failure",
            ))
        } else {
            None
        }
    }

    /// Cooperative uniform-random latency; never blocks a worker thread.
    async fn add_latency(&self) {
        let (lo, hi) = (
            self.config.min_latency_ms,
            self.config.max_latency_ms.max(self.config.min_latency_ms),
        );
        let ms = rand::rng().random_range(lo..=hi);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    pub async fn simulate_write(&self, data: &[u8]) -> StorageResponse {
        if let Some(status) = self.draw_failure() {
            return StorageResponse::Write {
                status,
                bytes_written: 0,
            };
        }
        self.add_latency().await;
        // Checksum pass stands in for the real write work.
        let _ = crc32c::crc32c(data);
        StorageResponse::Write {
            status: Status::ok(),
            bytes_written: data.len() as u64,
        }
    }

    pub async fn simulate_read(&self, length: u64) -> StorageResponse {
        if let Some(status) = self.draw_failure() {
            return StorageResponse::Read {
                status,
                bytes_read: 0,
                data: Vec::new(),
                checksum: 0,
            };
        }
        self.add_latency().await;
        let len = if length > 0 {
            length
        } else {
            self.config.default_read_size
        };
        let data = vec![0u8; len as usize];
        let checksum = crc32c::crc32c(&data);
        StorageResponse::Read {
            status: Status::ok(),
            bytes_read: len,
            data,
            checksum,
        }
    }

    pub async fn simulate_truncate(&self) -> StorageResponse {
        if let Some(status) = self.draw_failure() {
            return StorageResponse::Status(status);
        }
        self.add_latency().await;
        StorageResponse::Status(Status::ok())
    }
}
