use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tidechain_common::Block;

/// Throughput and validation figures for the engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsensusMetrics {
    /// Blocks committed by the state machine
    pub total_blocks_produced: u64,
    pub blocks_validated: u64,
    pub blocks_rejected: u64,
    /// Averages over committed blocks
    pub avg_transactions_per_block: f64,
    pub avg_block_size_bytes: f64,
    /// Average over all validation verdicts
    pub avg_validation_time_ms: f64,
    pub last_updated: DateTime<Utc>,
}

impl Default for ConsensusMetrics {
    fn default() -> Self {
        Self {
            total_blocks_produced: 0,
            blocks_validated: 0,
            blocks_rejected: 0,
            avg_transactions_per_block: 0.0,
            avg_block_size_bytes: 0.0,
            avg_validation_time_ms: 0.0,
            last_updated: Utc::now(),
        }
    }
}

impl ConsensusMetrics {
    /// Count a validation verdict
    pub fn record_validation(&mut self, accepted: bool, elapsed: Duration) {
        if accepted {
            self.blocks_validated += 1;
        } else {
            self.blocks_rejected += 1;
        }

        let verdicts = (self.blocks_validated + self.blocks_rejected) as f64;
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        self.avg_validation_time_ms = running_average(self.avg_validation_time_ms, elapsed_ms, verdicts);
        self.last_updated = Utc::now();
    }

    /// Count a committed block
    pub fn record_block(&mut self, block: &Block) {
        self.total_blocks_produced += 1;

        let produced = self.total_blocks_produced as f64;
        self.avg_transactions_per_block =
            running_average(self.avg_transactions_per_block, block.transactions.len() as f64, produced);
        self.avg_block_size_bytes =
            running_average(self.avg_block_size_bytes, block.encoded_size() as f64, produced);
        self.last_updated = Utc::now();
    }
}

fn running_average(current: f64, sample: f64, count: f64) -> f64 {
    current + (sample - current) / count
}
