use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tidechain_common::{EngineConfig, EngineError, EngineResult, NodeId, ShardId};

/// Logical shard for each domain entity type; unknown types land on shard 0
const ENTITY_SHARDS: &[(&str, usize)] = &[("hatchery", 0), ("farmer", 1), ("processor", 2)];

/// Shard placement settings, taken from [`EngineConfig`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardConfig {
    pub enabled: bool,
    pub shard_count: usize,
    pub nodes_per_shard: usize,
}

impl ShardConfig {
    pub fn from_engine_config(config: &EngineConfig) -> Self {
        Self {
            enabled: config.sharding_enabled,
            shard_count: config.number_of_shards,
            nodes_per_shard: config.nodes_per_shard,
        }
    }

    pub fn disabled() -> Self {
        Self { enabled: false, shard_count: 1, nodes_per_shard: 0 }
    }
}

/// Per-shard bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShardStatus {
    pub shard_id: ShardId,
    /// Nodes assigned to this shard, in assignment order
    pub nodes: Vec<NodeId>,
    pub block_height: u64,
    pub transactions: u64,
    /// Share of all recorded transactions routed to this shard
    pub load_factor: f64,
    /// Cross-shard transactions sent to other shards, by shard index
    pub cross_shard_txs: BTreeMap<usize, u64>,
}

impl ShardStatus {
    fn new(index: usize) -> Self {
        Self {
            shard_id: ShardId::indexed(index),
            nodes: Vec::new(),
            block_height: 0,
            transactions: 0,
            load_factor: 0.0,
            cross_shard_txs: BTreeMap::new(),
        }
    }
}

/// Aggregate transaction routing figures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShardMetrics {
    pub total_transactions: u64,
    pub cross_shard_transactions: u64,
    /// Transactions per shard, by shard index
    pub transactions_per_shard: BTreeMap<usize, u64>,
    /// Variance of the shard load factors around the even split
    pub load_imbalance: f64,
    pub last_measured: DateTime<Utc>,
}

struct ShardState {
    assignments: HashMap<NodeId, usize>,
    shards: Vec<ShardStatus>,
    total_transactions: u64,
    cross_shard_transactions: u64,
}

/// Assigns nodes to shards and routes transactions.
///
/// Placement is deterministic: a new node goes to the least-loaded shard,
/// ties to the lowest index. An assignment never changes once made.
pub struct ShardAssignor {
    config: ShardConfig,
    state: Mutex<ShardState>,
}

impl ShardAssignor {
    pub fn new(config: ShardConfig) -> EngineResult<Self> {
        if config.enabled && config.shard_count == 0 {
            return Err(EngineError::InvalidShardConfiguration(
                "shard count must be greater than 0".to_string(),
            ));
        }
        if config.enabled && config.nodes_per_shard == 0 {
            return Err(EngineError::InvalidShardConfiguration(
                "nodes per shard must be greater than 0".to_string(),
            ));
        }

        let shards = if config.enabled {
            (0..config.shard_count).map(ShardStatus::new).collect()
        } else {
            Vec::new()
        };

        Ok(Self {
            config,
            state: Mutex::new(ShardState {
                assignments: HashMap::new(),
                shards,
                total_transactions: 0,
                cross_shard_transactions: 0,
            }),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Number of shards; a disabled assignor reports the single default shard
    pub fn shard_count(&self) -> usize {
        if self.config.enabled {
            self.config.shard_count
        } else {
            1
        }
    }

    /// Place `node_id` on a shard, or return its existing shard
    pub fn assign_shard_to_node(&self, node_id: &NodeId) -> ShardId {
        if !self.config.enabled {
            return ShardId::default_shard();
        }

        let mut state = self.state.lock();
        if let Some(&index) = state.assignments.get(node_id) {
            return ShardId::indexed(index);
        }

        // min_by_key keeps the first minimum, i.e. the lowest index
        let index = state
            .shards
            .iter()
            .enumerate()
            .min_by_key(|(_, shard)| shard.nodes.len())
            .map(|(i, _)| i)
            .unwrap_or(0);

        let occupancy = state.shards[index].nodes.len() + 1;
        if occupancy > self.config.nodes_per_shard {
            tracing::warn!(
                node = %node_id,
                shard = index,
                occupancy,
                capacity = self.config.nodes_per_shard,
                "All shards at capacity, over-filling least-loaded shard"
            );
        }

        state.shards[index].nodes.push(node_id.clone());
        state.assignments.insert(node_id.clone(), index);

        tracing::debug!(node = %node_id, shard = index, "Node assigned to shard");
        ShardId::indexed(index)
    }

    /// Existing assignment for `node_id`, if any
    pub fn shard_of(&self, node_id: &NodeId) -> Option<ShardId> {
        if !self.config.enabled {
            return Some(ShardId::default_shard());
        }
        self.state.lock().assignments.get(node_id).map(|&i| ShardId::indexed(i))
    }

    /// Fixed logical shard for a domain entity type, independent of node load
    pub fn get_shard_for_entity_type(&self, entity_type: &str) -> ShardId {
        if !self.config.enabled {
            return ShardId::default_shard();
        }

        // Names match exactly; "Farmer" is an unknown type
        let index = ENTITY_SHARDS
            .iter()
            .find(|(name, _)| *name == entity_type)
            .map(|(_, index)| *index)
            .unwrap_or(0);
        ShardId::indexed(index % self.config.shard_count)
    }

    /// Node count per shard, by shard index
    pub fn shard_loads(&self) -> Vec<usize> {
        self.state.lock().shards.iter().map(|s| s.nodes.len()).collect()
    }

    pub fn shard_status(&self, shard_id: &ShardId) -> EngineResult<ShardStatus> {
        let state = self.state.lock();
        shard_id
            .index()
            .and_then(|i| state.shards.get(i))
            .cloned()
            .ok_or_else(|| EngineError::InvalidShardConfiguration(format!("unknown shard {}", shard_id)))
    }

    pub fn update_shard_block_height(&self, shard_id: &ShardId, height: u64) -> EngineResult<()> {
        let mut state = self.state.lock();
        let shard = shard_id
            .index()
            .and_then(|i| state.shards.get_mut(i))
            .ok_or_else(|| EngineError::InvalidShardConfiguration(format!("unknown shard {}", shard_id)))?;
        shard.block_height = height;
        Ok(())
    }

    /// Shard index that handles a transaction: the first byte of the account,
    /// falling back to the transaction id, modulo the shard count
    pub fn shard_for_transaction(&self, tx_id: &str, account: &str) -> usize {
        if !self.config.enabled {
            return 0;
        }
        route(tx_id, account, self.config.shard_count)
    }

    /// Count a transaction against its shard and track cross-shard traffic
    pub fn record_transaction(&self, tx_id: &str, account: &str, cross_shard_accounts: &[String]) {
        if !self.config.enabled {
            return;
        }

        let shard_count = self.config.shard_count;
        let primary = route(tx_id, account, shard_count);

        let mut state = self.state.lock();
        state.total_transactions += 1;
        if !cross_shard_accounts.is_empty() {
            state.cross_shard_transactions += 1;
        }

        let total = state.total_transactions;
        let shard = &mut state.shards[primary];
        shard.transactions += 1;
        for other in cross_shard_accounts {
            let target = route("", other, shard_count);
            if target != primary {
                *shard.cross_shard_txs.entry(target).or_insert(0) += 1;
            }
        }

        for shard in state.shards.iter_mut() {
            shard.load_factor = shard.transactions as f64 / total as f64;
        }
    }

    pub fn shard_metrics(&self) -> ShardMetrics {
        let state = self.state.lock();
        let shard_count = state.shards.len();

        let load_imbalance = if shard_count > 1 {
            let even = 1.0 / shard_count as f64;
            let sum_sq: f64 = state
                .shards
                .iter()
                .map(|s| (s.load_factor - even).powi(2))
                .sum();
            sum_sq / shard_count as f64
        } else {
            0.0
        };

        ShardMetrics {
            total_transactions: state.total_transactions,
            cross_shard_transactions: state.cross_shard_transactions,
            transactions_per_shard: state
                .shards
                .iter()
                .enumerate()
                .map(|(i, s)| (i, s.transactions))
                .collect(),
            load_imbalance,
            last_measured: Utc::now(),
        }
    }
}

fn route(tx_id: &str, account: &str, shard_count: usize) -> usize {
    let key = account.as_bytes().first().or_else(|| tx_id.as_bytes().first());
    match key {
        Some(&byte) => byte as usize % shard_count,
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignor(shards: usize, per_shard: usize) -> ShardAssignor {
        ShardAssignor::new(ShardConfig { enabled: true, shard_count: shards, nodes_per_shard: per_shard }).unwrap()
    }

    #[test]
    fn test_rejects_zero_shards() {
        let result = ShardAssignor::new(ShardConfig { enabled: true, shard_count: 0, nodes_per_shard: 5 });
        assert!(matches!(result, Err(EngineError::InvalidShardConfiguration(_))));

        let result = ShardAssignor::new(ShardConfig { enabled: true, shard_count: 3, nodes_per_shard: 0 });
        assert!(matches!(result, Err(EngineError::InvalidShardConfiguration(_))));
    }

    #[test]
    fn test_disabled_sharding_uses_default_shard() {
        let assignor = ShardAssignor::new(ShardConfig::disabled()).unwrap();
        assert_eq!(assignor.assign_shard_to_node(&NodeId::new("a")), ShardId::default_shard());
        assert_eq!(assignor.get_shard_for_entity_type("farmer"), ShardId::default_shard());
        assert_eq!(assignor.shard_count(), 1);
        assert!(assignor.shard_loads().is_empty());
    }

    #[test]
    fn test_least_loaded_lowest_index_placement() {
        let assignor = assignor(3, 5);
        let placed: Vec<ShardId> = (0..7)
            .map(|i| assignor.assign_shard_to_node(&NodeId::new(&format!("node{}", i))))
            .collect();

        let expected: Vec<ShardId> = [0, 1, 2, 0, 1, 2, 0].into_iter().map(ShardId::indexed).collect();
        assert_eq!(placed, expected);
        assert_eq!(assignor.shard_loads(), vec![3, 2, 2]);
    }

    #[test]
    fn test_assignment_is_idempotent() {
        let assignor = assignor(3, 5);
        let node = NodeId::new("node1");
        let first = assignor.assign_shard_to_node(&node);
        assignor.assign_shard_to_node(&NodeId::new("node2"));
        assert_eq!(assignor.assign_shard_to_node(&node), first);
        assert_eq!(assignor.shard_loads(), vec![1, 1, 0]);
        assert_eq!(assignor.shard_of(&node), Some(first));
    }

    #[test]
    fn test_overflow_beyond_capacity() {
        let assignor = assignor(2, 1);
        for i in 0..5 {
            assignor.assign_shard_to_node(&NodeId::new(&format!("n{}", i)));
        }
        assert_eq!(assignor.shard_loads(), vec![3, 2]);
    }

    #[test]
    fn test_entity_type_mapping() {
        let assignor = assignor(3, 5);
        assert_eq!(assignor.get_shard_for_entity_type("hatchery"), ShardId::indexed(0));
        assert_eq!(assignor.get_shard_for_entity_type("farmer"), ShardId::indexed(1));
        assert_eq!(assignor.get_shard_for_entity_type("Farmer"), ShardId::indexed(0));
        assert_eq!(assignor.get_shard_for_entity_type("PROCESSOR"), ShardId::indexed(0));
        assert_eq!(assignor.get_shard_for_entity_type("processor"), ShardId::indexed(2));
        assert_eq!(assignor.get_shard_for_entity_type("retailer"), ShardId::indexed(0));

        // Entity mapping ignores node load
        assignor.assign_shard_to_node(&NodeId::new("a"));
        assert_eq!(assignor.get_shard_for_entity_type("hatchery"), ShardId::indexed(0));

        let two = self::assignor(2, 5);
        assert_eq!(two.get_shard_for_entity_type("processor"), ShardId::indexed(0));
    }

    #[test]
    fn test_transaction_routing() {
        let assignor = assignor(3, 5);
        // 'a' = 97, 97 % 3 = 1
        assert_eq!(assignor.shard_for_transaction("tx_1", "alice"), 1);
        // falls back to the tx id: 't' = 116, 116 % 3 = 2
        assert_eq!(assignor.shard_for_transaction("tx_1", ""), 2);
        assert_eq!(assignor.shard_for_transaction("", ""), 0);
    }

    #[test]
    fn test_record_transaction_metrics() {
        let assignor = assignor(3, 5);
        assignor.record_transaction("tx_1", "alice", &[]);
        assignor.record_transaction("tx_2", "alice", &["bob".to_string(), "dave".to_string()]);

        let metrics = assignor.shard_metrics();
        assert_eq!(metrics.total_transactions, 2);
        assert_eq!(metrics.cross_shard_transactions, 1);
        assert_eq!(metrics.transactions_per_shard.get(&1), Some(&2));
        assert!(metrics.load_imbalance > 0.0);

        // 'b' = 98 -> shard 2, 'd' = 100 -> shard 1 (same as primary)
        let status = assignor.shard_status(&ShardId::indexed(1)).unwrap();
        assert_eq!(status.cross_shard_txs.get(&2), Some(&1));
        assert_eq!(status.cross_shard_txs.get(&1), None);
        assert!((status.load_factor - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_block_height_tracking() {
        let assignor = assignor(3, 5);
        assignor.update_shard_block_height(&ShardId::indexed(2), 42).unwrap();
        assert_eq!(assignor.shard_status(&ShardId::indexed(2)).unwrap().block_height, 42);
        assert!(assignor.update_shard_block_height(&ShardId::indexed(7), 1).is_err());
        assert!(assignor.shard_status(&ShardId::default_shard()).is_err());
    }
}
