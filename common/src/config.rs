use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};
use crate::types::{ConsensusType, NodeId};

/// Prefix for environment overrides, e.g. `TIDECHAIN_MIN_VALIDATIONS=4`
/// or `TIDECHAIN_FINALITY__PBFT_MS=800`
pub const ENV_PREFIX: &str = "TIDECHAIN";

/// Consensus engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Consensus flavour (poa, pos, pbft, dpos, hybrid)
    pub consensus_type: ConsensusType,

    /// Initial delegate list, registered in this order
    pub validator_nodes: Vec<String>,

    /// Quorum size and size of the active validator set
    pub min_validations: usize,

    /// Block time in seconds; the primary validator rotates at this cadence
    pub block_time_secs: u64,

    /// Election period in seconds
    pub epoch_length_secs: u64,

    /// Enable node-to-shard placement
    pub sharding_enabled: bool,

    /// Number of shards
    pub number_of_shards: usize,

    /// Soft capacity of a shard
    pub nodes_per_shard: usize,

    /// Maximum size of the elected set
    pub delegate_count: usize,

    /// Capacity of the bounded validation queue
    #[serde(default = "default_queue_capacity")]
    pub validation_queue_capacity: usize,

    /// Finality latency per consensus type
    #[serde(default)]
    pub finality: FinalityProfile,
}

/// Expected time-to-confirmation per consensus type, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinalityProfile {
    pub poa_ms: u64,
    pub pos_ms: u64,
    pub pbft_ms: u64,
    pub dpos_ms: u64,
    pub hybrid_ms: u64,
}

impl Default for FinalityProfile {
    fn default() -> Self {
        Self {
            poa_ms: 500,
            pos_ms: 2000,
            pbft_ms: 1000,
            dpos_ms: 1500,
            hybrid_ms: 1200,
        }
    }
}

impl FinalityProfile {
    pub fn delay_for(&self, consensus_type: ConsensusType) -> Duration {
        let ms = match consensus_type {
            ConsensusType::Poa => self.poa_ms,
            ConsensusType::Pos => self.pos_ms,
            ConsensusType::Pbft => self.pbft_ms,
            ConsensusType::Dpos => self.dpos_ms,
            ConsensusType::Hybrid => self.hybrid_ms,
        };
        Duration::from_millis(ms)
    }
}

fn default_queue_capacity() -> usize {
    100
}

impl EngineConfig {
    /// Load configuration from a file (format inferred from the extension),
    /// layered over the defaults and under `TIDECHAIN_*` environment overrides
    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let settings = ::config::Config::builder()
            .add_source(::config::Config::try_from(&Self::default())?)
            .add_source(::config::File::from(path).required(true))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("validator_nodes"),
            )
            .build()
            .map_err(|e| EngineError::Config(format!("Failed to read config file {}: {}", path.display(), e)))?;

        let config: EngineConfig = settings
            .try_deserialize()
            .map_err(|e| EngineError::Config(format!("Failed to parse config file {}: {}", path.display(), e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> EngineResult<()> {
        if self.min_validations == 0 {
            return Err(EngineError::Config("min_validations must be greater than 0".to_string()));
        }

        if self.epoch_length_secs == 0 {
            return Err(EngineError::Config("epoch_length_secs must be greater than 0".to_string()));
        }

        if self.block_time_secs == 0 {
            return Err(EngineError::Config("block_time_secs must be greater than 0".to_string()));
        }

        if self.validation_queue_capacity == 0 {
            return Err(EngineError::Config("validation_queue_capacity must be greater than 0".to_string()));
        }

        if self.min_validations > self.delegate_count {
            return Err(EngineError::Config(format!(
                "min_validations ({}) cannot exceed delegate_count ({})",
                self.min_validations, self.delegate_count
            )));
        }

        if self.sharding_enabled && self.number_of_shards == 0 {
            return Err(EngineError::InvalidShardConfiguration(
                "number_of_shards must be greater than 0 when sharding is enabled".to_string(),
            ));
        }

        if self.sharding_enabled && self.nodes_per_shard == 0 {
            return Err(EngineError::InvalidShardConfiguration(
                "nodes_per_shard must be greater than 0 when sharding is enabled".to_string(),
            ));
        }

        Ok(())
    }

    pub fn initial_delegates(&self) -> Vec<NodeId> {
        self.validator_nodes.iter().map(|id| NodeId::new(id)).collect()
    }

    pub fn epoch_length(&self) -> Duration {
        Duration::from_secs(self.epoch_length_secs)
    }

    pub fn block_time(&self) -> Duration {
        Duration::from_secs(self.block_time_secs)
    }

    pub fn finality_delay(&self) -> Duration {
        self.finality.delay_for(self.consensus_type)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            consensus_type: ConsensusType::Dpos,
            validator_nodes: (1..=5).map(|i| format!("node{}", i)).collect(),
            min_validations: 3,
            block_time_secs: 2,
            epoch_length_secs: 100,
            sharding_enabled: true,
            number_of_shards: 3,
            nodes_per_shard: 5,
            delegate_count: 21,
            validation_queue_capacity: default_queue_capacity(),
            finality: FinalityProfile::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.initial_delegates().len(), 5);
        assert_eq!(config.finality_delay(), Duration::from_millis(1500));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = EngineConfig { min_validations: 0, ..Default::default() };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));

        let config = EngineConfig { min_validations: 30, ..Default::default() };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));

        let config = EngineConfig { number_of_shards: 0, ..Default::default() };
        assert!(matches!(
            config.validate(),
            Err(EngineError::InvalidShardConfiguration(_))
        ));

        // Shard settings are irrelevant once sharding is off
        let config = EngineConfig {
            sharding_enabled: false,
            number_of_shards: 0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
consensus_type = "pbft"
validator_nodes = ["alpha", "beta", "gamma", "delta"]
min_validations = 2
block_time_secs = 1
epoch_length_secs = 10
sharding_enabled = true
number_of_shards = 4
nodes_per_shard = 2
delegate_count = 4

[finality]
poa_ms = 10
pos_ms = 20
pbft_ms = 30
dpos_ms = 40
hybrid_ms = 50
"#
        )
        .unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.consensus_type, ConsensusType::Pbft);
        assert_eq!(config.validator_nodes, vec!["alpha", "beta", "gamma", "delta"]);
        assert_eq!(config.number_of_shards, 4);
        assert_eq!(config.validation_queue_capacity, 100);
        assert_eq!(config.finality_delay(), Duration::from_millis(30));
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = EngineConfig::load("/nonexistent/tidechain.toml");
        assert!(matches!(result, Err(EngineError::Config(_))));
    }
}
