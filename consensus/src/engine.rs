use parking_lot::RwLock;
use std::sync::Arc;
use tidechain_common::{
    Block, EngineConfig, EngineError, EngineResult, NodeId, ShardId, Transaction, TransactionId,
};

use crate::election::ElectionScheduler;
use crate::metrics::ConsensusMetrics;
use crate::pipeline::ValidationPipeline;
use crate::registry::{DelegatePerformance, ElectionOutcome, ValidatorRegistry, ValidatorSet};
use crate::shard::{ShardAssignor, ShardConfig, ShardMetrics};
use crate::state_machine::{ConsensusState, ConsensusStateMachine};
use crate::validation::ValidationStrategy;

/// Engine lifecycle. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Created,
    Running,
    Stopped,
}

/// Validator election and block-validation engine.
///
/// Owns the delegate registry, the shard assignor, the election scheduler,
/// the validation pipeline and the consensus state machine.
pub struct ConsensusEngine {
    config: EngineConfig,

    /// Delegates, votes and the active validator set
    registry: Arc<ValidatorRegistry>,

    /// Node-to-shard placement, independent of the registry
    shards: ShardAssignor,

    /// Periodic elections (DPoS and Hybrid only)
    scheduler: ElectionScheduler,

    pipeline: Arc<ValidationPipeline>,

    state_machine: ConsensusStateMachine,

    metrics: Arc<RwLock<ConsensusMetrics>>,

    status: RwLock<EngineStatus>,
}

impl ConsensusEngine {
    /// Create an engine validating blocks by signature quorum
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        Self::with_strategy(config, ValidationStrategy::default())
    }

    /// Create an engine with an explicit validation strategy
    pub fn with_strategy(config: EngineConfig, strategy: ValidationStrategy) -> EngineResult<Self> {
        config.validate()?;

        let registry = Arc::new(ValidatorRegistry::new(config.block_time()));
        for node_id in config.initial_delegates() {
            registry.register_delegate(node_id);
        }

        // Seed the active set so validation works before the first epoch ends
        match registry.elect(config.min_validations) {
            Ok(outcome) => {
                tracing::info!(active = ?outcome.active, "Initial validator set elected");
            }
            Err(e) => {
                tracing::warn!(error = %e, "No initial validator set");
            }
        }

        let shards = ShardAssignor::new(ShardConfig::from_engine_config(&config))?;
        let scheduler = ElectionScheduler::new(Arc::clone(&registry), config.min_validations, config.epoch_length());

        let metrics = Arc::new(RwLock::new(ConsensusMetrics::default()));
        let validator = strategy.into_validator(config.min_validations);
        let pipeline = Arc::new(ValidationPipeline::new(
            Arc::clone(&registry),
            validator,
            Arc::clone(&metrics),
            config.validation_queue_capacity,
        ));
        let state_machine = ConsensusStateMachine::new(
            Arc::clone(&pipeline),
            Arc::clone(&registry),
            Arc::clone(&metrics),
            config.finality_delay(),
        );

        Ok(Self {
            config,
            registry,
            shards,
            scheduler,
            pipeline,
            state_machine,
            metrics,
            status: RwLock::new(EngineStatus::Created),
        })
    }

    /// Start the validation worker and, for delegated consensus types, the
    /// election timer
    pub async fn start(&self) -> EngineResult<()> {
        {
            let mut status = self.status.write();
            match *status {
                EngineStatus::Running => return Ok(()),
                EngineStatus::Stopped => return Err(EngineError::EngineStopped),
                EngineStatus::Created => *status = EngineStatus::Running,
            }
        }

        self.pipeline.start();
        if self.config.consensus_type.runs_elections() {
            self.scheduler.start();
        }

        tracing::info!(
            consensus_type = %self.config.consensus_type,
            min_validations = self.config.min_validations,
            sharding = self.config.sharding_enabled,
            "Consensus engine started"
        );
        Ok(())
    }

    /// Stop elections, close the validation queue and answer every queued
    /// request with `EngineStopped`
    pub async fn stop(&self) -> EngineResult<()> {
        {
            let mut status = self.status.write();
            if *status == EngineStatus::Stopped {
                return Ok(());
            }
            *status = EngineStatus::Stopped;
        }

        self.scheduler.stop().await;
        self.pipeline.stop().await?;

        tracing::info!("Consensus engine stopped");
        Ok(())
    }

    pub fn status(&self) -> EngineStatus {
        *self.status.read()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate a proposed block. `Ok(true)` when accepted; a rejection
    /// surfaces as `ValidationFailed` with the reason.
    pub async fn validate_block(&self, block: Block) -> EngineResult<bool> {
        if self.status() != EngineStatus::Running {
            return Err(EngineError::EngineStopped);
        }
        self.state_machine.validate_block(block).await
    }

    pub fn register_delegate(&self, node_id: NodeId) -> bool {
        self.registry.register_delegate(node_id)
    }

    pub fn vote_for_delegate(&self, voter_id: &NodeId, delegate_id: &NodeId, weight: u64) -> EngineResult<u64> {
        self.registry.vote_for_delegate(voter_id, delegate_id, weight)
    }

    pub fn get_active_validators(&self) -> Vec<NodeId> {
        self.registry.get_active_validators()
    }

    pub fn validator_set(&self) -> ValidatorSet {
        self.registry.validator_set()
    }

    pub fn get_delegate_performance(&self, delegate_id: &NodeId) -> EngineResult<DelegatePerformance> {
        self.registry.get_delegate_performance(delegate_id)
    }

    pub fn record_heartbeat(&self, delegate_id: &NodeId) -> EngineResult<()> {
        self.registry.record_heartbeat(delegate_id)
    }

    /// Run an election immediately, outside the epoch timer
    pub fn run_election(&self) -> EngineResult<ElectionOutcome> {
        self.scheduler.run_once()
    }

    pub fn assign_shard_to_node(&self, node_id: &NodeId) -> ShardId {
        self.shards.assign_shard_to_node(node_id)
    }

    pub fn get_shard_for_entity_type(&self, entity_type: &str) -> ShardId {
        self.shards.get_shard_for_entity_type(entity_type)
    }

    pub fn shard_for_transaction(&self, tx_id: &str, account: &str) -> ShardId {
        if self.shards.is_enabled() {
            ShardId::indexed(self.shards.shard_for_transaction(tx_id, account))
        } else {
            ShardId::default_shard()
        }
    }

    pub fn record_transaction(&self, tx_id: &str, account: &str, cross_shard_accounts: &[String]) {
        self.shards.record_transaction(tx_id, account, cross_shard_accounts)
    }

    pub fn shard_metrics(&self) -> ShardMetrics {
        self.shards.shard_metrics()
    }

    pub fn shard_loads(&self) -> Vec<usize> {
        self.shards.shard_loads()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.shard_count()
    }

    /// Wait for finality and return the confirmed transaction id
    pub async fn confirm_transaction(&self, transaction: &Transaction) -> EngineResult<TransactionId> {
        if self.status() != EngineStatus::Running {
            return Err(EngineError::EngineStopped);
        }
        self.state_machine.confirm_transaction(transaction).await
    }

    pub fn consensus_state(&self) -> ConsensusState {
        self.state_machine.state()
    }

    pub fn metrics(&self) -> ConsensusMetrics {
        self.metrics.read().clone()
    }
}
