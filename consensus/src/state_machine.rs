use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tidechain_common::{Block, EngineError, EngineResult, Transaction, TransactionId};

use crate::metrics::ConsensusMetrics;
use crate::pipeline::ValidationPipeline;
use crate::registry::ValidatorRegistry;

/// Steps within a consensus round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusStep {
    Propose,
    Prevote,
    Precommit,
    Commit,
}

impl fmt::Display for ConsensusStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsensusStep::Propose => "propose",
            ConsensusStep::Prevote => "prevote",
            ConsensusStep::Precommit => "precommit",
            ConsensusStep::Commit => "commit",
        };
        write!(f, "{}", name)
    }
}

/// Height/round progress with locked and valid block bookkeeping.
/// Blocks are identified by [`Block::digest`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsensusState {
    pub height: u64,
    pub round: u32,
    pub step: ConsensusStep,
    pub locked_round: Option<u32>,
    pub locked_block: Option<String>,
    pub valid_round: Option<u32>,
    pub valid_block: Option<String>,
}

impl ConsensusState {
    pub fn new(height: u64) -> Self {
        Self {
            height,
            round: 0,
            step: ConsensusStep::Propose,
            locked_round: None,
            locked_block: None,
            valid_round: None,
            valid_block: None,
        }
    }

    /// Proposals are only taken for the current height
    pub fn check_height(&self, height: u64) -> EngineResult<()> {
        if height < self.height {
            return Err(EngineError::ValidationFailed(format!("block height {} already committed", height)));
        }
        if height > self.height {
            return Err(EngineError::ValidationFailed(format!(
                "block height {} is ahead of consensus height {}",
                height, self.height
            )));
        }
        Ok(())
    }

    /// Whether `digest` may be accepted at this height
    pub fn accepts(&self, digest: &str) -> bool {
        self.locked_block.as_deref().map_or(true, |locked| locked == digest)
    }

    /// Take a proposal for `height`, prevote for it and lock on it. Until the
    /// block commits or fails validation, any other block at this height is
    /// refused and the step is unchanged.
    pub fn on_proposal(&mut self, height: u64, digest: &str) -> EngineResult<()> {
        self.check_height(height)?;
        if !self.accepts(digest) {
            return Err(EngineError::ValidationFailed(format!(
                "proposal conflicts with block locked in round {}",
                self.locked_round.unwrap_or_default()
            )));
        }
        self.locked_round = Some(self.round);
        self.locked_block = Some(digest.to_string());
        self.step = ConsensusStep::Prevote;
        Ok(())
    }

    /// A quorum prevoted for `digest`: it becomes the valid block and we
    /// move to precommit
    pub fn on_prevote_quorum(&mut self, digest: &str) {
        self.valid_round = Some(self.round);
        self.valid_block = Some(digest.to_string());
        self.step = ConsensusStep::Precommit;
    }

    /// A quorum precommitted on the locked block
    pub fn on_precommit_quorum(&mut self) {
        self.step = ConsensusStep::Commit;
    }

    /// Leave a committed height: next height, round 0, locks cleared
    pub fn advance_height(&mut self) {
        self.height += 1;
        self.round = 0;
        self.step = ConsensusStep::Propose;
        self.locked_round = None;
        self.locked_block = None;
        self.valid_round = None;
        self.valid_block = None;
    }

    /// Drop the lock on `digest` after it failed validation
    pub fn release(&mut self, digest: &str) {
        if self.locked_block.as_deref() == Some(digest) {
            self.locked_round = None;
            self.locked_block = None;
        }
    }

    /// Consensus was not reached: next round at the same height, locks kept
    pub fn next_round(&mut self) {
        self.round += 1;
        self.step = ConsensusStep::Propose;
    }
}

/// Drives proposals through the validation pipeline and tracks consensus
/// progress
pub struct ConsensusStateMachine {
    state: Mutex<ConsensusState>,
    pipeline: Arc<ValidationPipeline>,
    registry: Arc<ValidatorRegistry>,
    metrics: Arc<RwLock<ConsensusMetrics>>,
    finality_delay: Duration,
}

impl ConsensusStateMachine {
    pub fn new(
        pipeline: Arc<ValidationPipeline>,
        registry: Arc<ValidatorRegistry>,
        metrics: Arc<RwLock<ConsensusMetrics>>,
        finality_delay: Duration,
    ) -> Self {
        Self {
            state: Mutex::new(ConsensusState::new(0)),
            pipeline,
            registry,
            metrics,
            finality_delay,
        }
    }

    pub fn state(&self) -> ConsensusState {
        self.state.lock().clone()
    }

    pub fn finality_delay(&self) -> Duration {
        self.finality_delay
    }

    /// Validate a proposed block for the current height. The proposal locks
    /// the height while the pipeline decides: an accepted block is committed
    /// and the height advances, a rejected block releases the lock and moves
    /// consensus to the next round. Blocks for another height, or conflicting
    /// with the locked block, are refused without reaching the pipeline.
    pub async fn validate_block(&self, block: Block) -> EngineResult<bool> {
        let digest = block.digest();
        let height = block.header.height;
        let proposed = self.state.lock().on_proposal(height, &digest);
        if let Err(e) = proposed {
            tracing::debug!(block = %block, error = %e, "Proposal refused");
            return Err(e);
        }

        let producer = block.header.producer.clone();
        let response = self.pipeline.validate_block(block.clone()).await?;

        if response.is_valid {
            let next_height = {
                let mut state = self.state.lock();
                // A copy of this block may have committed the height while we waited
                state.check_height(height)?;
                state.on_prevote_quorum(&digest);
                state.on_precommit_quorum();
                state.advance_height();
                state.height
            };

            self.metrics.write().record_block(&block);
            if let Err(e) = self.registry.record_block_produced(&producer) {
                tracing::debug!(producer = %producer, error = %e, "Producer is not a registered delegate");
            }
            tracing::info!(block = %block, next_height, "Block committed");
        } else {
            let round = {
                let mut state = self.state.lock();
                if state.height == height {
                    state.release(&digest);
                    state.next_round();
                }
                state.round
            };

            if let Err(e) = self.registry.record_block_missed(&producer) {
                tracing::debug!(producer = %producer, error = %e, "Producer is not a registered delegate");
            }
            tracing::info!(height, round, "Consensus not reached, advancing round");
        }

        response.into_verdict()
    }

    /// Wait out the finality delay of the configured consensus type and
    /// return the confirmed transaction id
    pub async fn confirm_transaction(&self, transaction: &Transaction) -> EngineResult<TransactionId> {
        if !self.pipeline.is_running() {
            return Err(EngineError::EngineStopped);
        }

        let encoded = serde_json::to_vec(transaction)?;
        tokio::time::sleep(self.finality_delay).await;

        let confirmed = TransactionId(hex::encode(Sha256::digest(&encoded)));
        tracing::debug!(tx = %transaction.tx_id, confirmed = %confirmed, "Transaction confirmed");
        Ok(confirmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::{AlwaysAccept, BlockValidator, SignatureQuorum};
    use async_trait::async_trait;
    use tidechain_common::{NodeId, ShardId};

    /// Holds every validation until a permit is released
    struct Gate(tokio::sync::Semaphore);

    #[async_trait]
    impl BlockValidator for Gate {
        async fn validate(&self, _block: &Block, _active: &[NodeId]) -> EngineResult<()> {
            let _permit = self.0.acquire().await.map_err(|e| EngineError::Internal(e.to_string()))?;
            Ok(())
        }

        fn name(&self) -> &str {
            "gate"
        }
    }

    fn machine(validator: Arc<dyn BlockValidator>) -> (ConsensusStateMachine, Arc<ValidatorRegistry>) {
        let registry = Arc::new(ValidatorRegistry::new(Duration::from_secs(2)));
        for id in ["node1", "node2", "node3"] {
            registry.register_delegate(NodeId::new(id));
        }
        registry.elect(3).unwrap();

        let metrics = Arc::new(RwLock::new(ConsensusMetrics::default()));
        let pipeline = Arc::new(ValidationPipeline::new(Arc::clone(&registry), validator, Arc::clone(&metrics), 16));
        pipeline.start();

        let machine = ConsensusStateMachine::new(pipeline, Arc::clone(&registry), metrics, Duration::from_millis(1500));
        (machine, registry)
    }

    fn block(height: u64) -> Block {
        Block::new(height, "prev", NodeId::new("node1"), ShardId::indexed(0))
    }

    #[test]
    fn test_round_progression() {
        let mut state = ConsensusState::new(5);
        state.on_proposal(5, "aa").unwrap();
        assert_eq!(state.step, ConsensusStep::Prevote);
        assert_eq!(state.locked_round, Some(0));

        state.release("aa");
        state.next_round();
        assert_eq!((state.height, state.round, state.step), (5, 1, ConsensusStep::Propose));
        assert!(state.locked_block.is_none());

        state.on_proposal(5, "bb").unwrap();
        state.on_prevote_quorum("bb");
        assert_eq!(state.locked_round, Some(1));
        assert_eq!(state.valid_block.as_deref(), Some("bb"));
        assert_eq!(state.step, ConsensusStep::Precommit);

        state.on_precommit_quorum();
        assert_eq!(state.step, ConsensusStep::Commit);
        state.advance_height();
        assert_eq!((state.height, state.round, state.step), (6, 0, ConsensusStep::Propose));
        assert!(state.locked_block.is_none());
        assert!(state.valid_block.is_none());
    }

    #[test]
    fn test_lock_refuses_conflicting_proposal() {
        let mut state = ConsensusState::new(1);
        state.on_proposal(1, "aa").unwrap();

        // Precommit quorum missed; the lock carries into the next round
        state.next_round();
        assert!(state.on_proposal(1, "bb").is_err());
        assert_eq!(state.step, ConsensusStep::Propose);
        assert!(state.on_proposal(1, "aa").is_ok());
        assert_eq!(state.locked_block.as_deref(), Some("aa"));

        // Releasing another digest leaves the lock alone
        state.release("bb");
        assert_eq!(state.locked_block.as_deref(), Some("aa"));
    }

    #[test]
    fn test_proposals_only_for_current_height() {
        let mut state = ConsensusState::new(3);
        let stale = state.on_proposal(2, "aa");
        assert!(matches!(stale, Err(EngineError::ValidationFailed(r)) if r == "block height 2 already committed"));
        let ahead = state.on_proposal(4, "aa");
        assert!(matches!(ahead, Err(EngineError::ValidationFailed(r)) if r == "block height 4 is ahead of consensus height 3"));
        assert!(state.locked_block.is_none());
        assert_eq!(state.step, ConsensusStep::Propose);
    }

    #[tokio::test]
    async fn test_accepted_block_commits() {
        let (machine, registry) = machine(Arc::new(AlwaysAccept));
        assert!(machine.validate_block(block(0)).await.unwrap());

        let state = machine.state();
        assert_eq!(state.height, 1);
        assert_eq!(state.round, 0);
        assert_eq!(machine.metrics.read().total_blocks_produced, 1);
        assert_eq!(registry.get_delegate_performance(&NodeId::new("node1")).unwrap().blocks_produced, 1);
    }

    #[tokio::test]
    async fn test_rejected_block_advances_round() {
        let (machine, registry) = machine(Arc::new(SignatureQuorum::new(3)));
        let result = machine.validate_block(block(0)).await;
        assert!(matches!(result, Err(EngineError::ValidationFailed(r)) if r == "insufficient signatures"));

        let state = machine.state();
        assert_eq!((state.height, state.round), (0, 1));
        assert_eq!(registry.get_delegate_performance(&NodeId::new("node1")).unwrap().blocks_missed, 1);
    }

    #[tokio::test]
    async fn test_committed_height_refuses_conflicting_block() {
        let (machine, _registry) = machine(Arc::new(AlwaysAccept));
        let accepted = block(0);
        assert!(machine.validate_block(accepted.clone()).await.unwrap());

        let mut conflicting = block(0);
        conflicting.header.prev_hash = "fork".to_string();
        assert!(matches!(machine.validate_block(conflicting).await, Err(EngineError::ValidationFailed(_))));
        assert!(matches!(machine.validate_block(accepted).await, Err(EngineError::ValidationFailed(_))));

        let state = machine.state();
        assert_eq!((state.height, state.round), (1, 0));
        assert_eq!(machine.metrics.read().total_blocks_produced, 1);
    }

    #[tokio::test]
    async fn test_pending_proposal_locks_height() {
        let gate = Arc::new(Gate(tokio::sync::Semaphore::new(0)));
        let (machine, _registry) = machine(gate.clone());
        let machine = Arc::new(machine);

        let pending = block(0);
        let first = {
            let machine = Arc::clone(&machine);
            let pending = pending.clone();
            tokio::spawn(async move { machine.validate_block(pending).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let state = machine.state();
        assert_eq!(state.step, ConsensusStep::Prevote);
        assert_eq!(state.locked_block, Some(pending.digest()));

        let mut other = block(0);
        other.header.prev_hash = "fork".to_string();
        assert!(matches!(machine.validate_block(other).await, Err(EngineError::ValidationFailed(_))));

        gate.0.add_permits(1);
        assert!(first.await.unwrap().unwrap());
        assert_eq!(machine.state().height, 1);
        assert!(machine.state().locked_block.is_none());
    }

    #[tokio::test]
    async fn test_rejection_releases_lock() {
        let (machine, _registry) = machine(Arc::new(SignatureQuorum::new(2)));
        let unsigned = block(0);
        assert!(machine.validate_block(unsigned).await.is_err());
        assert!(machine.state().locked_block.is_none());

        let signed = block(0)
            .with_signature(NodeId::new("node1"), "a")
            .with_signature(NodeId::new("node2"), "b");
        assert!(machine.validate_block(signed).await.unwrap());
        assert_eq!(machine.state().height, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_transaction_waits_for_finality() {
        let (machine, _registry) = machine(Arc::new(AlwaysAccept));
        let tx = Transaction::new("transfer", "alice", serde_json::json!({"amount": 5}));

        let started = tokio::time::Instant::now();
        let confirmed = machine.confirm_transaction(&tx).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(1500));
        assert_eq!(confirmed.0.len(), 64);

        // Same transaction, same id
        assert_eq!(machine.confirm_transaction(&tx).await.unwrap(), confirmed);
    }

    #[tokio::test]
    async fn test_confirm_after_stop() {
        let (machine, _registry) = machine(Arc::new(AlwaysAccept));
        machine.pipeline.stop().await.unwrap();
        let tx = Transaction::new("transfer", "alice", serde_json::json!({}));
        assert!(matches!(machine.confirm_transaction(&tx).await, Err(EngineError::EngineStopped)));
    }
}
