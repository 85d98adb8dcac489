use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tidechain_common::{Block, EngineError, EngineResult, NodeId};

/// Block validation rule applied by the pipeline worker.
///
/// Implementations receive a snapshot of the active validator set taken
/// when the request was dequeued.
#[async_trait]
pub trait BlockValidator: Send + Sync {
    async fn validate(&self, block: &Block, active_validators: &[NodeId]) -> EngineResult<()>;

    fn name(&self) -> &str;
}

/// Accepts every block
#[derive(Debug, Default, Clone)]
pub struct AlwaysAccept;

#[async_trait]
impl BlockValidator for AlwaysAccept {
    async fn validate(&self, _block: &Block, _active_validators: &[NodeId]) -> EngineResult<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "always-accept"
    }
}

/// Requires signatures from at least `min_validations` members of the
/// active set. Signatures from nodes outside the set do not count.
#[derive(Debug, Clone)]
pub struct SignatureQuorum {
    pub min_validations: usize,
}

impl SignatureQuorum {
    pub fn new(min_validations: usize) -> Self {
        Self { min_validations }
    }

    /// Active validators that signed `block`
    pub fn count_signers(block: &Block, active_validators: &[NodeId]) -> usize {
        block
            .signers()
            .filter(|signer| active_validators.contains(signer))
            .count()
    }
}

#[async_trait]
impl BlockValidator for SignatureQuorum {
    async fn validate(&self, block: &Block, active_validators: &[NodeId]) -> EngineResult<()> {
        let signed = Self::count_signers(block, active_validators);
        if signed < self.min_validations {
            tracing::debug!(
                height = block.header.height,
                signed,
                required = self.min_validations,
                "Block lacks signature quorum"
            );
            return Err(EngineError::ValidationFailed("insufficient signatures".to_string()));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "signature-quorum"
    }
}

/// Strategy selected at engine construction
#[derive(Clone, Default)]
pub enum ValidationStrategy {
    AlwaysAccept,
    /// Quorum of `min_validations` from the configuration
    #[default]
    SignatureQuorum,
    Custom(Arc<dyn BlockValidator>),
}

impl ValidationStrategy {
    pub fn custom<V: BlockValidator + 'static>(validator: V) -> Self {
        ValidationStrategy::Custom(Arc::new(validator))
    }

    /// Build the validator the pipeline worker runs
    pub fn into_validator(self, min_validations: usize) -> Arc<dyn BlockValidator> {
        match self {
            ValidationStrategy::AlwaysAccept => Arc::new(AlwaysAccept),
            ValidationStrategy::SignatureQuorum => Arc::new(SignatureQuorum::new(min_validations)),
            ValidationStrategy::Custom(validator) => validator,
        }
    }
}

impl fmt::Debug for ValidationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationStrategy::AlwaysAccept => write!(f, "AlwaysAccept"),
            ValidationStrategy::SignatureQuorum => write!(f, "SignatureQuorum"),
            ValidationStrategy::Custom(validator) => write!(f, "Custom({})", validator.name()),
        }
    }
}
