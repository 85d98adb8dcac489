pub mod registry;
pub mod election;
pub mod shard;
pub mod validation;
pub mod pipeline;
pub mod state_machine;
pub mod metrics;
pub mod engine;

pub use registry::{Delegate, DelegatePerformance, ElectionOutcome, ValidatorRegistry, ValidatorSet};
pub use election::ElectionScheduler;
pub use shard::{ShardAssignor, ShardConfig, ShardMetrics, ShardStatus};
pub use validation::{AlwaysAccept, BlockValidator, SignatureQuorum, ValidationStrategy};
pub use pipeline::{ValidationPipeline, ValidationResponse};
pub use state_machine::{ConsensusState, ConsensusStateMachine, ConsensusStep};
pub use metrics::ConsensusMetrics;
pub use engine::{ConsensusEngine, EngineStatus};
