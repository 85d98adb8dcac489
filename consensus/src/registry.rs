use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::time::Duration;
use tidechain_common::{engine_bail, EngineError, EngineResult, NodeId};

/// Performance counters tracked per delegate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DelegatePerformance {
    /// Blocks this delegate produced
    pub blocks_produced: u64,

    /// Blocks this delegate was expected to produce but did not
    pub blocks_missed: u64,

    /// Running average of validation response time in milliseconds
    pub avg_response_time_ms: u64,

    /// Last heartbeat received from the delegate
    pub last_heartbeat: DateTime<Utc>,

    /// Validations answered with an accepting verdict
    pub successful_validations: u64,

    /// Validations answered with a rejecting verdict
    pub failed_validations: u64,
}

impl DelegatePerformance {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            blocks_produced: 0,
            blocks_missed: 0,
            avg_response_time_ms: 0,
            last_heartbeat: now,
            successful_validations: 0,
            failed_validations: 0,
        }
    }
}

/// A registered node eligible for election. Delegates are never removed,
/// only marked inactive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delegate {
    pub node_id: NodeId,

    /// Accumulated vote weight; never decreases
    pub vote_count: u64,

    /// Member of the current active set
    pub is_active: bool,

    /// Position in registration order, used to break election ties
    pub registration_order: u64,

    pub registered_at: DateTime<Utc>,

    pub performance: DelegatePerformance,
}

/// The elected validators, the primary answering validation requests and
/// the time the primary rotates next
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidatorSet {
    pub validators: Vec<NodeId>,
    pub current_validator: usize,
    pub next_rotation: DateTime<Utc>,
}

impl ValidatorSet {
    fn empty(now: DateTime<Utc>) -> Self {
        Self {
            validators: Vec::new(),
            current_validator: 0,
            next_rotation: now,
        }
    }

    pub fn primary(&self) -> Option<&NodeId> {
        self.validators.get(self.current_validator)
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.validators.contains(node_id)
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }
}

/// Result of one election recomputation
#[derive(Debug, Clone, PartialEq)]
pub struct ElectionOutcome {
    /// Newly elected active set, ranked
    pub active: Vec<NodeId>,

    /// Whether the active set differs from the previous one
    pub changed: bool,

    /// Delegates considered by the election
    pub candidates: usize,

    /// Sequence number of this election, starting at 1
    pub election_number: u64,
}

struct RegistryState {
    /// Delegates in registration order
    delegates: Vec<Delegate>,
    index: HashMap<NodeId, usize>,
    validator_set: ValidatorSet,
    elections_held: u64,

    /// Seat count of the last election; `None` until one has run
    seats: Option<usize>,
}

impl RegistryState {
    fn delegate(&self, node_id: &NodeId) -> Option<&Delegate> {
        self.index.get(node_id).map(|&i| &self.delegates[i])
    }

    fn delegate_mut(&mut self, node_id: &NodeId) -> Option<&mut Delegate> {
        match self.index.get(node_id) {
            Some(&i) => self.delegates.get_mut(i),
            None => None,
        }
    }
}

/// Rank delegates by vote count descending, ties broken by registration
/// order, and return the indices of the top `seats`
pub fn rank_delegates(delegates: &[Delegate], seats: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..delegates.len()).collect();
    order.sort_by_key(|&i| (Reverse(delegates[i].vote_count), delegates[i].registration_order));
    order.truncate(seats);
    order
}

/// Delegate directory, vote tallies and active validator set.
///
/// All state sits behind a single lock owned by the registry. Readers see
/// either the complete pre-election or the complete post-election set.
pub struct ValidatorRegistry {
    state: RwLock<RegistryState>,

    /// How long a primary serves before rotating to the next active validator
    rotation_interval: Duration,
}

impl ValidatorRegistry {
    /// Create an empty registry
    pub fn new(rotation_interval: Duration) -> Self {
        let now = Utc::now();
        Self {
            state: RwLock::new(RegistryState {
                delegates: Vec::new(),
                index: HashMap::new(),
                validator_set: ValidatorSet::empty(now),
                elections_held: 0,
                seats: None,
            }),
            rotation_interval,
        }
    }

    /// Register a delegate with zero votes. Returns `false` if the node was
    /// already registered, in which case nothing changes.
    pub fn register_delegate(&self, node_id: NodeId) -> bool {
        let mut state = self.state.write();
        if state.index.contains_key(&node_id) {
            return false;
        }

        let now = Utc::now();
        let order = state.delegates.len();
        state.delegates.push(Delegate {
            node_id: node_id.clone(),
            vote_count: 0,
            is_active: false,
            registration_order: order as u64,
            registered_at: now,
            performance: DelegatePerformance::new(now),
        });
        state.index.insert(node_id.clone(), order);

        // A newcomer with zero votes ranks last, so it only takes a spare seat
        let spare_seat = state.seats.is_some_and(|seats| state.validator_set.len() < seats);
        if spare_seat {
            state.delegates[order].is_active = true;
            state.validator_set.validators.push(node_id.clone());
            tracing::info!(delegate = %node_id, "Delegate filled a spare seat");
        }

        tracing::debug!(delegate = %node_id, order, active = spare_seat, "Delegate registered");
        true
    }

    /// Add `weight` to a delegate's tally and return the new tally
    pub fn vote_for_delegate(&self, voter_id: &NodeId, delegate_id: &NodeId, weight: u64) -> EngineResult<u64> {
        let mut state = self.state.write();
        let Some(delegate) = state.delegate_mut(delegate_id) else {
            engine_bail!(EngineError::DelegateNotFound(delegate_id.clone()), "vote_for_delegate");
        };

        delegate.vote_count = delegate.vote_count.saturating_add(weight);
        let tally = delegate.vote_count;

        tracing::debug!(voter = %voter_id, delegate = %delegate_id, weight, tally, "Vote recorded");
        Ok(tally)
    }

    /// Snapshot of the active validator ids, in election rank
    pub fn get_active_validators(&self) -> Vec<NodeId> {
        self.state.read().validator_set.validators.clone()
    }

    /// Snapshot of the full validator set including primary bookkeeping
    pub fn validator_set(&self) -> ValidatorSet {
        self.state.read().validator_set.clone()
    }

    pub fn get_delegate_performance(&self, delegate_id: &NodeId) -> EngineResult<DelegatePerformance> {
        self.state
            .read()
            .delegate(delegate_id)
            .map(|d| d.performance.clone())
            .ok_or_else(|| EngineError::DelegateNotFound(delegate_id.clone()))
    }

    pub fn get_delegate(&self, delegate_id: &NodeId) -> Option<Delegate> {
        self.state.read().delegate(delegate_id).cloned()
    }

    /// All delegates in registration order
    pub fn delegates(&self) -> Vec<Delegate> {
        self.state.read().delegates.clone()
    }

    pub fn delegate_count(&self) -> usize {
        self.state.read().delegates.len()
    }

    pub fn vote_count(&self, delegate_id: &NodeId) -> EngineResult<u64> {
        self.state
            .read()
            .delegate(delegate_id)
            .map(|d| d.vote_count)
            .ok_or_else(|| EngineError::DelegateNotFound(delegate_id.clone()))
    }

    pub fn elections_held(&self) -> u64 {
        self.state.read().elections_held
    }

    /// Recompute the active set: the top `seats` delegates by vote count,
    /// ties to the earliest registration. Everything happens under one write
    /// lock so concurrent readers and voters never see a partial result.
    pub fn elect(&self, seats: usize) -> EngineResult<ElectionOutcome> {
        let mut state = self.state.write();
        if state.delegates.is_empty() {
            return Err(EngineError::Internal("no delegates registered".to_string()));
        }

        let ranked = rank_delegates(&state.delegates, seats);
        let mut elected = vec![false; state.delegates.len()];
        for &i in &ranked {
            elected[i] = true;
        }
        for (delegate, is_elected) in state.delegates.iter_mut().zip(elected) {
            delegate.is_active = is_elected;
        }

        let active: Vec<NodeId> = ranked.iter().map(|&i| state.delegates[i].node_id.clone()).collect();
        let changed = active != state.validator_set.validators;

        // Keep the current primary serving if it survived the election
        let previous_primary = state.validator_set.primary().cloned();
        let current_validator = previous_primary
            .and_then(|primary| active.iter().position(|id| *id == primary))
            .unwrap_or(0);

        // The first primary serves a full interval before rotating
        if state.validator_set.is_empty() {
            state.validator_set.next_rotation = Utc::now() + self.rotation_step();
        }
        state.validator_set.validators = active.clone();
        state.validator_set.current_validator = current_validator;
        state.elections_held += 1;
        state.seats = Some(seats);

        Ok(ElectionOutcome {
            active,
            changed,
            candidates: state.delegates.len(),
            election_number: state.elections_held,
        })
    }

    /// Advance the primary round-robin if its rotation time has passed.
    /// Returns the primary serving at `now`.
    pub fn rotate_primary_if_due(&self, now: DateTime<Utc>) -> Option<NodeId> {
        let mut state = self.state.write();
        let set = &mut state.validator_set;
        if set.validators.is_empty() {
            return None;
        }

        if now >= set.next_rotation {
            set.current_validator = (set.current_validator + 1) % set.validators.len();
            set.next_rotation = now + self.rotation_step();
        }
        set.primary().cloned()
    }

    fn rotation_step(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.rotation_interval).unwrap_or_else(|_| chrono::Duration::zero())
    }

    pub fn current_primary(&self) -> Option<NodeId> {
        self.state.read().validator_set.primary().cloned()
    }

    /// Record a validation verdict answered by `delegate_id`
    pub fn record_validation(&self, delegate_id: &NodeId, success: bool, elapsed: Duration) -> EngineResult<()> {
        let mut state = self.state.write();
        let delegate = state
            .delegate_mut(delegate_id)
            .ok_or_else(|| EngineError::DelegateNotFound(delegate_id.clone()))?;

        let perf = &mut delegate.performance;
        if success {
            perf.successful_validations += 1;
        } else {
            perf.failed_validations += 1;
        }

        let answered = perf.successful_validations + perf.failed_validations;
        let elapsed_ms = elapsed.as_millis() as u64;
        perf.avg_response_time_ms = (perf.avg_response_time_ms * (answered - 1) + elapsed_ms) / answered;
        Ok(())
    }

    pub fn record_block_produced(&self, delegate_id: &NodeId) -> EngineResult<()> {
        let mut state = self.state.write();
        let delegate = state
            .delegate_mut(delegate_id)
            .ok_or_else(|| EngineError::DelegateNotFound(delegate_id.clone()))?;
        delegate.performance.blocks_produced += 1;
        Ok(())
    }

    pub fn record_block_missed(&self, delegate_id: &NodeId) -> EngineResult<()> {
        let mut state = self.state.write();
        let delegate = state
            .delegate_mut(delegate_id)
            .ok_or_else(|| EngineError::DelegateNotFound(delegate_id.clone()))?;
        delegate.performance.blocks_missed += 1;
        Ok(())
    }

    pub fn record_heartbeat(&self, delegate_id: &NodeId) -> EngineResult<()> {
        let mut state = self.state.write();
        let delegate = state
            .delegate_mut(delegate_id)
            .ok_or_else(|| EngineError::DelegateNotFound(delegate_id.clone()))?;
        delegate.performance.last_heartbeat = Utc::now();
        Ok(())
    }
}
