use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tidechain_common::{Block, EngineError, EngineResult, NodeId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::metrics::ConsensusMetrics;
use crate::registry::ValidatorRegistry;
use crate::validation::BlockValidator;

/// A block waiting for validation together with its single-use reply channel
pub struct ValidationRequest {
    pub id: Uuid,
    pub block: Block,
    reply: oneshot::Sender<EngineResult<ValidationResponse>>,
}

/// Verdict for one validation request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationResponse {
    pub request_id: Uuid,
    pub is_valid: bool,
    /// Primary that answered the request; `None` when no validator is active
    pub validator_id: Option<NodeId>,
    /// Hex attestation over the block digest, empty for rejected blocks
    pub signature: String,
    pub error_message: Option<String>,
}

impl ValidationResponse {
    /// `Ok(true)` for an accepted block, `ValidationFailed` with the
    /// rejection reason otherwise
    pub fn into_verdict(self) -> EngineResult<bool> {
        if self.is_valid {
            Ok(true)
        } else {
            Err(EngineError::ValidationFailed(
                self.error_message.unwrap_or_else(|| "block rejected".to_string()),
            ))
        }
    }
}

/// State shared with the worker task
struct Worker {
    registry: Arc<ValidatorRegistry>,
    validator: Arc<dyn BlockValidator>,
    metrics: Arc<RwLock<ConsensusMetrics>>,
}

impl Worker {
    async fn run(
        self,
        mut requests: mpsc::Receiver<ValidationRequest>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        tracing::info!(strategy = self.validator.name(), "Validation worker started");

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown_rx => {
                    break;
                }
                request = requests.recv() => {
                    match request {
                        Some(request) => self.process(request).await,
                        None => break,
                    }
                }
            }
        }

        // Refuse new submissions, then answer everything already queued
        requests.close();
        let mut drained = 0usize;
        while let Some(request) = requests.recv().await {
            let _ = request.reply.send(Err(EngineError::EngineStopped));
            drained += 1;
        }

        tracing::info!(drained, "Validation worker stopped");
    }

    async fn process(&self, request: ValidationRequest) {
        let started = Instant::now();
        let active = self.registry.get_active_validators();
        let primary = self.registry.rotate_primary_if_due(Utc::now());

        let verdict = self.validator.validate(&request.block, &active).await;
        let elapsed = started.elapsed();
        let is_valid = verdict.is_ok();

        if let Some(primary) = &primary {
            if let Err(e) = self.registry.record_validation(primary, is_valid, elapsed) {
                tracing::warn!(validator = %primary, error = %e, "Failed to record validation");
            }
        }
        self.metrics.write().record_validation(is_valid, elapsed);

        let response = match verdict {
            Ok(()) => {
                tracing::debug!(request = %request.id, block = %request.block, "Block accepted");
                ValidationResponse {
                    request_id: request.id,
                    is_valid: true,
                    signature: attest(&request.block, primary.as_ref()),
                    validator_id: primary,
                    error_message: None,
                }
            }
            Err(e) => {
                tracing::info!(request = %request.id, block = %request.block, reason = %e, "Block rejected");
                let reason = match e {
                    EngineError::ValidationFailed(reason) => reason,
                    other => other.to_string(),
                };
                ValidationResponse {
                    request_id: request.id,
                    is_valid: false,
                    validator_id: primary,
                    signature: String::new(),
                    error_message: Some(reason),
                }
            }
        };

        if request.reply.send(Ok(response)).is_err() {
            tracing::debug!(request = %request.id, "Validation caller went away before the reply");
        }
    }
}

/// Hex SHA-256 over the block digest and the attesting validator
fn attest(block: &Block, validator: Option<&NodeId>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(block.digest().as_bytes());
    if let Some(validator) = validator {
        hasher.update(validator.as_str().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Bounded FIFO queue of validation requests served by a single worker.
///
/// Every accepted request gets exactly one reply. Once stopped, queued
/// requests are answered with `EngineStopped` and new submissions fail with
/// `EngineStopped` without waiting.
pub struct ValidationPipeline {
    registry: Arc<ValidatorRegistry>,
    validator: Arc<dyn BlockValidator>,
    metrics: Arc<RwLock<ConsensusMetrics>>,
    capacity: usize,
    sender: RwLock<Option<mpsc::Sender<ValidationRequest>>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ValidationPipeline {
    pub fn new(
        registry: Arc<ValidatorRegistry>,
        validator: Arc<dyn BlockValidator>,
        metrics: Arc<RwLock<ConsensusMetrics>>,
        capacity: usize,
    ) -> Self {
        Self {
            registry,
            validator,
            metrics,
            capacity: capacity.max(1),
            sender: RwLock::new(None),
            shutdown_tx: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the worker task. Starting a running pipeline is a no-op.
    pub fn start(&self) {
        let mut sender = self.sender.write();
        if sender.is_some() {
            return;
        }

        let (request_tx, request_rx) = mpsc::channel(self.capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let worker = Worker {
            registry: Arc::clone(&self.registry),
            validator: Arc::clone(&self.validator),
            metrics: Arc::clone(&self.metrics),
        };
        let handle = tokio::spawn(worker.run(request_rx, shutdown_rx));

        *sender = Some(request_tx);
        *self.shutdown_tx.lock() = Some(shutdown_tx);
        *self.worker.lock() = Some(handle);
    }

    /// Close the queue, answer queued requests with `EngineStopped` and wait
    /// for the worker to exit
    pub async fn stop(&self) -> EngineResult<()> {
        self.sender.write().take();

        let shutdown_tx = self.shutdown_tx.lock().take();
        if let Some(shutdown_tx) = shutdown_tx {
            let _ = shutdown_tx.send(());
        }

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| EngineError::Internal(format!("validation worker failed: {}", e)))?;
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.sender.read().is_some()
    }

    /// Enqueue `block` and wait for the worker's verdict.
    ///
    /// A rejected block is still `Ok`, with `is_valid == false`; `Err` means
    /// the request was never judged.
    pub async fn validate_block(&self, block: Block) -> EngineResult<ValidationResponse> {
        let sender = self.sender.read().clone().ok_or(EngineError::EngineStopped)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = ValidationRequest {
            id: Uuid::new_v4(),
            block,
            reply: reply_tx,
        };

        sender.send(request).await.map_err(|_| EngineError::EngineStopped)?;
        drop(sender);

        reply_rx.await.map_err(|_| EngineError::EngineStopped)?
    }
}
