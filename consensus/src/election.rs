use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tidechain_common::EngineResult;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::registry::{ElectionOutcome, ValidatorRegistry};

/// Recomputes the active validator set once per epoch
pub struct ElectionScheduler {
    registry: Arc<ValidatorRegistry>,
    /// Size of the active set to elect
    seats: usize,
    epoch_length: Duration,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ElectionScheduler {
    pub fn new(registry: Arc<ValidatorRegistry>, seats: usize, epoch_length: Duration) -> Self {
        Self {
            registry,
            seats,
            epoch_length,
            shutdown_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Run a single election now
    pub fn run_once(&self) -> EngineResult<ElectionOutcome> {
        run_election(&self.registry, self.seats)
    }

    /// Spawn the periodic election task. The first election fires one epoch
    /// from now. Starting a running scheduler is a no-op.
    pub fn start(&self) {
        let mut shutdown_slot = self.shutdown_tx.lock();
        if shutdown_slot.is_some() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let registry = Arc::clone(&self.registry);
        let seats = self.seats;
        let epoch_length = self.epoch_length;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + epoch_length, epoch_length);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        // Failures keep the previous active set; the next tick retries
                        if let Err(e) = run_election(&registry, seats) {
                            tracing::warn!(error = %e, "Election failed, keeping previous active set");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Shutting down election scheduler");
                        break;
                    }
                }
            }
        });

        *shutdown_slot = Some(shutdown_tx);
        drop(shutdown_slot);
        *self.task.lock() = Some(handle);

        tracing::info!(epoch_secs = epoch_length.as_secs(), seats, "Election scheduler started");
    }

    /// Stop the timer and wait for the task to exit
    pub async fn stop(&self) {
        let shutdown_tx = self.shutdown_tx.lock().take();
        if let Some(shutdown_tx) = shutdown_tx {
            let _ = shutdown_tx.send(()).await;
        }

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Election task ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.lock().is_some()
    }
}

fn run_election(registry: &ValidatorRegistry, seats: usize) -> EngineResult<ElectionOutcome> {
    let outcome = registry.elect(seats)?;
    if outcome.changed {
        tracing::info!(
            election = outcome.election_number,
            active = ?outcome.active,
            size = outcome.active.len(),
            candidates = outcome.candidates,
            "Active validator set changed"
        );
    } else {
        tracing::debug!(election = outcome.election_number, size = outcome.active.len(), "Active validator set unchanged");
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidechain_common::NodeId;

    fn registry(names: &[&str]) -> Arc<ValidatorRegistry> {
        let registry = Arc::new(ValidatorRegistry::new(Duration::from_secs(2)));
        for name in names {
            registry.register_delegate(NodeId::new(name));
        }
        registry
    }

    #[test]
    fn test_run_once() {
        let registry = registry(&["a", "b", "c", "d"]);
        registry.vote_for_delegate(&NodeId::new("v"), &NodeId::new("d"), 9).unwrap();

        let scheduler = ElectionScheduler::new(Arc::clone(&registry), 2, Duration::from_secs(100));
        let outcome = scheduler.run_once().unwrap();
        assert_eq!(outcome.active, vec![NodeId::new("d"), NodeId::new("a")]);
        assert!(outcome.changed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_elections() {
        let registry = registry(&["a", "b", "c"]);
        let scheduler = ElectionScheduler::new(Arc::clone(&registry), 2, Duration::from_secs(100));
        scheduler.start();
        assert!(scheduler.is_running());

        // Nothing before the first epoch boundary
        tokio::time::sleep(Duration::from_secs(50)).await;
        assert_eq!(registry.elections_held(), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(registry.elections_held(), 1);
        assert_eq!(registry.get_active_validators(), vec![NodeId::new("a"), NodeId::new("b")]);

        registry.vote_for_delegate(&NodeId::new("v"), &NodeId::new("c"), 1).unwrap();
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(registry.elections_held(), 2);
        assert_eq!(registry.get_active_validators(), vec![NodeId::new("c"), NodeId::new("a")]);

        scheduler.stop().await;
        assert!(!scheduler.is_running());

        tokio::time::sleep(Duration::from_secs(500)).await;
        assert_eq!(registry.elections_held(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_election_is_retried() {
        let registry = registry(&[]);
        let scheduler = ElectionScheduler::new(Arc::clone(&registry), 3, Duration::from_secs(10));
        scheduler.start();

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(registry.elections_held(), 0);

        registry.register_delegate(NodeId::new("late"));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(registry.elections_held(), 1);
        assert_eq!(registry.get_active_validators(), vec![NodeId::new("late")]);

        scheduler.stop().await;
    }
}
