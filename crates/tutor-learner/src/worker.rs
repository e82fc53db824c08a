//! The learner worker loop

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tutor_core::{ModelArtifact, ResourceKey, Result, TrainingStats, TutorError};
use tutor_service::{ClaimedAssignment, LearnerApi};

use crate::trainer::{Trainer, TrainingContext};

/// Worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Identity presented when claiming; must be unique among live workers
    pub worker_id: String,
    /// Pause after a poll that found no work or failed
    pub idle_backoff_ms: u64,
}

impl WorkerConfig {
    /// Settings for a named worker
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            idle_backoff_ms: 500,
        }
    }
}

/// What one pass of the worker did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    /// No pending work
    Idle,
    /// Training finished and the final model was recorded
    Completed {
        /// The finished assignment
        assignment: ResourceKey,
        /// The final model
        model_id: String,
    },
    /// The trainer failed and the failure was reported
    Failed {
        /// The failed assignment
        assignment: ResourceKey,
        /// Reported reason
        reason: String,
    },
    /// The lease was lost; in-flight work was discarded
    Abandoned {
        /// The assignment that was taken away
        assignment: ResourceKey,
    },
}

/// Counters over the lifetime of [`LearnerWorker::run`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    /// Assignments completed
    pub completed: usize,
    /// Assignments reported as failed
    pub failed: usize,
    /// Assignments abandoned after losing the lease
    pub abandoned: usize,
    /// Polls that ended in an error
    pub errors: usize,
}

/// Polls for assignments and trains them
pub struct LearnerWorker<A: ?Sized, T> {
    api: Arc<A>,
    trainer: T,
    config: WorkerConfig,
}

impl<A, T> LearnerWorker<A, T>
where
    A: LearnerApi + ?Sized,
    T: Trainer,
{
    /// Create a worker
    pub fn new(api: Arc<A>, trainer: T, config: WorkerConfig) -> Self {
        Self {
            api,
            trainer,
            config,
        }
    }

    /// Worker identity
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Claim and work through at most one assignment
    pub async fn run_once(&mut self) -> Result<WorkOutcome> {
        let Some(claimed) = self.api.claim_assignment(&self.config.worker_id).await? else {
            return Ok(WorkOutcome::Idle);
        };
        let key = claimed.key.clone();
        info!("Worker {} training {key}", self.config.worker_id);

        match self.train(claimed).await {
            Ok(model_id) => Ok(WorkOutcome::Completed {
                assignment: key,
                model_id,
            }),
            Err(TutorError::LeaseExpired(_)) => {
                warn!("Lost lease on {key}, discarding work");
                self.trainer.reset();
                Ok(WorkOutcome::Abandoned { assignment: key })
            }
            Err(e) => {
                self.trainer.reset();
                let reason = e.to_string();
                match self
                    .api
                    .fail(&key, &self.config.worker_id, &reason)
                    .await
                {
                    Ok(()) => {
                        warn!("Reported failure of {key}: {reason}");
                        Ok(WorkOutcome::Failed {
                            assignment: key,
                            reason,
                        })
                    }
                    Err(TutorError::LeaseExpired(_)) => {
                        Ok(WorkOutcome::Abandoned { assignment: key })
                    }
                    Err(report_error) => Err(report_error),
                }
            }
        }
    }

    async fn train(&mut self, claimed: ClaimedAssignment) -> Result<String> {
        let key = claimed.key;
        let worker_id = self.config.worker_id.as_str();
        let chunks = self.api.training_data(&key).await?;
        self.trainer
            .begin(TrainingContext {
                assignment: claimed.assignment,
                brain_spec: claimed.brain_spec,
                chunks,
            })
            .await?;

        loop {
            let update = self.trainer.train_increment().await?;
            self.api
                .report_progress(&key, worker_id, update.fraction, update.most_recent_demo_micros)
                .await?;

            if update.done {
                let (artifact, stats) = update
                    .checkpoint
                    .map(|c| (c.artifact, c.stats))
                    .unwrap_or_else(|| (ModelArtifact::default(), TrainingStats::default()));
                let model_id = self.api.complete(&key, worker_id, artifact, stats).await?;
                self.trainer.reset();
                return Ok(model_id);
            }
            if let Some(checkpoint) = update.checkpoint {
                self.api
                    .record_checkpoint(&key, worker_id, checkpoint.artifact, checkpoint.stats)
                    .await?;
            }
        }
    }

    /// Work until `shutdown` flips to true
    ///
    /// Errors from a pass are logged and followed by a backoff; a lost
    /// lease just moves on to the next poll.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> WorkerStats {
        let backoff = Duration::from_millis(self.config.idle_backoff_ms);
        let mut stats = WorkerStats::default();
        info!("Worker {} started", self.config.worker_id);

        while !*shutdown.borrow() {
            let pause = match self.run_once().await {
                Ok(WorkOutcome::Idle) => true,
                Ok(WorkOutcome::Completed { .. }) => {
                    stats.completed += 1;
                    false
                }
                Ok(WorkOutcome::Failed { .. }) => {
                    stats.failed += 1;
                    false
                }
                Ok(WorkOutcome::Abandoned { .. }) => {
                    stats.abandoned += 1;
                    false
                }
                Err(e) => {
                    error!("Worker {} pass failed: {e}", self.config.worker_id);
                    stats.errors += 1;
                    true
                }
            };

            if pause {
                tokio::select! {
                    () = tokio::time::sleep(backoff) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        info!("Worker {} stopped: {stats:?}", self.config.worker_id);
        stats
    }
}
