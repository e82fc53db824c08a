//! The contract learner workers program against
//!
//! Workers only ever see this trait, so a worker can run in-process
//! against a [`crate::Coordinator`] or behind whatever transport wraps it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tutor_core::{Assignment, EpisodeChunk, ModelArtifact, ResourceKey, Result, TrainingStats};

/// A claimed assignment and what the learner needs to start on it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimedAssignment {
    /// Assignment key; every later call names it
    pub key: ResourceKey,
    /// The assignment as claimed
    pub assignment: Assignment,
    /// Observation/action spec of the brain being trained
    pub brain_spec: serde_json::Value,
}

/// Operations available to a learner worker
///
/// Any call may fail with `LeaseExpired`; the worker must then discard
/// its in-flight work and poll again.
#[async_trait]
pub trait LearnerApi: Send + Sync {
    /// Claim pending work, waiting a bounded time; `None` if there is none
    async fn claim_assignment(&self, worker_id: &str) -> Result<Option<ClaimedAssignment>>;

    /// Chunks the assignment was created to train on
    async fn training_data(&self, assignment_key: &ResourceKey) -> Result<Vec<EpisodeChunk>>;

    /// Report monotonic progress and extend the lease
    async fn report_progress(
        &self,
        assignment_key: &ResourceKey,
        worker_id: &str,
        fraction: f64,
        most_recent_demo_micros: u64,
    ) -> Result<()>;

    /// Store an intermediate model; returns its id
    async fn record_checkpoint(
        &self,
        assignment_key: &ResourceKey,
        worker_id: &str,
        artifact: ModelArtifact,
        stats: TrainingStats,
    ) -> Result<String>;

    /// Store the final model and finish the assignment; returns the model id
    async fn complete(
        &self,
        assignment_key: &ResourceKey,
        worker_id: &str,
        artifact: ModelArtifact,
        stats: TrainingStats,
    ) -> Result<String>;

    /// Give up on the assignment
    async fn fail(&self, assignment_key: &ResourceKey, worker_id: &str, reason: &str)
        -> Result<()>;
}
