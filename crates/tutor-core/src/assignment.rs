//! Assignments: units of training work and their lease-based lifecycle
//!
//! ```text
//! Pending --claim--> Running --complete--> Succeeded
//!                       |
//!                       +--fail / lease expiry / cancel--> Failed
//! ```
//!
//! Terminal assignments are kept forever for diagnostics.

use serde::{Deserialize, Serialize};

use crate::episode::ChunkWatermark;
use crate::{Result, TutorError};

/// Assignment lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    /// Waiting for a learner
    Pending,
    /// Claimed by a learner holding a lease
    Running,
    /// Finished with a model
    Succeeded,
    /// Finished without a model
    Failed,
}

impl AssignmentStatus {
    /// Terminal statuses never change again
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Why an assignment failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// The learner reported a failure
    Reported(String),
    /// No progress arrived before the lease ran out
    LeaseExpired,
    /// An operator cancelled the work
    Cancelled,
    /// The session ended while the work was outstanding
    SessionEnded,
}

/// Time-bounded claim held by one learner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Learner holding the claim
    pub worker_id: String,
    /// Claim time
    pub claimed_micros: u64,
    /// Instant after which the claim is void
    pub expires_micros: u64,
}

/// Most recent progress report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingProgress {
    /// Fraction of the planned training done, in `0.0..=1.0`
    pub fraction: f64,
    /// Timestamp of the most recent demonstration trained on
    pub most_recent_demo_micros: u64,
    /// Time of the report
    pub updated_micros: u64,
}

/// A unit of training work for one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    /// Assignment identifier
    pub assignment_id: String,
    /// Lifecycle status
    pub status: AssignmentStatus,
    /// Creation time
    pub created_micros: u64,
    /// Demonstration steps the assignment was created for
    pub demo_steps: u64,
    /// Session demo timestamp when the assignment was created
    pub demo_watermark_micros: u64,
    /// Last chunk committed when the assignment was created
    pub chunk_watermark: Option<ChunkWatermark>,
    /// Active claim
    pub lease: Option<Lease>,
    /// Latest accepted progress
    pub progress: TrainingProgress,
    /// Models recorded while running, oldest first
    pub model_ids: Vec<String>,
    /// Final model on success
    pub result_model_id: Option<String>,
    /// Failure cause
    pub failure: Option<FailureReason>,
    /// Time of the terminal transition
    pub finished_micros: Option<u64>,
}

impl Assignment {
    /// Create a pending assignment
    pub fn new(
        assignment_id: impl Into<String>,
        demo_steps: u64,
        demo_watermark_micros: u64,
        chunk_watermark: Option<ChunkWatermark>,
        now_micros: u64,
    ) -> Self {
        Self {
            assignment_id: assignment_id.into(),
            status: AssignmentStatus::Pending,
            created_micros: now_micros,
            demo_steps,
            demo_watermark_micros,
            chunk_watermark,
            lease: None,
            progress: TrainingProgress::default(),
            model_ids: Vec::new(),
            result_model_id: None,
            failure: None,
            finished_micros: None,
        }
    }

    /// Whether the assignment is still outstanding
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether a running lease has run out
    #[must_use]
    pub fn is_lease_expired(&self, now_micros: u64) -> bool {
        self.status == AssignmentStatus::Running
            && self
                .lease
                .as_ref()
                .map_or(true, |lease| now_micros > lease.expires_micros)
    }

    /// Pending to Running under a fresh lease
    pub fn claim(&mut self, worker_id: &str, now_micros: u64, lease_micros: u64) -> Result<()> {
        if self.status != AssignmentStatus::Pending {
            return Err(TutorError::InvalidState(format!(
                "assignment {} is {:?}, not pending",
                self.assignment_id, self.status
            )));
        }
        self.status = AssignmentStatus::Running;
        self.lease = Some(Lease {
            worker_id: worker_id.to_string(),
            claimed_micros: now_micros,
            expires_micros: now_micros.saturating_add(lease_micros),
        });
        self.progress.updated_micros = now_micros;
        Ok(())
    }

    /// Verify that `worker_id` still holds a live lease
    ///
    /// Anything that means the worker lost the work, including a lease
    /// that has lapsed but not yet been reclaimed, is `LeaseExpired`.
    pub fn check_lease(&self, worker_id: &str, now_micros: u64) -> Result<()> {
        match self.status {
            AssignmentStatus::Running => {}
            AssignmentStatus::Failed => {
                return Err(TutorError::LeaseExpired(self.assignment_id.clone()))
            }
            status => {
                return Err(TutorError::InvalidState(format!(
                    "assignment {} is {status:?}, not running",
                    self.assignment_id
                )))
            }
        }
        match &self.lease {
            Some(lease) if lease.worker_id == worker_id && now_micros <= lease.expires_micros => {
                Ok(())
            }
            _ => Err(TutorError::LeaseExpired(self.assignment_id.clone())),
        }
    }

    /// Accept a progress report and extend the lease
    pub fn apply_progress(
        &mut self,
        worker_id: &str,
        fraction: f64,
        most_recent_demo_micros: u64,
        now_micros: u64,
        lease_micros: u64,
    ) -> Result<()> {
        self.check_lease(worker_id, now_micros)?;
        if !(0.0..=1.0).contains(&fraction) {
            return Err(TutorError::InvalidArgument(format!(
                "training progress {fraction} is outside 0..=1"
            )));
        }
        if fraction < self.progress.fraction {
            return Err(TutorError::ProgressRegression {
                field: "training_progress",
                previous: self.progress.fraction.to_string(),
                reported: fraction.to_string(),
            });
        }
        if most_recent_demo_micros < self.progress.most_recent_demo_micros {
            return Err(TutorError::ProgressRegression {
                field: "most_recent_demo_time_micros",
                previous: self.progress.most_recent_demo_micros.to_string(),
                reported: most_recent_demo_micros.to_string(),
            });
        }

        self.progress = TrainingProgress {
            fraction,
            most_recent_demo_micros,
            updated_micros: now_micros,
        };
        if let Some(lease) = self.lease.as_mut() {
            lease.expires_micros = now_micros.saturating_add(lease_micros);
        }
        Ok(())
    }

    /// Running to Succeeded with the final model
    pub fn succeed(&mut self, model_id: &str, now_micros: u64) -> Result<()> {
        if self.status != AssignmentStatus::Running {
            return Err(TutorError::InvalidState(format!(
                "assignment {} is {:?}, not running",
                self.assignment_id, self.status
            )));
        }
        self.status = AssignmentStatus::Succeeded;
        self.result_model_id = Some(model_id.to_string());
        self.finished_micros = Some(now_micros);
        Ok(())
    }

    /// Any non-terminal status to Failed
    pub fn fail(&mut self, reason: FailureReason, now_micros: u64) -> Result<()> {
        if self.is_terminal() {
            return Err(TutorError::InvalidState(format!(
                "assignment {} already finished as {:?}",
                self.assignment_id, self.status
            )));
        }
        self.status = AssignmentStatus::Failed;
        self.failure = Some(reason);
        self.finished_micros = Some(now_micros);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: u64 = 1_000;

    fn running() -> Assignment {
        let mut assignment = Assignment::new("a", 3, 10, None, 0);
        assignment.claim("w1", 0, LEASE).unwrap();
        assignment
    }

    #[test]
    fn test_claim_only_from_pending() {
        let mut assignment = running();
        assert_eq!(assignment.status, AssignmentStatus::Running);
        assert!(matches!(
            assignment.claim("w2", 1, LEASE),
            Err(TutorError::InvalidState(_))
        ));
    }

    #[test]
    fn test_progress_extends_lease() {
        let mut assignment = running();
        assignment.apply_progress("w1", 0.5, 10, 900, LEASE).unwrap();
        assert!(!assignment.is_lease_expired(1_500));
        assert!(assignment.is_lease_expired(1_901));
    }

    #[test]
    fn test_progress_regression_is_rejected() {
        let mut assignment = running();
        assignment.apply_progress("w1", 0.5, 10, 1, LEASE).unwrap();

        let err = assignment.apply_progress("w1", 0.4, 10, 2, LEASE).unwrap_err();
        assert!(matches!(err, TutorError::ProgressRegression { field: "training_progress", .. }));

        let err = assignment.apply_progress("w1", 0.6, 9, 3, LEASE).unwrap_err();
        assert!(matches!(err, TutorError::ProgressRegression { .. }));
        assert!((assignment.progress.fraction - 0.5).abs() < f64::EPSILON);

        assert!(matches!(
            assignment.apply_progress("w1", 1.5, 10, 4, LEASE),
            Err(TutorError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_lost_lease() {
        let mut assignment = running();
        assert!(matches!(
            assignment.check_lease("w2", 1),
            Err(TutorError::LeaseExpired(_))
        ));
        assert!(matches!(
            assignment.check_lease("w1", LEASE + 1),
            Err(TutorError::LeaseExpired(_))
        ));

        assignment.fail(FailureReason::LeaseExpired, LEASE + 1).unwrap();
        assert!(matches!(
            assignment.check_lease("w1", 0),
            Err(TutorError::LeaseExpired(_))
        ));
        assert!(assignment.fail(FailureReason::Cancelled, LEASE + 2).is_err());
    }

    #[test]
    fn test_succeed_requires_running() {
        let mut pending = Assignment::new("a", 1, 0, None, 0);
        assert!(pending.succeed("m", 1).is_err());

        let mut assignment = running();
        assignment.succeed("m", 5).unwrap();
        assert_eq!(assignment.result_model_id.as_deref(), Some("m"));
        assert!(assignment.is_terminal());
    }
}
