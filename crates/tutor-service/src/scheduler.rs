//! Assignment scheduling
//!
//! Per session the scheduler runs `NoAssignment -> Pending -> Running ->
//! {Succeeded, Failed}`. Mutual exclusion rests on the session's
//! `active_assignment_id` pointer: an assignment is only created after a
//! compare-and-update has moved that pointer from empty to the new id, and
//! the pointer is only cleared once the assignment it names is terminal.
//!
//! Leases are the only cancellation mechanism the learner sees. A lease
//! that lapses is reclaimed either eagerly, when the holder next talks to
//! the scheduler, or by the periodic [`AssignmentScheduler::tick`].
//!
//! Scans for pending or running assignments skip everything at or below a
//! scan floor: the highest revision below which every assignment was
//! terminal when last seen. Terminal assignments are never written again,
//! so they cannot reappear below the floor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use tutor_core::{
    update, update_if, Assignment, AssignmentStatus, FailureReason, ListFilter, Lister, Model,
    ModelArtifact, ResourceKey, ResourceKind, Result, Revision, Session, StoreExt,
    TrainingStats, TutorError, Versioned,
};

use crate::config::SchedulerConfig;
use crate::context::ServiceContext;
use crate::lineage::{session_of, ModelManager};

/// Outcome of one scheduler pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    /// Running assignments failed for lease expiry
    pub reclaimed: usize,
    /// Pending assignments created for eligible sessions
    pub scheduled: usize,
}

impl TickReport {
    /// Whether the pass changed nothing
    #[must_use]
    pub fn is_quiet(&self) -> bool {
        self.reclaimed == 0 && self.scheduled == 0
    }
}

/// Creates, leases and retires assignments
#[derive(Debug, Clone)]
pub struct AssignmentScheduler {
    ctx: ServiceContext,
    config: SchedulerConfig,
    models: ModelManager,
    scan_floor: Arc<AtomicU64>,
}

impl AssignmentScheduler {
    /// Create a scheduler over the shared context
    pub fn new(ctx: ServiceContext, config: SchedulerConfig, models: ModelManager) -> Self {
        Self {
            ctx,
            config,
            models,
            scan_floor: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Scheduling settings in effect
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Create a pending assignment if the session is eligible
    ///
    /// Safe to call any number of times: at most one caller wins the
    /// session's active pointer, the rest get `None`. With `force` the
    /// demo threshold is skipped, but the session must still train, be
    /// running, have no active assignment and hold some demonstrations.
    pub async fn ensure_pending(
        &self,
        session_key: &ResourceKey,
        force: bool,
    ) -> Result<Option<Versioned<Assignment>>> {
        let now = self.ctx.now();
        let threshold = self.config.training_threshold_demo_steps;
        let assignment_id = ServiceContext::new_id();

        let created = update_if(
            self.ctx.store.as_ref(),
            session_key,
            &self.ctx.retry,
            |session: &mut Session| {
                let eligible = if force {
                    session.session_type.trains()
                        && !session.is_terminal()
                        && session.active_assignment_id.is_none()
                        && session.total_demo_steps > 0
                } else {
                    session.is_training_eligible(threshold)
                };
                if !eligible {
                    return Ok(None);
                }

                session.active_assignment_id = Some(assignment_id.clone());
                session.assignment_count += 1;
                let demo_steps = std::mem::take(&mut session.untrained_demo_steps);
                Ok(Some(Assignment::new(
                    assignment_id.clone(),
                    demo_steps,
                    session.last_demo_data_received_micros,
                    session.last_chunk.clone(),
                    now,
                )))
            },
        )
        .await?;

        let Some((_, assignment)) = created else {
            return Ok(None);
        };
        let key = session_key.assignment(&assignment_id);
        let revision = match self.ctx.store.create_entity(&key, assignment.clone()).await {
            Ok(revision) => revision,
            Err(e) => {
                warn!("Failed to create {key}, releasing {session_key}: {e}");
                self.clear_active(session_key, &assignment_id, assignment.demo_steps)
                    .await?;
                return Err(e);
            }
        };

        // The session may have ended between the pointer write and the create
        let session: Versioned<Session> = self.ctx.store.get_entity(session_key).await?;
        if session.resource.is_terminal() {
            match self.terminate(&key, FailureReason::SessionEnded).await {
                Ok(_) | Err(TutorError::InvalidState(_)) => {}
                Err(e) => return Err(e),
            }
            return Ok(None);
        }

        info!(
            "Scheduled assignment {key} for {} demonstration step(s)",
            assignment.demo_steps
        );
        Ok(Some(Versioned {
            key,
            revision,
            resource: assignment,
        }))
    }

    /// Schedule training regardless of the demo threshold
    pub async fn request_training(
        &self,
        session_key: &ResourceKey,
    ) -> Result<Option<Versioned<Assignment>>> {
        let session: Versioned<Session> = self.ctx.store.get_entity(session_key).await?;
        session.resource.ensure_running()?;
        if !session.resource.session_type.trains() {
            return Err(TutorError::InvalidState(format!(
                "{session_key} is a {:?} session and does not train",
                session.resource.session_type
            )));
        }
        self.ensure_pending(session_key, true).await
    }

    /// Claim one pending assignment, waiting up to `timeout` for one to appear
    ///
    /// Two workers racing for the same assignment both attempt the same
    /// compare-and-update; the loser moves on to the next candidate.
    pub async fn claim_assignment(
        &self,
        worker_id: &str,
        timeout: Duration,
    ) -> Result<Option<Versioned<Assignment>>> {
        tutor_core::key::validate_id(worker_id)?;
        let deadline = Instant::now() + timeout;
        let mut events = self.ctx.store.subscribe();

        loop {
            if let Some(claimed) = self.try_claim(worker_id).await? {
                return Ok(Some(claimed));
            }

            // Sleep until an assignment is written somewhere or time runs out
            loop {
                match tokio::time::timeout_at(deadline, events.recv()).await {
                    Err(_) => return Ok(None),
                    Ok(Ok(event)) if event.key.kind() == ResourceKind::Assignment => break,
                    Ok(Ok(_)) => {}
                    Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                        debug!("Claim wait lagged by {skipped} event(s), rescanning");
                        break;
                    }
                    Ok(Err(broadcast::error::RecvError::Closed)) => return Ok(None),
                }
            }
        }
    }

    /// One pass over the pending assignments
    ///
    /// Pending work of a session that has already ended is failed rather
    /// than handed out.
    async fn try_claim(&self, worker_id: &str) -> Result<Option<Versioned<Assignment>>> {
        let lease_micros = self.config.lease_micros();
        let pending = self
            .scan_active()
            .await?
            .into_iter()
            .filter(|candidate| candidate.resource.status == AssignmentStatus::Pending);

        for candidate in pending {
            let session: Versioned<Session> =
                self.ctx.store.get_entity(&session_of(&candidate.key)?).await?;
            if session.resource.is_terminal() {
                match self.terminate(&candidate.key, FailureReason::SessionEnded).await {
                    Ok(_) | Err(TutorError::InvalidState(_)) => {}
                    Err(e) => return Err(e),
                }
                continue;
            }

            let now = self.ctx.now();
            let claimed = update_if(
                self.ctx.store.as_ref(),
                &candidate.key,
                &self.ctx.retry,
                |assignment: &mut Assignment| {
                    if assignment.status != AssignmentStatus::Pending {
                        return Ok(None);
                    }
                    assignment.claim(worker_id, now, lease_micros)?;
                    Ok(Some(()))
                },
            )
            .await?;

            if let Some((assignment, ())) = claimed {
                info!("Worker {worker_id} claimed {}", assignment.key);
                return Ok(Some(assignment));
            }
        }
        Ok(None)
    }

    /// Accept a progress report and extend the lease
    pub async fn report_progress(
        &self,
        assignment_key: &ResourceKey,
        worker_id: &str,
        fraction: f64,
        most_recent_demo_micros: u64,
    ) -> Result<Versioned<Assignment>> {
        self.ensure_lease_live(assignment_key).await?;
        let now = self.ctx.now();
        let lease_micros = self.config.lease_micros();
        let (assignment, ()) = update(
            self.ctx.store.as_ref(),
            assignment_key,
            &self.ctx.retry,
            |assignment: &mut Assignment| {
                assignment.apply_progress(
                    worker_id,
                    fraction,
                    most_recent_demo_micros,
                    now,
                    lease_micros,
                )
            },
        )
        .await?;
        debug!("Progress {fraction:.3} on {assignment_key}");
        Ok(assignment)
    }

    /// Record an intermediate model without finishing the assignment
    pub async fn record_checkpoint(
        &self,
        assignment_key: &ResourceKey,
        worker_id: &str,
        artifact: ModelArtifact,
        stats: TrainingStats,
    ) -> Result<Versioned<Model>> {
        self.ensure_lease_live(assignment_key).await?;
        self.models
            .record_model(assignment_key, worker_id, artifact, stats)
            .await
    }

    /// Record the final model and retire the assignment as succeeded
    ///
    /// The session is immediately re-checked for eligibility so demo data
    /// that arrived during training gets its own assignment.
    pub async fn complete(
        &self,
        assignment_key: &ResourceKey,
        worker_id: &str,
        artifact: ModelArtifact,
        stats: TrainingStats,
    ) -> Result<Versioned<Model>> {
        self.ensure_lease_live(assignment_key).await?;
        let model = self
            .models
            .record_model(assignment_key, worker_id, artifact, stats)
            .await?;

        let now = self.ctx.now();
        let model_id = model.resource.model_id.as_str();
        let (assignment, ()) = update(
            self.ctx.store.as_ref(),
            assignment_key,
            &self.ctx.retry,
            |assignment: &mut Assignment| {
                assignment.check_lease(worker_id, now)?;
                assignment.succeed(model_id, now)
            },
        )
        .await?;
        info!("Assignment {assignment_key} succeeded with model {model_id}");

        self.release(&assignment).await?;
        self.ensure_pending(&session_of(assignment_key)?, false)
            .await?;
        Ok(model)
    }

    /// Retire the assignment as failed on the worker's report
    pub async fn fail(
        &self,
        assignment_key: &ResourceKey,
        worker_id: &str,
        reason: &str,
    ) -> Result<Versioned<Assignment>> {
        self.ensure_lease_live(assignment_key).await?;
        let now = self.ctx.now();
        let (assignment, ()) = update(
            self.ctx.store.as_ref(),
            assignment_key,
            &self.ctx.retry,
            |assignment: &mut Assignment| {
                assignment.check_lease(worker_id, now)?;
                assignment.fail(FailureReason::Reported(reason.to_string()), now)
            },
        )
        .await?;
        warn!("Assignment {assignment_key} failed: {reason}");
        self.release(&assignment).await?;
        Ok(assignment)
    }

    /// Operator cancellation of a pending or running assignment
    pub async fn cancel(&self, assignment_key: &ResourceKey) -> Result<Versioned<Assignment>> {
        self.terminate(assignment_key, FailureReason::Cancelled)
            .await
    }

    /// Fail a non-terminal assignment for a service-side reason
    pub async fn terminate(
        &self,
        assignment_key: &ResourceKey,
        reason: FailureReason,
    ) -> Result<Versioned<Assignment>> {
        let now = self.ctx.now();
        let (assignment, ()) = update(
            self.ctx.store.as_ref(),
            assignment_key,
            &self.ctx.retry,
            |assignment: &mut Assignment| assignment.fail(reason.clone(), now),
        )
        .await?;
        info!("Assignment {assignment_key} terminated: {reason:?}");
        self.release(&assignment).await?;
        Ok(assignment)
    }

    /// Fail the assignment if its lease has lapsed; `true` if it did
    pub async fn reclaim(&self, assignment_key: &ResourceKey) -> Result<bool> {
        let now = self.ctx.now();
        let reclaimed = update_if(
            self.ctx.store.as_ref(),
            assignment_key,
            &self.ctx.retry,
            |assignment: &mut Assignment| {
                if !assignment.is_lease_expired(now) {
                    return Ok(None);
                }
                assignment.fail(FailureReason::LeaseExpired, now)?;
                Ok(Some(()))
            },
        )
        .await?;

        match reclaimed {
            Some((assignment, ())) => {
                warn!("Reclaimed {assignment_key} after its lease expired");
                self.release(&assignment).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ensure_lease_live(&self, assignment_key: &ResourceKey) -> Result<()> {
        if self.reclaim(assignment_key).await? {
            return Err(TutorError::LeaseExpired(assignment_key.id().to_string()));
        }
        Ok(())
    }

    /// Clear the session pointer naming a terminal assignment
    ///
    /// Demo volume of a failed assignment goes back to the session so the
    /// retry crosses the threshold again.
    async fn release(&self, assignment: &Versioned<Assignment>) -> Result<()> {
        let restore = if assignment.resource.status == AssignmentStatus::Failed {
            assignment.resource.demo_steps
        } else {
            0
        };
        self.clear_active(
            &session_of(&assignment.key)?,
            &assignment.resource.assignment_id,
            restore,
        )
        .await
    }

    /// Clear the session's active pointer if it still names `assignment_id`
    ///
    /// Retries conflicts until it lands: the assignment it follows is
    /// already terminal or was never written.
    pub(crate) async fn clear_active(
        &self,
        session_key: &ResourceKey,
        assignment_id: &str,
        restore_demo_steps: u64,
    ) -> Result<()> {
        update_if(
            self.ctx.store.as_ref(),
            session_key,
            &self.ctx.retry.persistent(),
            |session: &mut Session| {
                if session.active_assignment_id.as_deref() != Some(assignment_id) {
                    return Ok(None);
                }
                session.active_assignment_id = None;
                session.untrained_demo_steps += restore_demo_steps;
                Ok(Some(()))
            },
        )
        .await?;
        Ok(())
    }

    /// Assignments of a session, oldest first
    pub async fn list_assignments(
        &self,
        session_key: &ResourceKey,
    ) -> Result<Vec<Versioned<Assignment>>> {
        let mut assignments = self
            .ctx
            .store
            .list_children::<Assignment>(session_key)
            .await?;
        assignments.sort_by(|a, b| {
            a.resource
                .created_micros
                .cmp(&b.resource.created_micros)
                .then_with(|| a.key.cmp(&b.key))
        });
        Ok(assignments)
    }

    /// Reclaim every running assignment whose lease has lapsed
    pub async fn reap_expired(&self) -> Result<usize> {
        let now = self.ctx.now();
        let expired: Vec<ResourceKey> = self
            .scan_active()
            .await?
            .into_iter()
            .filter(|assignment| assignment.resource.is_lease_expired(now))
            .map(|assignment| assignment.key)
            .collect();

        let mut reclaimed = 0;
        for key in expired {
            if self.reclaim(&key).await? {
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    /// Revision at or below which every assignment is known to be terminal
    #[must_use]
    pub fn scan_floor(&self) -> Revision {
        Revision(self.scan_floor.load(Ordering::Acquire))
    }

    /// Every non-terminal assignment, in key order
    ///
    /// Lists only assignments written after the scan floor, then raises
    /// the floor to just below the oldest one still in flight.
    async fn scan_active(&self) -> Result<Vec<Versioned<Assignment>>> {
        let head = self.ctx.store.head_revision().await;
        let floor = self.scan_floor();
        let filter = ListFilter {
            modified_after: Some(floor),
            ..ListFilter::kind(ResourceKind::Assignment)
        };

        let mut lister = Lister::new(self.ctx.store.as_ref(), None, filter);
        let mut active = Vec::new();
        let mut lowest = head.0;
        while let Some(item) = lister.next().await? {
            let assignment: Versioned<Assignment> = item.into_entity()?;
            if !assignment.resource.is_terminal() {
                lowest = lowest.min(assignment.revision.0.saturating_sub(1));
                active.push(assignment);
            }
        }

        if lowest > floor.0 {
            self.scan_floor.fetch_max(lowest, Ordering::AcqRel);
            debug!("Assignment scan floor raised to {lowest}");
        }
        Ok(active)
    }

    /// Create pending assignments for every eligible session
    pub async fn sweep_eligible(&self) -> Result<usize> {
        let threshold = self.config.training_threshold_demo_steps;
        let mut eligible = Vec::new();
        let mut lister = Lister::new(
            self.ctx.store.as_ref(),
            None,
            ListFilter::kind(ResourceKind::Session),
        );
        while let Some(item) = lister.next().await? {
            let session: Versioned<Session> = item.into_entity()?;
            if session.resource.is_training_eligible(threshold) {
                eligible.push(session.key);
            }
        }

        let mut scheduled = 0;
        for key in eligible {
            if self.ensure_pending(&key, false).await?.is_some() {
                scheduled += 1;
            }
        }
        Ok(scheduled)
    }

    /// Reclaim lapsed leases, then schedule eligible sessions
    pub async fn tick(&self) -> Result<TickReport> {
        let reclaimed = self.reap_expired().await?;
        let scheduled = self.sweep_eligible().await?;
        Ok(TickReport {
            reclaimed,
            scheduled,
        })
    }

    /// Run [`AssignmentScheduler::tick`] periodically until `shutdown` flips to true
    pub fn spawn_reaper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let period = self.config.reap_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Reaper started, interval {period:?}");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.tick().await {
                            Ok(report) if report.is_quiet() => {}
                            Ok(report) => info!(
                                "Reaper reclaimed {} and scheduled {} assignment(s)",
                                report.reclaimed, report.scheduled
                            ),
                            Err(e) => warn!("Reaper pass failed: {e}"),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Reaper stopped");
        })
    }
}
