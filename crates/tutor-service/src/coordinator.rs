//! The coordinator facade
//!
//! Owns the store for its whole lifetime: opened by [`Coordinator::open`]
//! (or injected through [`Coordinator::new`]) and closed by
//! [`Coordinator::shutdown`]. Every component holds the same context.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;
use tutor_core::{
    update, update_if, Assignment, Brain, Clock, EpisodeChunk, FailureReason, ListFilter, Lister,
    Model, ModelArtifact, OfflineEvaluation, OnlineEvaluation, Project, ResourceKey,
    ResourceKind, ResourceStore, Result, Session, SessionStatus, SessionType, Snapshot,
    StoreExt, SystemClock, TrainingStats, TutorError, Versioned,
};
use uuid::Uuid;

use crate::boundary::{ClaimedAssignment, LearnerApi};
use crate::config::ServiceConfig;
use crate::context::ServiceContext;
use crate::evaluation::EvaluationTracker;
use crate::ingestion::{ChunkUpload, CommitReceipt, EpisodeIngestion};
use crate::lineage::{brain_of, session_of, LineageTarget, ModelManager, SnapshotRequest};
use crate::scheduler::{AssignmentScheduler, TickReport};

/// Parameters of a new session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSession {
    /// Identifier to use; generated when absent
    pub session_id: Option<String>,
    /// Session intent
    pub session_type: SessionType,
    /// Snapshots under the same brain to start from
    #[serde(default)]
    pub starting_snapshot_ids: Vec<String>,
}

impl NewSession {
    /// Interactive training session with a generated id and no history
    #[must_use]
    pub fn training() -> Self {
        Self {
            session_id: None,
            session_type: SessionType::InteractiveTraining,
            starting_snapshot_ids: Vec::new(),
        }
    }

    /// Use a fixed session id
    #[must_use]
    pub fn with_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Start from existing snapshots
    #[must_use]
    pub fn starting_from(mut self, snapshot_ids: Vec<String>) -> Self {
        self.starting_snapshot_ids = snapshot_ids;
        self
    }
}

/// Result of ending a session
#[derive(Debug, Clone, PartialEq)]
pub struct EndedSession {
    /// The session in its terminal state
    pub session: Versioned<Session>,
    /// Snapshot taken at the end, when the session trained a model
    pub snapshot: Option<Versioned<Snapshot>>,
}

/// Entry point tying the store and every component together
#[derive(Debug)]
pub struct Coordinator {
    ctx: ServiceContext,
    config: ServiceConfig,
    evaluations: EvaluationTracker,
    models: ModelManager,
    scheduler: Arc<AssignmentScheduler>,
    ingestion: EpisodeIngestion,
}

impl Coordinator {
    /// Build a coordinator over an existing store and clock
    pub fn new(store: Arc<dyn ResourceStore>, clock: Arc<dyn Clock>, config: ServiceConfig) -> Self {
        let ctx = ServiceContext::new(store, clock, config.retry.clone());
        let evaluations = EvaluationTracker::new(ctx.clone());
        let models = ModelManager::new(ctx.clone(), evaluations.clone());
        let scheduler = Arc::new(AssignmentScheduler::new(
            ctx.clone(),
            config.scheduler.clone(),
            models.clone(),
        ));
        let ingestion = EpisodeIngestion::new(ctx.clone(), scheduler.as_ref().clone());
        Self {
            ctx,
            config,
            evaluations,
            models,
            scheduler,
            ingestion,
        }
    }

    /// Open the configured store and build a coordinator on the system clock
    pub async fn open(config: ServiceConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let store = config.open_store().await?;
        info!(
            "Coordinator opened ({})",
            config
                .store
                .journal_path
                .as_ref()
                .map_or_else(|| "in-memory".to_string(), |p| p.display().to_string())
        );
        Ok(Self::new(store, Arc::new(SystemClock), config))
    }

    /// Close the store; later writes fail
    pub async fn shutdown(&self) -> Result<()> {
        self.ctx.store.close().await?;
        info!("Coordinator shut down");
        Ok(())
    }

    /// The shared store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.ctx.store
    }

    /// Configuration in effect
    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// The assignment scheduler
    #[must_use]
    pub fn scheduler(&self) -> &Arc<AssignmentScheduler> {
        &self.scheduler
    }

    /// The ingestion pipeline
    #[must_use]
    pub fn ingestion(&self) -> &EpisodeIngestion {
        &self.ingestion
    }

    /// The model and snapshot manager
    #[must_use]
    pub fn models(&self) -> &ModelManager {
        &self.models
    }

    /// The evaluation tracker
    #[must_use]
    pub fn evaluations(&self) -> &EvaluationTracker {
        &self.evaluations
    }

    // ---- Admin ----

    /// Create a project with a fresh API key
    pub async fn create_project(&self, project_id: &str, name: &str) -> Result<Versioned<Project>> {
        let project = Project {
            project_id: project_id.to_string(),
            name: name.to_string(),
            api_key: Uuid::new_v4().to_string(),
            created_micros: self.ctx.now(),
        };
        let key = ResourceKey::project(project_id);
        let revision = self.ctx.store.create_entity(&key, project.clone()).await?;
        info!("Created project {key}");
        Ok(Versioned {
            key,
            revision,
            resource: project,
        })
    }

    /// Create a brain under a project
    pub async fn create_brain(
        &self,
        project_key: &ResourceKey,
        brain_id: &str,
        name: &str,
        brain_spec: serde_json::Value,
    ) -> Result<Versioned<Brain>> {
        let brain = Brain {
            brain_id: brain_id.to_string(),
            name: name.to_string(),
            created_micros: self.ctx.now(),
            brain_spec,
            spec_frozen: false,
        };
        let key = project_key.brain(brain_id);
        let revision = self.ctx.store.create_entity(&key, brain.clone()).await?;
        info!("Created brain {key}");
        Ok(Versioned {
            key,
            revision,
            resource: brain,
        })
    }

    /// Replace a brain's spec; rejected once a session has started
    pub async fn update_brain_spec(
        &self,
        brain_key: &ResourceKey,
        brain_spec: serde_json::Value,
    ) -> Result<Versioned<Brain>> {
        let (brain, ()) = update(
            self.ctx.store.as_ref(),
            brain_key,
            &self.ctx.retry,
            |brain: &mut Brain| brain.replace_spec(brain_spec.clone()),
        )
        .await?;
        Ok(brain)
    }

    // ---- Sessions ----

    /// Start a session under a brain, freezing the brain's spec
    pub async fn create_session(
        &self,
        brain_key: &ResourceKey,
        request: NewSession,
    ) -> Result<Versioned<Session>> {
        for snapshot_id in &request.starting_snapshot_ids {
            self.ctx
                .store
                .get_entity::<Snapshot>(&brain_key.snapshot(snapshot_id))
                .await?;
        }

        update_if(
            self.ctx.store.as_ref(),
            brain_key,
            &self.ctx.retry,
            |brain: &mut Brain| {
                if brain.spec_frozen {
                    return Ok(None);
                }
                brain.spec_frozen = true;
                Ok(Some(()))
            },
        )
        .await?;

        let session_id = request.session_id.unwrap_or_else(ServiceContext::new_id);
        let session = Session::new(
            session_id.clone(),
            request.session_type,
            request.starting_snapshot_ids,
            self.ctx.now(),
        );
        let key = brain_key.session(&session_id);
        let revision = self.ctx.store.create_entity(&key, session.clone()).await?;
        info!("Started {:?} session {key}", session.session_type);
        Ok(Versioned {
            key,
            revision,
            resource: session,
        })
    }

    /// Read a session
    pub async fn get_session(&self, session_key: &ResourceKey) -> Result<Versioned<Session>> {
        self.ctx.store.get_entity(session_key).await
    }

    /// Sessions of a brain
    pub async fn list_sessions(&self, brain_key: &ResourceKey) -> Result<Vec<Versioned<Session>>> {
        self.ctx.store.list_children::<Session>(brain_key).await
    }

    /// Every session in the store, in key order
    pub async fn all_sessions(&self) -> Result<Vec<Versioned<Session>>> {
        Lister::new(
            self.ctx.store.as_ref(),
            None,
            ListFilter::kind(ResourceKind::Session),
        )
        .collect_all()
        .await?
        .into_iter()
        .map(|item| item.into_entity())
        .collect()
    }

    /// End a session
    ///
    /// Outstanding work is failed with `SessionEnded`. A training session
    /// that produced a model gets a resulting snapshot whose ancestors are
    /// the snapshots it started from.
    pub async fn end_session(
        &self,
        session_key: &ResourceKey,
        status: SessionStatus,
    ) -> Result<EndedSession> {
        let now = self.ctx.now();
        let (mut session, ()) = update(
            self.ctx.store.as_ref(),
            session_key,
            &self.ctx.retry,
            |session: &mut Session| session.end(status, now),
        )
        .await?;
        info!("Session {session_key} ended as {status:?}");

        if let Some(active) = &session.resource.active_assignment_id {
            match self
                .scheduler
                .terminate(&session_key.assignment(active), FailureReason::SessionEnded)
                .await
            {
                Ok(_) | Err(TutorError::InvalidState(_)) => {}
                Err(TutorError::NotFound(_)) => {
                    // Pointer set but the assignment not yet written; its
                    // creator sees the ended session and fails it
                    self.scheduler.clear_active(session_key, active, 0).await?;
                }
                Err(e) => return Err(e),
            }
        }

        let mut snapshot = None;
        if session.resource.session_type.trains() && session.resource.latest_model_id.is_some() {
            let created = self
                .models
                .create_snapshot(
                    session_key,
                    SnapshotRequest {
                        snapshot_id: None,
                        display_name: format!("session {}", session.resource.session_id),
                        ancestor_ids: session.resource.starting_snapshot_ids.clone(),
                    },
                )
                .await?;
            let snapshot_id = created.resource.snapshot_id.clone();
            update(
                self.ctx.store.as_ref(),
                session_key,
                &self.ctx.retry,
                |session: &mut Session| {
                    session.resulting_snapshot_id = Some(snapshot_id.clone());
                    Ok(())
                },
            )
            .await?;
            snapshot = Some(created);
        }

        session = self.ctx.store.get_entity(session_key).await?;
        Ok(EndedSession { session, snapshot })
    }

    // ---- Data plane ----

    /// Commit the next chunk of an episode
    pub async fn commit_chunk(
        &self,
        session_key: &ResourceKey,
        episode_id: &str,
        upload: ChunkUpload,
    ) -> Result<CommitReceipt> {
        self.ingestion
            .commit_chunk(session_key, episode_id, upload)
            .await
    }

    /// Schedule training now, ignoring the demo threshold
    pub async fn request_training(
        &self,
        session_key: &ResourceKey,
    ) -> Result<Option<Versioned<Assignment>>> {
        self.scheduler.request_training(session_key).await
    }

    /// Cancel a pending or running assignment
    pub async fn cancel_assignment(
        &self,
        assignment_key: &ResourceKey,
    ) -> Result<Versioned<Assignment>> {
        self.scheduler.cancel(assignment_key).await
    }

    /// One reclamation and scheduling pass
    pub async fn tick(&self) -> Result<TickReport> {
        self.scheduler.tick().await
    }

    /// Run the scheduler pass in the background until `shutdown` is set
    pub fn spawn_reaper(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        Arc::clone(&self.scheduler).spawn_reaper(shutdown)
    }

    // ---- Lineage and evaluation ----

    /// Snapshot a session explicitly
    pub async fn create_snapshot(
        &self,
        session_key: &ResourceKey,
        request: SnapshotRequest,
    ) -> Result<Versioned<Snapshot>> {
        self.models.create_snapshot(session_key, request).await
    }

    /// Best model in a snapshot or session lineage
    pub async fn resolve_best_model(
        &self,
        brain_key: &ResourceKey,
        target: &LineageTarget,
    ) -> Result<Versioned<Model>> {
        self.models.resolve_best_model(brain_key, target).await
    }

    /// Append an offline score
    pub async fn record_offline_evaluation(
        &self,
        model_key: &ResourceKey,
        evaluation_set_version: u64,
        score: f64,
    ) -> Result<Versioned<OfflineEvaluation>> {
        self.evaluations
            .record_offline_evaluation(model_key, evaluation_set_version, score)
            .await
    }

    /// Append an online score
    pub async fn record_online_evaluation(
        &self,
        model_key: &ResourceKey,
        episode_id: &str,
        score: f64,
    ) -> Result<Versioned<OnlineEvaluation>> {
        self.evaluations
            .record_online_evaluation(model_key, episode_id, score)
            .await
    }
}

#[async_trait]
impl LearnerApi for Coordinator {
    async fn claim_assignment(&self, worker_id: &str) -> Result<Option<ClaimedAssignment>> {
        let Some(claimed) = self
            .scheduler
            .claim_assignment(worker_id, self.config.scheduler.claim_timeout())
            .await?
        else {
            return Ok(None);
        };

        let brain_key = brain_of(&session_of(&claimed.key)?)?;
        let brain: Versioned<Brain> = self.ctx.store.get_entity(&brain_key).await?;
        Ok(Some(ClaimedAssignment {
            key: claimed.key,
            assignment: claimed.resource,
            brain_spec: brain.resource.brain_spec,
        }))
    }

    async fn training_data(&self, assignment_key: &ResourceKey) -> Result<Vec<EpisodeChunk>> {
        let assignment: Versioned<Assignment> = self.ctx.store.get_entity(assignment_key).await?;
        self.ingestion
            .training_chunks(
                &session_of(assignment_key)?,
                assignment.resource.created_micros,
            )
            .await
    }

    async fn report_progress(
        &self,
        assignment_key: &ResourceKey,
        worker_id: &str,
        fraction: f64,
        most_recent_demo_micros: u64,
    ) -> Result<()> {
        self.scheduler
            .report_progress(assignment_key, worker_id, fraction, most_recent_demo_micros)
            .await
            .map(|_| ())
    }

    async fn record_checkpoint(
        &self,
        assignment_key: &ResourceKey,
        worker_id: &str,
        artifact: ModelArtifact,
        stats: TrainingStats,
    ) -> Result<String> {
        let model = self
            .scheduler
            .record_checkpoint(assignment_key, worker_id, artifact, stats)
            .await?;
        Ok(model.resource.model_id)
    }

    async fn complete(
        &self,
        assignment_key: &ResourceKey,
        worker_id: &str,
        artifact: ModelArtifact,
        stats: TrainingStats,
    ) -> Result<String> {
        let model = self
            .scheduler
            .complete(assignment_key, worker_id, artifact, stats)
            .await?;
        Ok(model.resource.model_id)
    }

    async fn fail(&self, assignment_key: &ResourceKey, worker_id: &str, reason: &str) -> Result<()> {
        self.scheduler
            .fail(assignment_key, worker_id, reason)
            .await
            .map(|_| ())
    }
}
