use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tutor_core::{
    ActionSource, AssignmentStatus, FailureReason, ManualClock, MemoryStore, ResourceKey, Result,
    Step, TutorError,
};
use tutor_learner::{
    DemoReplayTrainer, LearnerWorker, Trainer, TrainerConfig, TrainingContext, TrainingUpdate,
    WorkOutcome, WorkerConfig,
};
use tutor_service::{ChunkUpload, Coordinator, NewSession, ServiceConfig};

const LEASE_MS: u64 = 1_000;

struct Setup {
    coordinator: Arc<Coordinator>,
    clock: Arc<ManualClock>,
    session: ResourceKey,
}

async fn setup(demo_steps: usize) -> Setup {
    let clock = Arc::new(ManualClock::new(1_000_000));
    let mut config = ServiceConfig::default();
    config.scheduler.training_threshold_demo_steps = 2;
    config.scheduler.lease_duration_ms = LEASE_MS;
    config.scheduler.claim_timeout_ms = 20;
    let coordinator = Coordinator::new(Arc::new(MemoryStore::new()), clock.clone(), config);

    let project = coordinator.create_project("p", "Project").await.unwrap();
    let brain = coordinator
        .create_brain(&project.key, "b", "Brain", serde_json::json!({"obs": [2]}))
        .await
        .unwrap();
    let session = coordinator
        .create_session(&brain.key, NewSession::training().with_id("s"))
        .await
        .unwrap()
        .key;

    if demo_steps > 0 {
        let steps = (0..demo_steps)
            .map(|i| Step {
                observation: serde_json::json!([i, i]),
                action: serde_json::json!([1]),
                reward: 1.0,
                source: ActionSource::HumanDemonstration,
                timestamp_micros: 0,
            })
            .collect();
        coordinator
            .commit_chunk(&session, "e", ChunkUpload::new(1, steps))
            .await
            .unwrap();
    }

    Setup {
        coordinator: Arc::new(coordinator),
        clock,
        session,
    }
}

fn trainer(dir: &tempfile::TempDir) -> DemoReplayTrainer {
    DemoReplayTrainer::new(TrainerConfig {
        increments: 3,
        checkpoint_every: 2,
        artifact_dir: dir.path().to_path_buf(),
        ..TrainerConfig::default()
    })
}

#[tokio::test]
async fn test_idle_without_work() {
    let setup = setup(0).await;
    let dir = tempfile::tempdir().unwrap();
    let mut worker = LearnerWorker::new(
        setup.coordinator.clone(),
        trainer(&dir),
        WorkerConfig::new("w1"),
    );
    assert_eq!(worker.run_once().await.unwrap(), WorkOutcome::Idle);
}

#[tokio::test]
async fn test_assignment_trained_to_completion() {
    let setup = setup(4).await;
    let dir = tempfile::tempdir().unwrap();
    let mut worker = LearnerWorker::new(
        setup.coordinator.clone(),
        trainer(&dir),
        WorkerConfig::new("w1"),
    );

    let WorkOutcome::Completed {
        assignment,
        model_id,
    } = worker.run_once().await.unwrap()
    else {
        panic!("expected the assignment to complete");
    };

    let assignments = setup
        .coordinator
        .scheduler()
        .list_assignments(&setup.session)
        .await
        .unwrap();
    assert_eq!(assignments.len(), 1);
    let finished = &assignments[0];
    assert_eq!(finished.key, assignment);
    assert_eq!(finished.resource.status, AssignmentStatus::Succeeded);
    assert_eq!(finished.resource.result_model_id.as_deref(), Some(model_id.as_str()));
    // One intermediate checkpoint plus the final model
    assert_eq!(finished.resource.model_ids.len(), 2);
    assert!((finished.resource.progress.fraction - 1.0).abs() < f64::EPSILON);

    let session = setup.coordinator.get_session(&setup.session).await.unwrap();
    assert_eq!(session.resource.latest_model_id, Some(model_id));
    assert_eq!(session.resource.active_assignment_id, None);
}

/// Lets the lease lapse in the middle of training
struct SlowTrainer {
    inner: DemoReplayTrainer,
    clock: Arc<ManualClock>,
}

#[async_trait]
impl Trainer for SlowTrainer {
    async fn begin(&mut self, context: TrainingContext) -> Result<()> {
        self.inner.begin(context).await
    }

    async fn train_increment(&mut self) -> Result<TrainingUpdate> {
        self.clock.advance(Duration::from_millis(LEASE_MS * 2));
        self.inner.train_increment().await
    }

    fn reset(&mut self) {
        self.inner.reset();
    }
}

#[tokio::test]
async fn test_lost_lease_discards_work() {
    let setup = setup(2).await;
    let dir = tempfile::tempdir().unwrap();
    let mut worker = LearnerWorker::new(
        setup.coordinator.clone(),
        SlowTrainer {
            inner: trainer(&dir),
            clock: setup.clock.clone(),
        },
        WorkerConfig::new("w1"),
    );

    let outcome = worker.run_once().await.unwrap();
    assert!(matches!(outcome, WorkOutcome::Abandoned { .. }));

    let assignments = setup
        .coordinator
        .scheduler()
        .list_assignments(&setup.session)
        .await
        .unwrap();
    assert_eq!(assignments[0].resource.failure, Some(FailureReason::LeaseExpired));
    assert!(assignments[0].resource.model_ids.is_empty());
}

struct BrokenTrainer;

#[async_trait]
impl Trainer for BrokenTrainer {
    async fn begin(&mut self, _context: TrainingContext) -> Result<()> {
        Ok(())
    }

    async fn train_increment(&mut self) -> Result<TrainingUpdate> {
        Err(TutorError::InvalidState("diverged".into()))
    }

    fn reset(&mut self) {}
}

#[tokio::test]
async fn test_trainer_error_is_reported_as_failure() {
    let setup = setup(2).await;
    let mut worker = LearnerWorker::new(
        setup.coordinator.clone(),
        BrokenTrainer,
        WorkerConfig::new("w1"),
    );

    let outcome = worker.run_once().await.unwrap();
    let WorkOutcome::Failed { reason, .. } = outcome else {
        panic!("expected a reported failure, got {outcome:?}");
    };
    assert!(reason.contains("diverged"));

    let assignments = setup
        .coordinator
        .scheduler()
        .list_assignments(&setup.session)
        .await
        .unwrap();
    assert!(matches!(
        assignments[0].resource.failure,
        Some(FailureReason::Reported(_))
    ));

    // The failed volume is back on the session and the next pass retries it
    assert_eq!(setup.coordinator.tick().await.unwrap().scheduled, 1);
}

#[tokio::test]
async fn test_run_until_shutdown() {
    let setup = setup(2).await;
    let dir = tempfile::tempdir().unwrap();
    let mut config = WorkerConfig::new("w1");
    config.idle_backoff_ms = 5;
    let mut worker = LearnerWorker::new(setup.coordinator.clone(), trainer(&dir), config);

    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(async move { worker.run(rx).await });

    let coordinator = setup.coordinator.clone();
    let session = setup.session.clone();
    tokio::time::timeout(Duration::from_secs(5), async move {
        loop {
            let state = coordinator.get_session(&session).await.unwrap();
            if state.resource.latest_model_id.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    tx.send(true).unwrap();
    let stats = handle.await.unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.errors, 0);
}
