//! Invariants that must hold under arbitrary and concurrent call orders

mod common;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use common::*;
use proptest::prelude::*;
use tokio::sync::{broadcast, Semaphore};
use tutor_core::{
    AssignmentStatus, ChangeEvent, ContinuationToken, Episode, EpisodeChunk, FailureReason,
    ListFilter, MemoryStore, Mutator, Page, Resource, ResourceKey, ResourceKind, ResourceStore,
    Revision, SessionStatus, StoreExt, TutorError, Versioned,
};
use tutor_service::{
    ChunkUpload, Coordinator, LearnerApi, NewSession, ServiceConfig, SnapshotRequest,
};

fn has_cycle(edges: &HashMap<String, Vec<String>>) -> bool {
    fn visit(
        node: &str,
        edges: &HashMap<String, Vec<String>>,
        on_path: &mut HashSet<String>,
        done: &mut HashSet<String>,
    ) -> bool {
        if done.contains(node) {
            return false;
        }
        if !on_path.insert(node.to_string()) {
            return true;
        }
        for parent in edges.get(node).into_iter().flatten() {
            if visit(parent, edges, on_path, done) {
                return true;
            }
        }
        on_path.remove(node);
        done.insert(node.to_string());
        false
    }

    let mut done = HashSet::new();
    edges
        .keys()
        .any(|node| visit(node, edges, &mut HashSet::new(), &mut done))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_lineage_stays_acyclic(
        calls in prop::collection::vec((0usize..6, prop::collection::vec(0usize..6, 0..3)), 1..24)
    ) {
        tokio_test::block_on(async {
            let fx = fixture(100).await;
            let session = fx.training_session("s").await;

            for (id, ancestors) in calls {
                let request = SnapshotRequest {
                    snapshot_id: Some(format!("n{id}")),
                    display_name: String::new(),
                    ancestor_ids: ancestors.iter().map(|a| format!("n{a}")).collect(),
                };
                match fx.coordinator.create_snapshot(&session, request).await {
                    Ok(_)
                    | Err(TutorError::CyclicLineage { .. })
                    | Err(TutorError::NotFound(_))
                    | Err(TutorError::AlreadyExists(_)) => {}
                    Err(e) => panic!("unexpected error {e}"),
                }
            }

            let snapshots = fx
                .coordinator
                .store()
                .list_children::<tutor_core::Snapshot>(&fx.brain)
                .await
                .unwrap();
            let edges: HashMap<String, Vec<String>> = snapshots
                .into_iter()
                .map(|s| (s.resource.snapshot_id, s.resource.ancestor_ids))
                .collect();
            assert!(!has_cycle(&edges));
        });
    }

    #[test]
    fn prop_committed_sequences_are_contiguous(
        sequences in prop::collection::vec(0u64..10, 1..30)
    ) {
        tokio_test::block_on(async {
            let fx = fixture(1_000).await;
            let session = fx.training_session("s").await;

            let mut accepted = 0u64;
            for sequence in sequences {
                let result = fx
                    .coordinator
                    .commit_chunk(&session, "e", inference_chunk(sequence, 1))
                    .await;
                if sequence == accepted + 1 {
                    assert!(!result.unwrap().replayed);
                    accepted += 1;
                } else if (1..=accepted).contains(&sequence) {
                    // Identical resend of a stored chunk
                    assert!(result.unwrap().replayed);
                } else {
                    assert!(result.is_err());
                }
            }

            let state = fx.coordinator.get_session(&session).await.unwrap().resource;
            assert_eq!(state.total_inference_steps, accepted);

            if accepted > 0 {
                let episode = session.episode("e");
                let chunks = fx.coordinator.ingestion().read_chunks(&episode, 0).await.unwrap();
                let stored: Vec<u64> = chunks.iter().map(|c| c.sequence).collect();
                assert_eq!(stored, (1..=accepted).collect::<Vec<_>>());
                assert!(fx.coordinator.ingestion().missing_sequences(&episode).await.unwrap().is_empty());
            }
        });
    }
}

#[tokio::test]
async fn test_duplicate_commit_applies_once() {
    let fx = fixture(1_000).await;
    let session = fx.training_session("s").await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let coordinator = Arc::clone(&fx.coordinator);
        let session = session.clone();
        handles.push(tokio::spawn(async move {
            coordinator
                .commit_chunk(&session, "e", demo_chunk(1, 2))
                .await
        }));
    }
    let mut fresh = 0;
    for handle in handles {
        if !handle.await.unwrap().unwrap().replayed {
            fresh += 1;
        }
    }
    assert_eq!(fresh, 1);

    let state = fx.coordinator.get_session(&session).await.unwrap().resource;
    assert_eq!(state.total_demo_steps, 2);
    assert!(fx.coordinator.ingestion().rejections(&session).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_resend_is_acknowledged_only_with_same_payload() {
    let fx = fixture(1_000).await;
    let session = fx.training_session("s").await;
    let first = fx
        .coordinator
        .commit_chunk(&session, "e", demo_chunk(1, 2))
        .await
        .unwrap();

    fx.clock.advance(std::time::Duration::from_secs(1));
    let resent = fx
        .coordinator
        .commit_chunk(&session, "e", demo_chunk(1, 2))
        .await
        .unwrap();
    assert!(resent.replayed);
    assert_eq!(resent.chunk_key, first.chunk_key);
    assert_eq!(resent.revision, first.revision);

    let err = fx
        .coordinator
        .commit_chunk(&session, "e", demo_chunk(1, 3))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TutorError::OutOfOrder {
            expected: 2,
            actual: 1,
            ..
        }
    ));

    let state = fx.coordinator.get_session(&session).await.unwrap().resource;
    assert_eq!(state.total_demo_steps, 2);
    assert_eq!(fx.coordinator.ingestion().rejections(&session).await.unwrap().len(), 1);
}

/// Store a chunk as if its commit died before updating episode and session
async fn store_orphan_chunk(fx: &Fixture, session: &ResourceKey, upload: ChunkUpload) {
    let store = fx.coordinator.store();
    let episode_key = session.episode("e");
    if upload.sequence == 1 {
        store
            .create_entity(&episode_key, Episode::new("e", START_MICROS))
            .await
            .unwrap();
    }
    let chunk = EpisodeChunk {
        episode_id: "e".into(),
        sequence: upload.sequence,
        created_micros: START_MICROS,
        classification: upload.classification,
        episode_state: upload.episode_state,
        model_id: upload.model_id,
        steps: upload.steps,
    };
    store
        .create_entity(&episode_key.chunk(chunk.sequence), chunk)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_next_commit_accounts_for_orphaned_chunk() {
    let fx = fixture(1_000).await;
    let session = fx.training_session("s").await;
    store_orphan_chunk(&fx, &session, demo_chunk(1, 2)).await;

    let receipt = fx
        .coordinator
        .commit_chunk(&session, "e", demo_chunk(2, 3))
        .await
        .unwrap();
    assert!(!receipt.replayed);

    let state = fx.coordinator.get_session(&session).await.unwrap().resource;
    assert_eq!(state.total_demo_steps, 5);
    assert_eq!(state.accounted_sequence("e"), 2);
    let episode: Versioned<Episode> = fx
        .coordinator
        .store()
        .get_entity(&session.episode("e"))
        .await
        .unwrap();
    assert_eq!(episode.resource.last_sequence, 2);
}

#[tokio::test]
async fn test_resend_of_orphaned_chunk_finishes_its_commit() {
    let fx = fixture(1_000).await;
    let session = fx.training_session("s").await;
    store_orphan_chunk(&fx, &session, demo_chunk(1, 2)).await;

    let receipt = fx
        .coordinator
        .commit_chunk(&session, "e", demo_chunk(1, 2))
        .await
        .unwrap();
    assert!(receipt.replayed);

    let state = fx.coordinator.get_session(&session).await.unwrap().resource;
    assert_eq!(state.total_demo_steps, 2);
    fx.coordinator
        .commit_chunk(&session, "e", demo_chunk(2, 1))
        .await
        .unwrap();
    let state = fx.coordinator.get_session(&session).await.unwrap().resource;
    assert_eq!(state.total_demo_steps, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_contended_follow_up_writes_are_not_dropped() {
    let mut config = config(1_000);
    config.retry.max_attempts = 1;
    let fx = fixture_with(Arc::new(MemoryStore::new()), config).await;
    let session = fx.training_session("s").await;

    let mut handles = Vec::new();
    for writer in 0..16 {
        let coordinator = Arc::clone(&fx.coordinator);
        let session = session.clone();
        handles.push(tokio::spawn(async move {
            let episode = format!("e{writer}");
            for sequence in 1..=3 {
                coordinator
                    .commit_chunk(&session, &episode, demo_chunk(sequence, 1))
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let state = fx.coordinator.get_session(&session).await.unwrap().resource;
    assert_eq!(state.total_demo_steps, 48);
    assert_eq!(state.untrained_demo_steps, 48);
    let episodes = fx.coordinator.ingestion().list_episodes(&session).await.unwrap();
    assert_eq!(episodes.len(), 16);
    assert!(episodes.iter().all(|e| e.resource.last_sequence == 3));
}

/// Holds every assignment create until the gate opens
struct GatedStore {
    inner: MemoryStore,
    gate: Semaphore,
}

impl GatedStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            gate: Semaphore::new(0),
        }
    }

    fn open_gate(&self) {
        self.gate.add_permits(Semaphore::MAX_PERMITS);
    }
}

#[async_trait]
impl ResourceStore for GatedStore {
    async fn create(&self, key: &ResourceKey, resource: Resource) -> tutor_core::Result<Revision> {
        if key.kind() == ResourceKind::Assignment {
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| TutorError::InvalidState(e.to_string()))?;
        }
        self.inner.create(key, resource).await
    }

    async fn put(&self, key: &ResourceKey, resource: Resource) -> tutor_core::Result<Revision> {
        self.inner.put(key, resource).await
    }

    async fn get(&self, key: &ResourceKey) -> tutor_core::Result<Versioned<Resource>> {
        self.inner.get(key).await
    }

    async fn list_page(
        &self,
        prefix: Option<&ResourceKey>,
        filter: &ListFilter,
        after: Option<&ContinuationToken>,
        limit: usize,
    ) -> tutor_core::Result<Page> {
        self.inner.list_page(prefix, filter, after, limit).await
    }

    async fn compare_and_update(
        &self,
        key: &ResourceKey,
        expected: Revision,
        mutator: Mutator,
    ) -> tutor_core::Result<Revision> {
        self.inner.compare_and_update(key, expected, mutator).await
    }

    async fn last_modified(&self, key: &ResourceKey) -> Option<Revision> {
        self.inner.last_modified(key).await
    }

    async fn head_revision(&self) -> Revision {
        self.inner.head_revision().await
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.subscribe()
    }
}

#[tokio::test]
async fn test_session_ended_while_assignment_is_being_created() {
    let store = Arc::new(GatedStore::new());
    let fx = fixture_with(store.clone(), config(1)).await;
    let session = fx.training_session("s").await;

    let commit = {
        let coordinator = Arc::clone(&fx.coordinator);
        let session = session.clone();
        tokio::spawn(async move {
            coordinator
                .commit_chunk(&session, "e", demo_chunk(1, 1))
                .await
        })
    };

    // Pointer written, assignment held at the gate
    loop {
        let state = fx.coordinator.get_session(&session).await.unwrap().resource;
        if state.active_assignment_id.is_some() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }
    let ended = fx
        .coordinator
        .end_session(&session, SessionStatus::Aborted)
        .await
        .unwrap();
    assert_eq!(ended.session.resource.active_assignment_id, None);

    store.open_gate();
    let receipt = commit.await.unwrap().unwrap();
    assert!(receipt.scheduled.is_none());

    let assignments = fx
        .coordinator
        .scheduler()
        .list_assignments(&session)
        .await
        .unwrap();
    assert_eq!(assignments.len(), 1);
    assert_eq!(assignments[0].resource.status, AssignmentStatus::Failed);
    assert_eq!(
        assignments[0].resource.failure,
        Some(FailureReason::SessionEnded)
    );
    let state = fx.coordinator.get_session(&session).await.unwrap().resource;
    assert_eq!(state.active_assignment_id, None);
    assert!(fx.coordinator.claim_assignment("w1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_out_of_order_reports_expected_sequence() {
    let fx = fixture(1_000).await;
    let session = fx.training_session("s").await;
    fx.coordinator
        .commit_chunk(&session, "e", demo_chunk(1, 1))
        .await
        .unwrap();

    let err = fx
        .coordinator
        .commit_chunk(&session, "e", demo_chunk(3, 1))
        .await
        .unwrap_err();
    match err {
        TutorError::OutOfOrder {
            expected, actual, ..
        } => {
            assert_eq!(expected, 2);
            assert_eq!(actual, 3);
        }
        other => panic!("unexpected error {other}"),
    }

    // A new episode must start at 1
    let err = fx
        .coordinator
        .commit_chunk(&session, "other", demo_chunk(2, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, TutorError::OutOfOrder { expected: 1, .. }));
}

#[tokio::test]
async fn test_finished_episode_accepts_nothing() {
    let fx = fixture(1_000).await;
    let session = fx.training_session("s").await;
    fx.coordinator
        .commit_chunk(
            &session,
            "e",
            demo_chunk(1, 1).finishing(tutor_core::EpisodeState::Success),
        )
        .await
        .unwrap();

    let err = fx
        .coordinator
        .commit_chunk(&session, "e", demo_chunk(2, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, TutorError::InvalidState(_)));
}

#[tokio::test]
async fn test_mislabelled_chunk_is_rejected() {
    let fx = fixture(1_000).await;
    let session = fx.training_session("s").await;

    let mut upload = demo_chunk(1, 2);
    upload.classification = tutor_core::StepClassification::InferenceOnly;
    let err = fx
        .coordinator
        .commit_chunk(&session, "e", upload)
        .await
        .unwrap_err();
    assert!(matches!(err, TutorError::InvalidArgument(_)));
    assert_eq!(
        fx.coordinator.ingestion().rejections(&session).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_demo_timestamp_advances_only_on_demo_chunks() {
    let fx = fixture(1_000).await;
    let session = fx.training_session("s").await;

    fx.coordinator
        .commit_chunk(&session, "e", demo_chunk(1, 1))
        .await
        .unwrap();
    let after_demo = fx.coordinator.get_session(&session).await.unwrap().resource;

    fx.clock.advance(std::time::Duration::from_secs(1));
    fx.coordinator
        .commit_chunk(&session, "e", inference_chunk(2, 1))
        .await
        .unwrap();
    let after_inference = fx.coordinator.get_session(&session).await.unwrap().resource;

    assert_eq!(
        after_inference.last_demo_data_received_micros,
        after_demo.last_demo_data_received_micros
    );
    assert!(after_inference.last_data_received_micros > after_demo.last_data_received_micros);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_one_active_assignment_under_concurrency() {
    let fx = fixture(1).await;
    let session = fx.training_session("s").await;

    let mut handles = Vec::new();
    for writer in 0..8 {
        let coordinator = Arc::clone(&fx.coordinator);
        let session = session.clone();
        handles.push(tokio::spawn(async move {
            let episode = format!("e{writer}");
            for sequence in 1..=5 {
                coordinator
                    .commit_chunk(&session, &episode, demo_chunk(sequence, 1))
                    .await
                    .unwrap();
                coordinator.tick().await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let assignments = fx
        .coordinator
        .scheduler()
        .list_assignments(&session)
        .await
        .unwrap();
    let active = assignments
        .iter()
        .filter(|a| !a.resource.is_terminal())
        .count();
    assert_eq!(active, 1);
    assert_eq!(assignments.len(), 1);

    let state = fx.coordinator.get_session(&session).await.unwrap().resource;
    assert_eq!(state.total_demo_steps, 40);
    assert_eq!(
        state.untrained_demo_steps + assignments[0].resource.demo_steps,
        40
    );
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ServiceConfig::default();
    config.store.journal_path = Some(dir.path().join("tutor.journal"));
    config.scheduler.training_threshold_demo_steps = 2;

    let coordinator = Coordinator::open(config.clone()).await.unwrap();
    let project = coordinator.create_project("p", "Project").await.unwrap();
    let brain = coordinator
        .create_brain(&project.key, "b", "Brain", serde_json::json!({}))
        .await
        .unwrap();
    let session = coordinator
        .create_session(&brain.key, NewSession::training().with_id("s"))
        .await
        .unwrap();
    coordinator
        .commit_chunk(&session.key, "e", demo_chunk(1, 2))
        .await
        .unwrap();
    coordinator.shutdown().await.unwrap();

    // Writes after shutdown are refused
    assert!(coordinator
        .end_session(&session.key, SessionStatus::Success)
        .await
        .is_err());

    let reopened = Coordinator::open(config).await.unwrap();
    let state = reopened.get_session(&session.key).await.unwrap().resource;
    assert_eq!(state.total_demo_steps, 2);
    assert!(state.active_assignment_id.is_some());
    assert_eq!(
        reopened
            .ingestion()
            .read_chunks(&session.key.episode("e"), 0)
            .await
            .unwrap()
            .len(),
        1
    );
    assert!(reopened.store().exists(&brain.key).await.unwrap());
    reopened.shutdown().await.unwrap();
}
