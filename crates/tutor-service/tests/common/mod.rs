#![allow(dead_code)]

use std::sync::Arc;

use tutor_core::{ActionSource, ManualClock, MemoryStore, ResourceKey, ResourceStore, Step};
use tutor_service::{ChunkUpload, Coordinator, NewSession, ServiceConfig};

pub const START_MICROS: u64 = 1_700_000_000_000_000;
pub const LEASE_MS: u64 = 1_000;

pub struct Fixture {
    pub coordinator: Arc<Coordinator>,
    pub clock: Arc<ManualClock>,
    pub brain: ResourceKey,
}

pub fn config(threshold: u64) -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.scheduler.training_threshold_demo_steps = threshold;
    config.scheduler.lease_duration_ms = LEASE_MS;
    config.scheduler.claim_timeout_ms = 50;
    config.scheduler.reap_interval_ms = 10;
    config.retry.max_attempts = 64;
    config
}

pub async fn fixture(threshold: u64) -> Fixture {
    fixture_with(Arc::new(MemoryStore::new()), config(threshold)).await
}

pub async fn fixture_with(store: Arc<dyn ResourceStore>, config: ServiceConfig) -> Fixture {
    let clock = Arc::new(ManualClock::new(START_MICROS));
    let coordinator = Coordinator::new(store, clock.clone(), config);
    let project = coordinator.create_project("p", "Project").await.unwrap();
    let brain = coordinator
        .create_brain(&project.key, "b", "Brain", serde_json::json!({"obs": [4], "act": [2]}))
        .await
        .unwrap();

    Fixture {
        coordinator: Arc::new(coordinator),
        clock,
        brain: brain.key,
    }
}

impl Fixture {
    pub async fn training_session(&self, id: &str) -> ResourceKey {
        self.coordinator
            .create_session(&self.brain, NewSession::training().with_id(id))
            .await
            .unwrap()
            .key
    }
}

pub fn step(source: ActionSource) -> Step {
    Step {
        observation: serde_json::json!([0.1, 0.2, 0.3, 0.4]),
        action: serde_json::json!([1.0, 0.0]),
        reward: 0.0,
        source,
        timestamp_micros: 0,
    }
}

pub fn demo_chunk(sequence: u64, demo_steps: usize) -> ChunkUpload {
    ChunkUpload::new(
        sequence,
        (0..demo_steps)
            .map(|_| step(ActionSource::HumanDemonstration))
            .collect(),
    )
}

pub fn inference_chunk(sequence: u64, steps: usize) -> ChunkUpload {
    ChunkUpload::new(
        sequence,
        (0..steps).map(|_| step(ActionSource::BrainAction)).collect(),
    )
}
