//! The training contract the worker drives

use std::collections::VecDeque;
use std::path::PathBuf;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::debug;
use tutor_core::{
    Assignment, EpisodeChunk, ModelArtifact, Result, Step, TrainingStats, TutorError,
};

/// Everything a trainer sees about the work it was given
#[derive(Debug, Clone)]
pub struct TrainingContext {
    /// The claimed assignment
    pub assignment: Assignment,
    /// Observation/action spec of the brain
    pub brain_spec: serde_json::Value,
    /// Chunks visible to the assignment, by episode then sequence
    pub chunks: Vec<EpisodeChunk>,
}

impl TrainingContext {
    /// Commit time of the newest chunk holding demonstrations
    #[must_use]
    pub fn most_recent_demo_micros(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|chunk| chunk.classification.includes_demonstrations())
            .map(|chunk| chunk.created_micros)
            .max()
            .unwrap_or(0)
    }
}

/// A model the trainer wants stored
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    /// Where the trainer wrote it
    pub artifact: ModelArtifact,
    /// Counters at the time it was written
    pub stats: TrainingStats,
}

/// Result of one training increment
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingUpdate {
    /// Planned work done so far, in `0.0..=1.0`
    pub fraction: f64,
    /// Newest demonstration trained on
    pub most_recent_demo_micros: u64,
    /// Model to record after this increment
    pub checkpoint: Option<Checkpoint>,
    /// Whether training for the assignment is finished
    pub done: bool,
}

/// A black-box incremental trainer
#[async_trait]
pub trait Trainer: Send {
    /// Prepare for a new assignment
    async fn begin(&mut self, context: TrainingContext) -> Result<()>;

    /// Train one increment of the current assignment
    async fn train_increment(&mut self) -> Result<TrainingUpdate>;

    /// Drop all state of the current assignment
    fn reset(&mut self);
}

/// Settings for [`DemoReplayTrainer`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// Increments per assignment
    pub increments: usize,
    /// Demonstration steps sampled per increment
    pub batch_size: usize,
    /// Record a checkpoint every this many increments
    pub checkpoint_every: usize,
    /// Replay capacity
    pub buffer_size: usize,
    /// Directory artifacts are written to
    pub artifact_dir: PathBuf,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            increments: 4,
            batch_size: 32,
            checkpoint_every: 2,
            buffer_size: 10_000,
            artifact_dir: PathBuf::from("models"),
        }
    }
}

/// Behavior-cloning style trainer over a replay buffer of demonstrations
///
/// The "model" it writes is a JSON summary of what it sampled; the
/// coordinator only cares that an artifact exists and where.
#[derive(Debug)]
pub struct DemoReplayTrainer {
    config: TrainerConfig,
    context: Option<TrainingContext>,
    buffer: VecDeque<Step>,
    increment: usize,
    examples: u64,
    reward_sum: f64,
}

impl DemoReplayTrainer {
    /// Create an idle trainer
    #[must_use]
    pub fn new(config: TrainerConfig) -> Self {
        Self {
            config,
            context: None,
            buffer: VecDeque::new(),
            increment: 0,
            examples: 0,
            reward_sum: 0.0,
        }
    }

    fn push(&mut self, step: Step) {
        if self.buffer.len() >= self.config.buffer_size {
            self.buffer.pop_front();
        }
        self.buffer.push_back(step);
    }

    async fn write_artifact(&self, context: &TrainingContext) -> Result<ModelArtifact> {
        let path = self.config.artifact_dir.join(format!(
            "{}-{:04}.json",
            context.assignment.assignment_id, self.increment
        ));
        let mean_reward = if self.examples == 0 {
            0.0
        } else {
            self.reward_sum / self.examples as f64
        };
        let payload = serde_json::json!({
            "assignment_id": context.assignment.assignment_id,
            "increment": self.increment,
            "examples": self.examples,
            "mean_reward": mean_reward,
            "brain_spec": context.brain_spec,
        });
        let bytes = serde_json::to_vec_pretty(&payload)?;
        tokio::fs::create_dir_all(&self.config.artifact_dir).await?;
        tokio::fs::write(&path, &bytes).await?;
        Ok(ModelArtifact {
            paths: vec![path.display().to_string()],
            size_bytes: bytes.len() as u64,
        })
    }
}

#[async_trait]
impl Trainer for DemoReplayTrainer {
    async fn begin(&mut self, context: TrainingContext) -> Result<()> {
        self.reset();
        let steps: Vec<Step> = context
            .chunks
            .iter()
            .flat_map(|chunk| chunk.steps.iter())
            .filter(|step| step.is_demonstration())
            .cloned()
            .collect();
        if steps.is_empty() {
            return Err(TutorError::InvalidArgument(format!(
                "assignment {} has no demonstrations to train on",
                context.assignment.assignment_id
            )));
        }
        for step in steps {
            self.push(step);
        }
        debug!(
            "Loaded {} demonstration step(s) for {}",
            self.buffer.len(),
            context.assignment.assignment_id
        );
        self.context = Some(context);
        Ok(())
    }

    async fn train_increment(&mut self) -> Result<TrainingUpdate> {
        let Some(context) = self.context.take() else {
            return Err(TutorError::InvalidState("trainer has no assignment".into()));
        };

        let batch: Vec<f64> = {
            let steps: Vec<&Step> = self.buffer.iter().collect();
            let mut rng = rand::thread_rng();
            steps
                .choose_multiple(&mut rng, self.config.batch_size.min(steps.len()))
                .map(|step| step.reward)
                .collect()
        };
        self.increment += 1;
        self.examples += batch.len() as u64;
        self.reward_sum += batch.iter().sum::<f64>();

        let total = self.config.increments.max(1);
        let done = self.increment >= total;
        let checkpoint = if done || self.increment % self.config.checkpoint_every.max(1) == 0 {
            let artifact = self.write_artifact(&context).await;
            match artifact {
                Ok(artifact) => Some(Checkpoint {
                    artifact,
                    stats: TrainingStats {
                        training_steps: self.increment as u64,
                        training_examples: self.examples,
                        training_fraction: self.increment as f64 / total as f64,
                        latency: tutor_core::LatencyStats::default(),
                    },
                }),
                Err(e) => {
                    self.context = Some(context);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let update = TrainingUpdate {
            fraction: (self.increment as f64 / total as f64).min(1.0),
            most_recent_demo_micros: context.most_recent_demo_micros(),
            checkpoint,
            done,
        };
        self.context = Some(context);
        Ok(update)
    }

    fn reset(&mut self) {
        self.context = None;
        self.buffer.clear();
        self.increment = 0;
        self.examples = 0;
        self.reward_sum = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tutor_core::{ActionSource, EpisodeState, StepClassification};

    fn context(sources: &[ActionSource]) -> TrainingContext {
        let steps: Vec<Step> = sources
            .iter()
            .map(|source| Step {
                observation: serde_json::json!([0.0]),
                action: serde_json::json!([1.0]),
                reward: 1.0,
                source: *source,
                timestamp_micros: 0,
            })
            .collect();
        TrainingContext {
            assignment: Assignment::new("a", 1, 5, None, 0),
            brain_spec: serde_json::json!({}),
            chunks: vec![EpisodeChunk {
                episode_id: "e".into(),
                sequence: 1,
                created_micros: 5,
                classification: StepClassification::of(&steps),
                episode_state: EpisodeState::InProgress,
                model_id: None,
                steps,
            }],
        }
    }

    #[tokio::test]
    async fn test_increments_reach_completion_with_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = DemoReplayTrainer::new(TrainerConfig {
            increments: 3,
            checkpoint_every: 2,
            artifact_dir: dir.path().to_path_buf(),
            ..TrainerConfig::default()
        });
        trainer
            .begin(context(&[ActionSource::HumanDemonstration, ActionSource::BrainAction]))
            .await
            .unwrap();

        let mut updates = Vec::new();
        for _ in 0..3 {
            updates.push(trainer.train_increment().await.unwrap());
        }
        let checkpoints: Vec<bool> = updates.iter().map(|u| u.checkpoint.is_some()).collect();
        assert_eq!(checkpoints, vec![false, true, true]);
        assert!(updates[2].done);
        assert!((updates[2].fraction - 1.0).abs() < f64::EPSILON);
        assert_eq!(updates[0].most_recent_demo_micros, 5);

        let artifact = &updates[2].checkpoint.as_ref().unwrap().artifact;
        assert!(std::path::Path::new(&artifact.paths[0]).exists());
        assert!(artifact.size_bytes > 0);
    }

    #[tokio::test]
    async fn test_no_demonstrations_is_an_error() {
        let mut trainer = DemoReplayTrainer::new(TrainerConfig::default());
        let err = trainer
            .begin(context(&[ActionSource::BrainAction]))
            .await
            .unwrap_err();
        assert!(matches!(err, TutorError::InvalidArgument(_)));
        assert!(trainer.train_increment().await.is_err());
    }
}
