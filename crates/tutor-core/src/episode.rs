//! Episodes and the chunks committed to them

use serde::{Deserialize, Serialize};

use crate::{Result, TutorError};

/// Who chose the action recorded in a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionSource {
    /// A human played the step
    HumanDemonstration,
    /// A served model played the step
    BrainAction,
    /// No action was taken
    NoAction,
}

/// One per-step record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Observation payload, opaque to the coordinator
    pub observation: serde_json::Value,
    /// Action payload, opaque to the coordinator
    pub action: serde_json::Value,
    /// Reward received
    pub reward: f64,
    /// Origin of the action
    pub source: ActionSource,
    /// Client-side step time
    pub timestamp_micros: u64,
}

impl Step {
    /// Whether a human demonstrated this step
    #[must_use]
    pub fn is_demonstration(&self) -> bool {
        self.source == ActionSource::HumanDemonstration
    }
}

/// Mix of step origins in a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepClassification {
    /// Every step is a demonstration
    DemonstrationOnly,
    /// No step is a demonstration
    InferenceOnly,
    /// Both kinds are present
    Mixed,
}

impl StepClassification {
    /// Classify a list of steps; an empty list holds no demonstrations
    #[must_use]
    pub fn of(steps: &[Step]) -> Self {
        let demos = steps.iter().filter(|step| step.is_demonstration()).count();
        match demos {
            0 => Self::InferenceOnly,
            n if n == steps.len() => Self::DemonstrationOnly,
            _ => Self::Mixed,
        }
    }

    /// Whether the chunk carries any demonstration steps
    #[must_use]
    pub fn includes_demonstrations(self) -> bool {
        !matches!(self, Self::InferenceOnly)
    }
}

/// Client-reported state of the episode at the end of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeState {
    /// More chunks follow
    #[default]
    InProgress,
    /// Goal reached
    Success,
    /// Goal missed
    Failure,
    /// Stopped by the client
    Aborted,
    /// Stopped by the player
    GaveUp,
}

impl EpisodeState {
    /// Whether the episode accepts no further chunks
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// Position of a chunk within a session's data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkWatermark {
    /// Episode identifier
    pub episode_id: String,
    /// Chunk sequence within the episode
    pub sequence: u64,
}

/// Ordered stream of chunks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    /// Episode identifier
    pub episode_id: String,
    /// Time of the first chunk
    pub created_micros: u64,
    /// Sequence of the most recent committed chunk, 0 before the first
    pub last_sequence: u64,
    /// Demonstration steps committed
    pub demo_steps: u64,
    /// Non-demonstration steps committed
    pub inference_steps: u64,
    /// State after the most recent chunk
    pub state: EpisodeState,
    /// Time of the most recent commit
    pub last_committed_micros: u64,
}

impl Episode {
    /// Create an episode with no committed chunks
    pub fn new(episode_id: impl Into<String>, now_micros: u64) -> Self {
        Self {
            episode_id: episode_id.into(),
            created_micros: now_micros,
            last_sequence: 0,
            demo_steps: 0,
            inference_steps: 0,
            state: EpisodeState::InProgress,
            last_committed_micros: now_micros,
        }
    }

    /// Sequence the next chunk must carry
    #[must_use]
    pub fn next_sequence(&self) -> u64 {
        self.last_sequence + 1
    }

    /// Advance past a committed chunk
    pub fn advance(&mut self, chunk: &EpisodeChunk, now_micros: u64) -> Result<()> {
        if self.state.is_terminal() {
            return Err(TutorError::InvalidState(format!(
                "episode {} already ended as {:?}",
                self.episode_id, self.state
            )));
        }
        if chunk.sequence != self.next_sequence() {
            return Err(TutorError::OutOfOrder {
                episode: self.episode_id.clone(),
                expected: self.next_sequence(),
                actual: chunk.sequence,
            });
        }
        self.last_sequence = chunk.sequence;
        self.demo_steps += chunk.demo_steps();
        self.inference_steps += chunk.inference_steps();
        self.state = chunk.episode_state;
        self.last_committed_micros = now_micros;
        Ok(())
    }
}

/// An ordered, immutable slice of per-step data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeChunk {
    /// Episode the chunk belongs to
    pub episode_id: String,
    /// Position within the episode, starting at 1
    pub sequence: u64,
    /// Commit time, stamped by the coordinator
    pub created_micros: u64,
    /// Client-declared step mix
    pub classification: StepClassification,
    /// Episode state after the last step
    #[serde(default)]
    pub episode_state: EpisodeState,
    /// Model that served inference steps, if any
    #[serde(default)]
    pub model_id: Option<String>,
    /// Step payload
    pub steps: Vec<Step>,
}

impl EpisodeChunk {
    /// Number of demonstration steps
    #[must_use]
    pub fn demo_steps(&self) -> u64 {
        self.steps.iter().filter(|step| step.is_demonstration()).count() as u64
    }

    /// Number of non-demonstration steps
    #[must_use]
    pub fn inference_steps(&self) -> u64 {
        self.steps.len() as u64 - self.demo_steps()
    }

    /// Whether `other` carries the same client payload, ignoring commit time
    #[must_use]
    pub fn same_payload(&self, other: &Self) -> bool {
        self.episode_id == other.episode_id
            && self.sequence == other.sequence
            && self.classification == other.classification
            && self.episode_state == other.episode_state
            && self.model_id == other.model_id
            && self.steps == other.steps
    }

    /// Check the declared classification against the steps
    pub fn validate(&self) -> Result<()> {
        if self.sequence == 0 {
            return Err(TutorError::InvalidArgument(
                "chunk sequence numbers start at 1".into(),
            ));
        }
        let actual = StepClassification::of(&self.steps);
        if actual != self.classification {
            return Err(TutorError::InvalidArgument(format!(
                "chunk {} of episode {} is tagged {:?} but its steps are {:?}",
                self.sequence, self.episode_id, self.classification, actual
            )));
        }
        Ok(())
    }
}

/// Audit record of a chunk the pipeline refused
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedChunk {
    /// Audit record identifier
    pub rejection_id: String,
    /// Target episode
    pub episode_id: String,
    /// Sequence the client sent
    pub sequence: u64,
    /// Time of the rejection
    pub created_micros: u64,
    /// Rendered error
    pub reason: String,
}
