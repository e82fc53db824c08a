//! Sessions: one training, inference or evaluation run of a brain

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::episode::{ChunkWatermark, StepClassification};
use crate::{Result, TutorError};

/// What the client intends to do with a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    /// Demonstrations are trained on as they arrive
    InteractiveTraining,
    /// Serve a model only
    Inference,
    /// Score models without training
    Evaluation,
}

impl SessionType {
    /// Whether assignments are ever scheduled for this session
    #[must_use]
    pub fn trains(self) -> bool {
        matches!(self, Self::InteractiveTraining)
    }
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Accepting data
    Running,
    /// Ended normally
    Success,
    /// Ended by the client before completion
    Aborted,
    /// Ended by the service for inactivity
    Expired,
}

impl SessionStatus {
    /// Terminal statuses accept no further data
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// One run of a brain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Session identifier
    pub session_id: String,
    /// Session intent
    pub session_type: SessionType,
    /// Lifecycle status
    pub status: SessionStatus,
    /// Creation time
    pub created_micros: u64,
    /// End time, set on the terminal transition
    pub ended_micros: Option<u64>,
    /// Time of the most recent committed chunk
    pub last_data_received_micros: u64,
    /// Time of the most recent committed chunk holding demonstrations
    pub last_demo_data_received_micros: u64,
    /// Snapshots the session was started from
    pub starting_snapshot_ids: Vec<String>,
    /// Snapshot written when the session ended
    pub resulting_snapshot_id: Option<String>,
    /// The single non-terminal assignment, if any
    pub active_assignment_id: Option<String>,
    /// Demonstration steps not yet covered by an assignment
    pub untrained_demo_steps: u64,
    /// Demonstration steps committed over the session lifetime
    pub total_demo_steps: u64,
    /// Inference steps committed over the session lifetime
    pub total_inference_steps: u64,
    /// Number of assignments created
    pub assignment_count: u64,
    /// Most recent chunk committed to any episode of the session
    pub last_chunk: Option<ChunkWatermark>,
    /// Most recently recorded model
    pub latest_model_id: Option<String>,
    /// Demo-data watermark of the latest model
    pub trained_demo_watermark_micros: u64,
    /// Highest chunk sequence per episode already counted above
    #[serde(default)]
    pub accounted_sequences: BTreeMap<String, u64>,
}

impl Session {
    /// Create a running session
    pub fn new(
        session_id: impl Into<String>,
        session_type: SessionType,
        starting_snapshot_ids: Vec<String>,
        now_micros: u64,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            session_type,
            status: SessionStatus::Running,
            created_micros: now_micros,
            ended_micros: None,
            last_data_received_micros: 0,
            last_demo_data_received_micros: 0,
            starting_snapshot_ids,
            resulting_snapshot_id: None,
            active_assignment_id: None,
            untrained_demo_steps: 0,
            total_demo_steps: 0,
            total_inference_steps: 0,
            assignment_count: 0,
            last_chunk: None,
            latest_model_id: None,
            trained_demo_watermark_micros: 0,
            accounted_sequences: BTreeMap::new(),
        }
    }

    /// Whether the session has ended
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Fail unless the session still accepts work
    pub fn ensure_running(&self) -> Result<()> {
        if self.is_terminal() {
            return Err(TutorError::InvalidState(format!(
                "session {} is {:?}",
                self.session_id, self.status
            )));
        }
        Ok(())
    }

    /// Highest sequence of an episode already counted in the totals
    #[must_use]
    pub fn accounted_sequence(&self, episode_id: &str) -> u64 {
        self.accounted_sequences.get(episode_id).copied().unwrap_or(0)
    }

    /// Account for a committed chunk; `false` if it was already counted
    ///
    /// The demo timestamp only moves forward, and only for chunks that
    /// contain demonstration steps.
    pub fn record_chunk(
        &mut self,
        watermark: ChunkWatermark,
        classification: StepClassification,
        demo_steps: u64,
        inference_steps: u64,
        now_micros: u64,
    ) -> bool {
        if watermark.sequence <= self.accounted_sequence(&watermark.episode_id) {
            return false;
        }
        self.accounted_sequences
            .insert(watermark.episode_id.clone(), watermark.sequence);
        self.last_data_received_micros = self.last_data_received_micros.max(now_micros);
        if classification.includes_demonstrations() {
            self.last_demo_data_received_micros =
                self.last_demo_data_received_micros.max(now_micros);
        }
        self.untrained_demo_steps += demo_steps;
        self.total_demo_steps += demo_steps;
        self.total_inference_steps += inference_steps;
        self.last_chunk = Some(watermark);
        true
    }

    /// Whether a new assignment may be created at the given demo threshold
    #[must_use]
    pub fn is_training_eligible(&self, threshold_demo_steps: u64) -> bool {
        self.session_type.trains()
            && !self.is_terminal()
            && self.active_assignment_id.is_none()
            && self.untrained_demo_steps > 0
            && self.untrained_demo_steps >= threshold_demo_steps
    }

    /// Move to a terminal status
    pub fn end(&mut self, status: SessionStatus, now_micros: u64) -> Result<()> {
        if !status.is_terminal() {
            return Err(TutorError::InvalidArgument(
                "a session can only end in a terminal status".into(),
            ));
        }
        self.ensure_running()?;
        self.status = status;
        self.ended_micros = Some(now_micros);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watermark(sequence: u64) -> ChunkWatermark {
        ChunkWatermark {
            episode_id: "e".into(),
            sequence,
        }
    }

    #[test]
    fn test_demo_timestamp_only_moves_on_demo_chunks() {
        let mut session = Session::new("s", SessionType::InteractiveTraining, vec![], 0);
        session.record_chunk(watermark(1), StepClassification::DemonstrationOnly, 2, 0, 100);
        session.record_chunk(watermark(2), StepClassification::InferenceOnly, 0, 3, 200);

        assert_eq!(session.last_demo_data_received_micros, 100);
        assert_eq!(session.last_data_received_micros, 200);
        assert_eq!(session.untrained_demo_steps, 2);
        assert_eq!(session.total_inference_steps, 3);

        // A stale clock never rewinds the timestamps
        session.record_chunk(watermark(3), StepClassification::Mixed, 1, 1, 50);
        assert_eq!(session.last_demo_data_received_micros, 100);
        assert_eq!(session.last_data_received_micros, 200);
    }

    #[test]
    fn test_chunk_is_counted_once() {
        let mut session = Session::new("s", SessionType::InteractiveTraining, vec![], 0);
        assert!(session.record_chunk(watermark(1), StepClassification::DemonstrationOnly, 4, 0, 10));
        assert!(!session.record_chunk(watermark(1), StepClassification::DemonstrationOnly, 4, 0, 20));
        assert_eq!(session.total_demo_steps, 4);
        assert_eq!(session.last_data_received_micros, 10);
        assert_eq!(session.accounted_sequence("e"), 1);
        assert_eq!(session.accounted_sequence("other"), 0);
    }

    #[test]
    fn test_eligibility() {
        let mut session = Session::new("s", SessionType::InteractiveTraining, vec![], 0);
        assert!(!session.is_training_eligible(0));

        session.untrained_demo_steps = 3;
        assert!(session.is_training_eligible(3));
        assert!(!session.is_training_eligible(4));

        session.active_assignment_id = Some("a".into());
        assert!(!session.is_training_eligible(3));

        let mut inference = Session::new("i", SessionType::Inference, vec![], 0);
        inference.untrained_demo_steps = 10;
        assert!(!inference.is_training_eligible(1));
    }

    #[test]
    fn test_end_is_terminal_once() {
        let mut session = Session::new("s", SessionType::Inference, vec![], 0);
        assert!(session.end(SessionStatus::Running, 1).is_err());
        session.end(SessionStatus::Aborted, 5).unwrap();
        assert_eq!(session.ended_micros, Some(5));
        assert!(matches!(
            session.end(SessionStatus::Success, 6),
            Err(TutorError::InvalidState(_))
        ));
    }
}
