//! Trained model artifacts

use serde::{Deserialize, Serialize};

use crate::episode::ChunkWatermark;
use crate::key::ResourceKey;

/// Where the trained artifact lives
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelArtifact {
    /// Artifact paths, as written by the learner
    pub paths: Vec<String>,
    /// Total size on disk
    pub size_bytes: u64,
}

/// Inference latency measured by the learner
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    /// Mean inference latency
    #[serde(default)]
    pub mean_inference_micros: Option<u64>,
    /// Worst observed inference latency
    #[serde(default)]
    pub max_inference_micros: Option<u64>,
    /// Legacy average latency; ignored on write
    #[deprecated(note = "read-only for records written by older learners")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_latency_ms: Option<f64>,
    /// Legacy maximum latency; ignored on write
    #[deprecated(note = "read-only for records written by older learners")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_latency_ms: Option<f64>,
}

impl LatencyStats {
    /// Drop values for deprecated fields before a new record is stored
    #[allow(deprecated)]
    pub fn strip_deprecated(&mut self) {
        self.average_latency_ms = None;
        self.max_latency_ms = None;
    }
}

/// Training counters reported with a model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingStats {
    /// Optimizer steps completed
    pub training_steps: u64,
    /// Examples consumed
    pub training_examples: u64,
    /// Progress fraction at the time the model was written
    pub training_fraction: f64,
    /// Latency measurements
    #[serde(default)]
    pub latency: LatencyStats,
}

/// One immutable trained artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    /// Model identifier
    pub model_id: String,
    /// Session that trained it
    pub session_id: String,
    /// Assignment that produced it
    pub assignment_id: String,
    /// Creation time
    pub created_micros: u64,
    /// Stored artifact
    pub artifact: ModelArtifact,
    /// Most recent demonstration timestamp trained through
    pub demo_watermark_micros: u64,
    /// Last chunk visible to the assignment
    pub chunk_watermark: Option<ChunkWatermark>,
    /// Training counters
    pub stats: TrainingStats,
}

/// Brain-scoped reference to a model
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelRef {
    /// Session the model lives under
    pub session_id: String,
    /// Model identifier
    pub model_id: String,
}

impl ModelRef {
    /// Create a reference
    pub fn new(session_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            model_id: model_id.into(),
        }
    }

    /// Resolve the reference under a brain key
    #[must_use]
    pub fn key(&self, brain: &ResourceKey) -> ResourceKey {
        brain.session(&self.session_id).model(&self.model_id)
    }
}
