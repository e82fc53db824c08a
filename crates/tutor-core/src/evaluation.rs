//! Append-only evaluation records

use serde::{Deserialize, Serialize};

/// Batch evaluation of a model against a versioned evaluation set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineEvaluation {
    /// Record identifier
    pub evaluation_id: String,
    /// Evaluated model
    pub model_id: String,
    /// Evaluation-set version; scores across versions are not comparable
    pub evaluation_set_version: u64,
    /// Loss, lower is better
    pub score: f64,
    /// Record time
    pub created_micros: u64,
}

/// In-episode evaluation of a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnlineEvaluation {
    /// Record identifier
    pub evaluation_id: String,
    /// Evaluated model
    pub model_id: String,
    /// Episode the score was measured in
    pub episode_id: String,
    /// Task score, higher is better
    pub score: f64,
    /// Record time
    pub created_micros: u64,
}

/// Aggregate of a set of scores
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreSummary {
    /// Number of scores
    pub count: usize,
    /// Arithmetic mean
    pub mean: f64,
    /// Lowest score
    pub min: f64,
    /// Highest score
    pub max: f64,
}

impl ScoreSummary {
    /// Summarize scores; `None` when there are none
    pub fn from_scores(scores: impl IntoIterator<Item = f64>) -> Option<Self> {
        let mut count = 0usize;
        let mut total = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for score in scores {
            count += 1;
            total += score;
            min = min.min(score);
            max = max.max(score);
        }
        (count > 0).then(|| Self {
            count,
            mean: total / count as f64,
            min,
            max,
        })
    }
}
