//! Offline and online evaluation records
//!
//! Evaluations are append-only children of the model they score. Offline
//! scores are losses (lower is better) and are only comparable within one
//! evaluation-set version; online scores are task returns (higher is better).

use tracing::debug;
use tutor_core::{
    OfflineEvaluation, OnlineEvaluation, ResourceKey, ResourceKind, Result, ScoreSummary,
    StoreExt, TutorError, Versioned,
};

use crate::context::ServiceContext;

/// Records and aggregates evaluation results
#[derive(Debug, Clone)]
pub struct EvaluationTracker {
    ctx: ServiceContext,
}

impl EvaluationTracker {
    /// Create a tracker over the shared context
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    /// Append an offline score for a model
    pub async fn record_offline_evaluation(
        &self,
        model_key: &ResourceKey,
        evaluation_set_version: u64,
        score: f64,
    ) -> Result<Versioned<OfflineEvaluation>> {
        ensure_model_key(model_key)?;
        ensure_finite(score)?;

        let evaluation = OfflineEvaluation {
            evaluation_id: ServiceContext::new_id(),
            model_id: model_key.id().to_string(),
            evaluation_set_version,
            score,
            created_micros: self.ctx.now(),
        };
        let key = model_key.offline_evaluation(&evaluation.evaluation_id);
        let revision = self.ctx.store.create_entity(&key, evaluation.clone()).await?;
        debug!(
            "Recorded offline score {score} for {model_key} at set version {evaluation_set_version}"
        );
        Ok(Versioned {
            key,
            revision,
            resource: evaluation,
        })
    }

    /// Append an online score for a model
    pub async fn record_online_evaluation(
        &self,
        model_key: &ResourceKey,
        episode_id: &str,
        score: f64,
    ) -> Result<Versioned<OnlineEvaluation>> {
        ensure_model_key(model_key)?;
        ensure_finite(score)?;
        tutor_core::key::validate_id(episode_id)?;

        let evaluation = OnlineEvaluation {
            evaluation_id: ServiceContext::new_id(),
            model_id: model_key.id().to_string(),
            episode_id: episode_id.to_string(),
            score,
            created_micros: self.ctx.now(),
        };
        let key = model_key.online_evaluation(&evaluation.evaluation_id);
        let revision = self.ctx.store.create_entity(&key, evaluation.clone()).await?;
        debug!("Recorded online score {score} for {model_key} in episode {episode_id}");
        Ok(Versioned {
            key,
            revision,
            resource: evaluation,
        })
    }

    /// Every offline score of a model
    pub async fn offline_evaluations(
        &self,
        model_key: &ResourceKey,
    ) -> Result<Vec<OfflineEvaluation>> {
        ensure_model_key(model_key)?;
        Ok(self
            .ctx
            .store
            .list_children::<OfflineEvaluation>(model_key)
            .await?
            .into_iter()
            .map(|item| item.resource)
            .collect())
    }

    /// Every online score of a model
    pub async fn online_evaluations(&self, model_key: &ResourceKey) -> Result<Vec<OnlineEvaluation>> {
        ensure_model_key(model_key)?;
        Ok(self
            .ctx
            .store
            .list_children::<OnlineEvaluation>(model_key)
            .await?
            .into_iter()
            .map(|item| item.resource)
            .collect())
    }

    /// Aggregate offline scores at one evaluation-set version
    pub async fn offline_summary(
        &self,
        model_key: &ResourceKey,
        evaluation_set_version: u64,
    ) -> Result<Option<ScoreSummary>> {
        let evaluations = self.offline_evaluations(model_key).await?;
        Ok(ScoreSummary::from_scores(
            evaluations
                .iter()
                .filter(|e| e.evaluation_set_version == evaluation_set_version)
                .map(|e| e.score),
        ))
    }

    /// Aggregate every online score
    pub async fn online_summary(&self, model_key: &ResourceKey) -> Result<Option<ScoreSummary>> {
        let evaluations = self.online_evaluations(model_key).await?;
        Ok(ScoreSummary::from_scores(evaluations.iter().map(|e| e.score)))
    }
}

fn ensure_model_key(key: &ResourceKey) -> Result<()> {
    if key.kind() == ResourceKind::Model {
        Ok(())
    } else {
        Err(TutorError::InvalidArgument(format!("{key} is not a model")))
    }
}

fn ensure_finite(score: f64) -> Result<()> {
    if score.is_finite() {
        Ok(())
    } else {
        Err(TutorError::InvalidArgument(format!(
            "evaluation score {score} is not finite"
        )))
    }
}
