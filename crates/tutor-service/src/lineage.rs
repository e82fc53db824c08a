//! Models and the snapshot lineage DAG
//!
//! Snapshots are immutable once created and name their parents by id, so
//! the DAG lives entirely in the store as an arena of records. A snapshot
//! can only point at snapshots that already exist, which makes the cycle
//! check below a closure walk over existing edges.

use std::collections::{BTreeSet, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use tutor_core::{
    update, Assignment, Model, ModelArtifact, ModelRef, ResourceKey, ResourceKind, Result,
    Session, Snapshot, StoreExt, TrainingStats, TutorError, Versioned,
};

use crate::context::ServiceContext;
use crate::evaluation::EvaluationTracker;

/// Parameters of an explicit snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    /// Identifier to use; generated when absent
    pub snapshot_id: Option<String>,
    /// Display name
    pub display_name: String,
    /// Parent snapshots under the same brain
    pub ancestor_ids: Vec<String>,
}

/// What a best-model lookup is scoped to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum LineageTarget {
    /// A snapshot and everything it derives from
    Snapshot(String),
    /// A session's own models plus the lineage of its starting snapshots
    Session(String),
}

/// Records models and maintains snapshot lineage
#[derive(Debug, Clone)]
pub struct ModelManager {
    ctx: ServiceContext,
    evaluations: EvaluationTracker,
}

impl ModelManager {
    /// Create a manager over the shared context
    pub fn new(ctx: ServiceContext, evaluations: EvaluationTracker) -> Self {
        Self { ctx, evaluations }
    }

    /// Record a model produced by a running assignment
    ///
    /// The caller must hold the assignment's lease. The model's demo
    /// watermark is the most recent demonstration the learner reported
    /// training on, and may not fall behind the session's latest model.
    pub async fn record_model(
        &self,
        assignment_key: &ResourceKey,
        worker_id: &str,
        artifact: ModelArtifact,
        mut stats: TrainingStats,
    ) -> Result<Versioned<Model>> {
        let session_key = session_of(assignment_key)?;
        let now = self.ctx.now();

        let assignment: Versioned<Assignment> =
            self.ctx.store.get_entity(assignment_key).await?;
        assignment.resource.check_lease(worker_id, now)?;
        let watermark = match assignment.resource.progress.most_recent_demo_micros {
            0 => assignment.resource.demo_watermark_micros,
            reported => reported,
        };

        let session: Versioned<Session> = self.ctx.store.get_entity(&session_key).await?;
        if watermark < session.resource.trained_demo_watermark_micros {
            return Err(TutorError::ProgressRegression {
                field: "demo_watermark_micros",
                previous: session.resource.trained_demo_watermark_micros.to_string(),
                reported: watermark.to_string(),
            });
        }

        let model_id = ServiceContext::new_id();
        let (assignment, ()) = update(
            self.ctx.store.as_ref(),
            assignment_key,
            &self.ctx.retry,
            |assignment: &mut Assignment| {
                assignment.check_lease(worker_id, now)?;
                assignment.model_ids.push(model_id.clone());
                Ok(())
            },
        )
        .await?;

        stats.latency.strip_deprecated();
        let model = Model {
            model_id: model_id.clone(),
            session_id: session.resource.session_id.clone(),
            assignment_id: assignment.resource.assignment_id.clone(),
            created_micros: now,
            artifact,
            demo_watermark_micros: watermark,
            chunk_watermark: assignment.resource.chunk_watermark.clone(),
            stats,
        };
        let model_key = session_key.model(&model_id);
        let revision = self.ctx.store.create_entity(&model_key, model.clone()).await?;

        update(
            self.ctx.store.as_ref(),
            &session_key,
            &self.ctx.retry,
            |session: &mut Session| {
                session.latest_model_id = Some(model_id.clone());
                session.trained_demo_watermark_micros =
                    session.trained_demo_watermark_micros.max(watermark);
                Ok(())
            },
        )
        .await?;

        info!("Recorded model {model_key} through demo time {watermark}");
        Ok(Versioned {
            key: model_key,
            revision,
            resource: model,
        })
    }

    /// Every model of a session, oldest first
    pub async fn session_models(&self, session_key: &ResourceKey) -> Result<Vec<Versioned<Model>>> {
        let mut models = self.ctx.store.list_children::<Model>(session_key).await?;
        models.sort_by(|a, b| {
            a.resource
                .created_micros
                .cmp(&b.resource.created_micros)
                .then_with(|| a.key.cmp(&b.key))
        });
        Ok(models)
    }

    /// Create a snapshot of a session's current state
    ///
    /// Ancestors must already exist under the same brain. An edge that
    /// would close a cycle is rejected with `CyclicLineage` before the
    /// snapshot id is checked for uniqueness.
    pub async fn create_snapshot(
        &self,
        session_key: &ResourceKey,
        request: SnapshotRequest,
    ) -> Result<Versioned<Snapshot>> {
        let brain_key = brain_of(session_key)?;
        let session: Versioned<Session> = self.ctx.store.get_entity(session_key).await?;

        let snapshot_id = request
            .snapshot_id
            .unwrap_or_else(ServiceContext::new_id);
        tutor_core::key::validate_id(&snapshot_id)?;

        let mut ancestor_ids = Vec::with_capacity(request.ancestor_ids.len());
        for id in request.ancestor_ids {
            if !ancestor_ids.contains(&id) {
                ancestor_ids.push(id);
            }
        }
        self.check_acyclic(&brain_key, &snapshot_id, &ancestor_ids)
            .await?;

        let models: Vec<ModelRef> = self
            .session_models(session_key)
            .await?
            .into_iter()
            .map(|model| ModelRef::new(&model.resource.session_id, &model.resource.model_id))
            .collect();
        let (model, size_bytes) = match &session.resource.latest_model_id {
            Some(model_id) => {
                let model_ref = ModelRef::new(&session.resource.session_id, model_id);
                let latest: Versioned<Model> =
                    self.ctx.store.get_entity(&model_ref.key(&brain_key)).await?;
                (Some(model_ref), latest.resource.artifact.size_bytes)
            }
            None => (None, 0),
        };

        let snapshot = Snapshot {
            snapshot_id: snapshot_id.clone(),
            display_name: request.display_name,
            created_micros: self.ctx.now(),
            session_id: session.resource.session_id.clone(),
            model,
            size_bytes,
            ancestor_ids,
            models,
        };
        let key = brain_key.snapshot(&snapshot_id);
        let revision = self.ctx.store.create_entity(&key, snapshot.clone()).await?;
        info!(
            "Created snapshot {key} with {} ancestor(s)",
            snapshot.ancestor_ids.len()
        );
        Ok(Versioned {
            key,
            revision,
            resource: snapshot,
        })
    }

    /// Fail if `snapshot_id` is reachable from any requested ancestor
    async fn check_acyclic(
        &self,
        brain_key: &ResourceKey,
        snapshot_id: &str,
        ancestor_ids: &[String],
    ) -> Result<()> {
        for root in ancestor_ids {
            if root == snapshot_id {
                return Err(TutorError::CyclicLineage {
                    snapshot: snapshot_id.to_string(),
                    ancestor: root.clone(),
                });
            }
            for reached in self.walk(brain_key, root).await? {
                if reached.snapshot_id == snapshot_id {
                    return Err(TutorError::CyclicLineage {
                        snapshot: snapshot_id.to_string(),
                        ancestor: root.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// `start` followed by its transitive ancestors in BFS order
    async fn walk(&self, brain_key: &ResourceKey, start: &str) -> Result<Vec<Snapshot>> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([start.to_string()]);
        let mut order = Vec::new();
        while let Some(id) = queue.pop_front() {
            if !visited.insert(id.clone()) {
                continue;
            }
            let snapshot: Versioned<Snapshot> =
                self.ctx.store.get_entity(&brain_key.snapshot(&id)).await?;
            queue.extend(
                snapshot
                    .resource
                    .ancestor_ids
                    .iter()
                    .filter(|parent| !visited.contains(*parent))
                    .cloned(),
            );
            order.push(snapshot.resource);
        }
        Ok(order)
    }

    /// Transitive ancestors of a snapshot, nearest first
    pub async fn ancestors(&self, brain_key: &ResourceKey, snapshot_id: &str) -> Result<Vec<Snapshot>> {
        let mut order = self.walk(brain_key, snapshot_id).await?;
        order.remove(0);
        Ok(order)
    }

    /// Models referenced by a snapshot and all of its ancestors
    pub async fn lineage_models(
        &self,
        brain_key: &ResourceKey,
        snapshot_id: &str,
    ) -> Result<Vec<ModelRef>> {
        let snapshots = self.walk(brain_key, snapshot_id).await?;
        Ok(collect_refs(&snapshots).into_iter().collect())
    }

    /// Pick the model to serve for a snapshot or session lineage
    ///
    /// Offline scores win when any candidate has them: only the newest
    /// evaluation-set version present is compared, and the lowest mean loss
    /// wins. Without offline scores the online scores decide, and there the
    /// direction flips: online scores are episode rewards, so the highest
    /// mean wins. Without any scores the most recent model is served. Ties
    /// go to the most recent model.
    pub async fn resolve_best_model(
        &self,
        brain_key: &ResourceKey,
        target: &LineageTarget,
    ) -> Result<Versioned<Model>> {
        let refs = match target {
            LineageTarget::Snapshot(snapshot_id) => {
                self.lineage_models(brain_key, snapshot_id).await?
            }
            LineageTarget::Session(session_id) => {
                let session_key = brain_key.session(session_id);
                let session: Versioned<Session> =
                    self.ctx.store.get_entity(&session_key).await?;
                let mut refs: BTreeSet<ModelRef> = self
                    .session_models(&session_key)
                    .await?
                    .into_iter()
                    .map(|m| ModelRef::new(&m.resource.session_id, &m.resource.model_id))
                    .collect();
                for start in &session.resource.starting_snapshot_ids {
                    refs.extend(self.lineage_models(brain_key, start).await?);
                }
                refs.into_iter().collect()
            }
        };
        if refs.is_empty() {
            return Err(TutorError::NotFound(format!(
                "no models in the lineage of {target:?} under {brain_key}"
            )));
        }

        let mut candidates = Vec::with_capacity(refs.len());
        for model_ref in &refs {
            let key = model_ref.key(brain_key);
            let model: Versioned<Model> = self.ctx.store.get_entity(&key).await?;
            let offline = self.evaluations.offline_evaluations(&key).await?;
            let online = self.evaluations.online_evaluations(&key).await?;
            candidates.push(Candidate {
                model,
                offline: offline
                    .into_iter()
                    .map(|e| (e.evaluation_set_version, e.score))
                    .collect(),
                online: online.into_iter().map(|e| e.score).collect(),
            });
        }

        let best = select_best(candidates).ok_or_else(|| {
            TutorError::NotFound(format!("no models in the lineage of {target:?}"))
        })?;
        debug!("Best model for {target:?} is {}", best.key);
        Ok(best)
    }
}

struct Candidate {
    model: Versioned<Model>,
    offline: Vec<(u64, f64)>,
    online: Vec<f64>,
}

fn mean(scores: impl IntoIterator<Item = f64>) -> Option<f64> {
    tutor_core::ScoreSummary::from_scores(scores).map(|summary| summary.mean)
}

fn select_best(candidates: Vec<Candidate>) -> Option<Versioned<Model>> {
    let newer = |a: &Versioned<Model>, b: &Versioned<Model>| {
        a.resource.created_micros > b.resource.created_micros
    };

    if let Some(version) = candidates
        .iter()
        .flat_map(|c| c.offline.iter().map(|(version, _)| *version))
        .max()
    {
        let mut best: Option<(f64, Versioned<Model>)> = None;
        for candidate in &candidates {
            let Some(loss) = mean(
                candidate
                    .offline
                    .iter()
                    .filter(|(v, _)| *v == version)
                    .map(|(_, score)| *score),
            ) else {
                continue;
            };
            let better = match &best {
                None => true,
                Some((best_loss, best_model)) => {
                    loss < *best_loss || (loss == *best_loss && newer(&candidate.model, best_model))
                }
            };
            if better {
                best = Some((loss, candidate.model.clone()));
            }
        }
        return best.map(|(_, model)| model);
    }

    let mut best: Option<(f64, Versioned<Model>)> = None;
    for candidate in &candidates {
        let Some(score) = mean(candidate.online.iter().copied()) else {
            continue;
        };
        let better = match &best {
            None => true,
            Some((best_score, best_model)) => {
                score > *best_score || (score == *best_score && newer(&candidate.model, best_model))
            }
        };
        if better {
            best = Some((score, candidate.model.clone()));
        }
    }
    if let Some((_, model)) = best {
        return Some(model);
    }

    candidates
        .into_iter()
        .map(|c| c.model)
        .reduce(|best, model| if newer(&model, &best) { model } else { best })
}

fn collect_refs(snapshots: &[Snapshot]) -> BTreeSet<ModelRef> {
    let mut refs = BTreeSet::new();
    for snapshot in snapshots {
        refs.extend(snapshot.model.iter().cloned());
        refs.extend(snapshot.models.iter().cloned());
    }
    refs
}

/// Session key owning an assignment key
pub(crate) fn session_of(assignment_key: &ResourceKey) -> Result<ResourceKey> {
    if assignment_key.kind() != ResourceKind::Assignment {
        return Err(TutorError::InvalidArgument(format!(
            "{assignment_key} is not an assignment"
        )));
    }
    assignment_key
        .ancestor(ResourceKind::Session)
        .ok_or_else(|| TutorError::InvalidArgument(format!("{assignment_key} has no session")))
}

/// Brain key owning a session key
pub(crate) fn brain_of(session_key: &ResourceKey) -> Result<ResourceKey> {
    if session_key.kind() != ResourceKind::Session {
        return Err(TutorError::InvalidArgument(format!(
            "{session_key} is not a session"
        )));
    }
    session_key
        .ancestor(ResourceKind::Brain)
        .ok_or_else(|| TutorError::InvalidArgument(format!("{session_key} has no brain")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tutor_core::Revision;

    fn model(id: &str, created_micros: u64) -> Versioned<Model> {
        Versioned {
            key: ResourceKey::project("p").brain("b").session("s").model(id),
            revision: Revision(1),
            resource: Model {
                model_id: id.into(),
                session_id: "s".into(),
                assignment_id: "a".into(),
                created_micros,
                artifact: ModelArtifact::default(),
                demo_watermark_micros: 0,
                chunk_watermark: None,
                stats: TrainingStats::default(),
            },
        }
    }

    fn candidate(id: &str, created: u64, offline: &[(u64, f64)], online: &[f64]) -> Candidate {
        Candidate {
            model: model(id, created),
            offline: offline.to_vec(),
            online: online.to_vec(),
        }
    }

    #[test]
    fn test_lowest_offline_loss_wins() {
        let best = select_best(vec![
            candidate("m1", 1, &[(1, 0.3)], &[]),
            candidate("m2", 2, &[(1, 0.1)], &[]),
        ])
        .unwrap();
        assert_eq!(best.resource.model_id, "m2");
    }

    #[test]
    fn test_only_newest_version_is_compared() {
        let best = select_best(vec![
            candidate("old", 1, &[(1, 0.01)], &[]),
            candidate("new", 2, &[(2, 0.5)], &[]),
        ])
        .unwrap();
        assert_eq!(best.resource.model_id, "new");
    }

    #[test]
    fn test_ties_go_to_most_recent() {
        let best = select_best(vec![
            candidate("m1", 5, &[(1, 0.2)], &[]),
            candidate("m2", 9, &[(1, 0.2)], &[]),
            candidate("m3", 7, &[(1, 0.2)], &[]),
        ])
        .unwrap();
        assert_eq!(best.resource.model_id, "m2");
    }

    #[test]
    fn test_online_fallback_then_recency() {
        let best = select_best(vec![
            candidate("m1", 1, &[], &[4.0, 6.0]),
            candidate("m2", 2, &[], &[1.0]),
        ])
        .unwrap();
        assert_eq!(best.resource.model_id, "m1");

        let best = select_best(vec![candidate("m1", 1, &[], &[]), candidate("m2", 2, &[], &[])])
            .unwrap();
        assert_eq!(best.resource.model_id, "m2");

        assert!(select_best(Vec::new()).is_none());
    }
}
