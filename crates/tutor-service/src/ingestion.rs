//! Episode chunk ingestion
//!
//! Chunk keys embed the sequence number, so creating the chunk key is the
//! point at which a commit takes effect: a duplicate create fails, and a
//! chunk is only created after its predecessor has advanced the episode.
//! Together these keep every episode a contiguous run starting at 1.
//!
//! The episode and session writes that follow a chunk are reconciled from
//! the stored chunks rather than trusted to the committing call, so a
//! commit that dies after its chunk landed is finished by whichever commit
//! touches the episode next, including an identical resend.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use tutor_core::{
    update_if, ChunkWatermark, Episode, EpisodeChunk, EpisodeState, ListFilter, Lister,
    RejectedChunk, ResourceKey, ResourceKind, Result, Revision, Session, Step,
    StepClassification, StoreExt, TutorError, Versioned,
};

use crate::context::ServiceContext;
use crate::scheduler::AssignmentScheduler;

/// A chunk as sent by a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkUpload {
    /// Position within the episode, starting at 1
    pub sequence: u64,
    /// Declared step mix; must match the steps
    pub classification: StepClassification,
    /// Episode state after the last step
    #[serde(default)]
    pub episode_state: EpisodeState,
    /// Model that served the inference steps
    #[serde(default)]
    pub model_id: Option<String>,
    /// Step payload
    pub steps: Vec<Step>,
}

impl ChunkUpload {
    /// Upload whose classification is derived from its steps
    pub fn new(sequence: u64, steps: Vec<Step>) -> Self {
        Self {
            sequence,
            classification: StepClassification::of(&steps),
            episode_state: EpisodeState::InProgress,
            model_id: None,
            steps,
        }
    }

    /// Mark the chunk as the last of its episode
    #[must_use]
    pub fn finishing(mut self, state: EpisodeState) -> Self {
        self.episode_state = state;
        self
    }
}

/// Result of a successful commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Key the chunk was stored under
    pub chunk_key: ResourceKey,
    /// Revision of the chunk write
    pub revision: Revision,
    /// Assignment created because this chunk crossed the threshold
    pub scheduled: Option<ResourceKey>,
    /// Whether the chunk was already stored by an earlier identical commit
    pub replayed: bool,
}

/// Appends chunks to episodes and keeps session counters current
#[derive(Debug, Clone)]
pub struct EpisodeIngestion {
    ctx: ServiceContext,
    scheduler: AssignmentScheduler,
}

impl EpisodeIngestion {
    /// Create the pipeline over the shared context
    pub fn new(ctx: ServiceContext, scheduler: AssignmentScheduler) -> Self {
        Self { ctx, scheduler }
    }

    /// Commit the next chunk of an episode
    ///
    /// Rejected commits are recorded as `RejectedChunk` entries under the
    /// session before the error is returned. `OutOfOrder` tells the client
    /// to resynchronize its sequence counter or start a new episode.
    /// Resending a chunk that is already stored with the same payload
    /// succeeds with `replayed` set.
    pub async fn commit_chunk(
        &self,
        session_key: &ResourceKey,
        episode_id: &str,
        upload: ChunkUpload,
    ) -> Result<CommitReceipt> {
        let sequence = upload.sequence;
        match self.try_commit(session_key, episode_id, upload).await {
            Ok(receipt) => Ok(receipt),
            Err(e) => {
                if matches!(
                    e,
                    TutorError::OutOfOrder { .. }
                        | TutorError::InvalidState(_)
                        | TutorError::InvalidArgument(_)
                ) {
                    self.record_rejection(session_key, episode_id, sequence, &e)
                        .await;
                }
                Err(e)
            }
        }
    }

    async fn try_commit(
        &self,
        session_key: &ResourceKey,
        episode_id: &str,
        upload: ChunkUpload,
    ) -> Result<CommitReceipt> {
        if session_key.kind() != ResourceKind::Session {
            return Err(TutorError::InvalidArgument(format!(
                "{session_key} is not a session"
            )));
        }
        tutor_core::key::validate_id(episode_id)?;

        let session: Versioned<Session> = self.ctx.store.get_entity(session_key).await?;
        session.resource.ensure_running()?;

        let now = self.ctx.now();
        let chunk = EpisodeChunk {
            episode_id: episode_id.to_string(),
            sequence: upload.sequence,
            created_micros: now,
            classification: upload.classification,
            episode_state: upload.episode_state,
            model_id: upload.model_id,
            steps: upload.steps,
        };
        chunk.validate()?;

        let episode_key = session_key.episode(episode_id);
        let mut episode = match self.ctx.store.get_entity::<Episode>(&episode_key).await {
            Ok(episode) => episode.resource,
            Err(TutorError::NotFound(_)) => {
                if chunk.sequence != 1 {
                    return Err(TutorError::OutOfOrder {
                        episode: episode_key.to_string(),
                        expected: 1,
                        actual: chunk.sequence,
                    });
                }
                let episode = Episode::new(episode_id, now);
                match self.ctx.store.create_entity(&episode_key, episode.clone()).await {
                    Ok(_) | Err(TutorError::AlreadyExists(_)) => {}
                    Err(e) => return Err(e),
                }
                episode
            }
            Err(e) => return Err(e),
        };

        if chunk.sequence > episode.next_sequence() {
            // A stored predecessor may not have advanced the episode yet
            self.settle(session_key, &episode_key, u64::MAX, None).await?;
            episode = self.ctx.store.get_entity::<Episode>(&episode_key).await?.resource;
        }
        if chunk.sequence < episode.next_sequence() {
            return self.replay(session_key, &episode_key, &chunk).await;
        }
        if episode.state.is_terminal() {
            return Err(TutorError::InvalidState(format!(
                "episode {episode_id} already ended as {:?}",
                episode.state
            )));
        }
        if chunk.sequence != episode.next_sequence() {
            return Err(TutorError::OutOfOrder {
                episode: episode_key.to_string(),
                expected: episode.next_sequence(),
                actual: chunk.sequence,
            });
        }

        let chunk_key = episode_key.chunk(chunk.sequence);
        let revision = match self.ctx.store.create_entity(&chunk_key, chunk.clone()).await {
            Ok(revision) => revision,
            Err(TutorError::AlreadyExists(_)) => {
                return self.replay(session_key, &episode_key, &chunk).await
            }
            Err(e) => return Err(e),
        };

        let session = self
            .settle(session_key, &episode_key, chunk.sequence, Some(&chunk))
            .await?;
        debug!(
            "Committed {chunk_key} ({} demo, {} inference step(s))",
            chunk.demo_steps(),
            chunk.inference_steps()
        );

        Ok(CommitReceipt {
            chunk_key,
            revision,
            scheduled: self.schedule_if_eligible(session_key, &session).await?,
            replayed: false,
        })
    }

    /// Answer a chunk whose sequence is already stored
    ///
    /// An identical resend is acknowledged with the stored revision after
    /// finishing any follow-up writes an earlier attempt left undone. A
    /// different payload under a taken sequence is out of order.
    async fn replay(
        &self,
        session_key: &ResourceKey,
        episode_key: &ResourceKey,
        chunk: &EpisodeChunk,
    ) -> Result<CommitReceipt> {
        let chunk_key = episode_key.chunk(chunk.sequence);
        let stored: Versioned<EpisodeChunk> = self.ctx.store.get_entity(&chunk_key).await?;
        let session = self
            .settle(session_key, episode_key, chunk.sequence, None)
            .await?;

        if !stored.resource.same_payload(chunk) {
            let episode: Versioned<Episode> = self.ctx.store.get_entity(episode_key).await?;
            return Err(TutorError::OutOfOrder {
                episode: episode_key.to_string(),
                expected: episode.resource.next_sequence(),
                actual: chunk.sequence,
            });
        }
        debug!("{chunk_key} was already committed, acknowledging resend");

        Ok(CommitReceipt {
            chunk_key,
            revision: stored.revision,
            scheduled: self.schedule_if_eligible(session_key, &session).await?,
            replayed: true,
        })
    }

    /// Bring the episode and session counters up to the stored chunks
    ///
    /// Covers every chunk of the episode up to `through` that is stored
    /// but not yet reflected in the episode's sequence or the session's
    /// totals. Both writes retry conflicts until they land, since the
    /// chunks they account for are already committed. `known` is the chunk
    /// just written, which spares a listing in the common case.
    async fn settle(
        &self,
        session_key: &ResourceKey,
        episode_key: &ResourceKey,
        through: u64,
        known: Option<&EpisodeChunk>,
    ) -> Result<Session> {
        let episode_id = episode_key.id().to_string();
        let session: Versioned<Session> = self.ctx.store.get_entity(session_key).await?;
        let accounted = session.resource.accounted_sequence(&episode_id);

        let pending: Vec<EpisodeChunk> = match known {
            Some(chunk) if chunk.sequence == accounted + 1 => vec![chunk.clone()],
            _ => self
                .read_chunks(episode_key, accounted)
                .await?
                .into_iter()
                .filter(|chunk| chunk.sequence <= through)
                .collect(),
        };
        if pending.is_empty() {
            return Ok(session.resource);
        }

        let persistent = self.ctx.retry.persistent();
        update_if(
            self.ctx.store.as_ref(),
            episode_key,
            &persistent,
            |episode: &mut Episode| {
                let mut advanced = false;
                for chunk in &pending {
                    if episode.state.is_terminal() || chunk.sequence != episode.next_sequence() {
                        continue;
                    }
                    episode.advance(chunk, chunk.created_micros)?;
                    advanced = true;
                }
                Ok(advanced.then_some(()))
            },
        )
        .await?;

        let recorded = update_if(
            self.ctx.store.as_ref(),
            session_key,
            &persistent,
            |session: &mut Session| {
                let mut changed = false;
                for chunk in &pending {
                    changed |= session.record_chunk(
                        ChunkWatermark {
                            episode_id: episode_id.clone(),
                            sequence: chunk.sequence,
                        },
                        chunk.classification,
                        chunk.demo_steps(),
                        chunk.inference_steps(),
                        chunk.created_micros,
                    );
                }
                Ok(changed.then_some(()))
            },
        )
        .await?;

        match recorded {
            Some((session, ())) => Ok(session.resource),
            None => Ok(self
                .ctx
                .store
                .get_entity::<Session>(session_key)
                .await?
                .resource),
        }
    }

    /// Create a pending assignment once the session crosses the threshold
    ///
    /// A conflict here leaves the session eligible; the next commit or
    /// scheduler sweep picks it up, so the commit still succeeds.
    async fn schedule_if_eligible(
        &self,
        session_key: &ResourceKey,
        session: &Session,
    ) -> Result<Option<ResourceKey>> {
        let threshold = self.scheduler.config().training_threshold_demo_steps;
        if !session.is_training_eligible(threshold) {
            return Ok(None);
        }
        match self.scheduler.ensure_pending(session_key, false).await {
            Ok(assignment) => Ok(assignment.map(|assignment| assignment.key)),
            Err(e) if e.is_retryable() => {
                warn!("Deferred scheduling of {session_key} to the next sweep: {e}");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn record_rejection(
        &self,
        session_key: &ResourceKey,
        episode_id: &str,
        sequence: u64,
        error: &TutorError,
    ) {
        warn!("Rejected chunk {sequence} of episode {episode_id} in {session_key}: {error}");
        let rejection = RejectedChunk {
            rejection_id: ServiceContext::new_id(),
            episode_id: episode_id.to_string(),
            sequence,
            created_micros: self.ctx.now(),
            reason: error.to_string(),
        };
        let key = session_key.rejected_chunk(&rejection.rejection_id);
        if let Err(e) = self.ctx.store.create_entity(&key, rejection).await {
            warn!("Failed to record rejection under {session_key}: {e}");
        }
    }

    /// Episodes of a session
    pub async fn list_episodes(&self, session_key: &ResourceKey) -> Result<Vec<Versioned<Episode>>> {
        self.ctx.store.list_children::<Episode>(session_key).await
    }

    /// Committed chunks of an episode after `after_sequence`, in order
    pub async fn read_chunks(
        &self,
        episode_key: &ResourceKey,
        after_sequence: u64,
    ) -> Result<Vec<EpisodeChunk>> {
        Ok(self
            .ctx
            .store
            .list_children::<EpisodeChunk>(episode_key)
            .await?
            .into_iter()
            .map(|item| item.resource)
            .filter(|chunk| chunk.sequence > after_sequence)
            .collect())
    }

    /// Sequence numbers missing below the highest one recorded for an episode
    pub async fn missing_sequences(&self, episode_key: &ResourceKey) -> Result<Vec<u64>> {
        let episode: Versioned<Episode> = self.ctx.store.get_entity(episode_key).await?;
        let stored: Vec<u64> = self
            .ctx
            .store
            .list_children::<EpisodeChunk>(episode_key)
            .await?
            .iter()
            .filter_map(|item| item.key.chunk_sequence())
            .collect();

        let highest = stored
            .iter()
            .copied()
            .max()
            .unwrap_or(0)
            .max(episode.resource.last_sequence);
        Ok((1..=highest)
            .filter(|sequence| stored.binary_search(sequence).is_err())
            .collect())
    }

    /// Every chunk of a session committed at or before `through_micros`
    ///
    /// Ordered by episode, then sequence.
    pub async fn training_chunks(
        &self,
        session_key: &ResourceKey,
        through_micros: u64,
    ) -> Result<Vec<EpisodeChunk>> {
        let mut lister = Lister::new(
            self.ctx.store.as_ref(),
            Some(session_key.clone()),
            ListFilter::kind(ResourceKind::Chunk),
        );
        let mut chunks = Vec::new();
        while let Some(item) = lister.next().await? {
            let chunk: Versioned<EpisodeChunk> = item.into_entity()?;
            if chunk.resource.created_micros <= through_micros {
                chunks.push(chunk.resource);
            }
        }
        Ok(chunks)
    }

    /// Audit records of rejected commits
    pub async fn rejections(&self, session_key: &ResourceKey) -> Result<Vec<RejectedChunk>> {
        Ok(self
            .ctx
            .store
            .list_children::<RejectedChunk>(session_key)
            .await?
            .into_iter()
            .map(|item| item.resource)
            .collect())
    }
}
