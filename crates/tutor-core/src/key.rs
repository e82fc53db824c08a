//! Hierarchical resource keys
//!
//! Every entity lives at a path of typed segments such as
//! `projects/p1/brains/b1/sessions/s1/episodes/e1/chunks/00000000000000000001`.
//! Keys never change once assigned, and the parent of a key must exist
//! before the key itself can be written.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Result, TutorError};

/// Width of zero-padded chunk ids, so key order matches sequence order
/// across the whole `u64` range
const CHUNK_ID_WIDTH: usize = 20;

/// Type of the entity a key segment names
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Tenant boundary
    Project,
    /// Trainable policy definition
    Brain,
    /// One training or inference run
    Session,
    /// Stream of chunks
    Episode,
    /// Committed slice of an episode
    Chunk,
    /// Audit record of a refused chunk
    RejectedChunk,
    /// Unit of training work
    Assignment,
    /// Trained artifact
    Model,
    /// Named checkpoint in the lineage graph
    Snapshot,
    /// Batch evaluation score
    OfflineEvaluation,
    /// In-episode evaluation score
    OnlineEvaluation,
}

impl ResourceKind {
    const ALL: [Self; 11] = [
        Self::Project,
        Self::Brain,
        Self::Session,
        Self::Episode,
        Self::Chunk,
        Self::RejectedChunk,
        Self::Assignment,
        Self::Model,
        Self::Snapshot,
        Self::OfflineEvaluation,
        Self::OnlineEvaluation,
    ];

    /// Collection name used in key paths
    #[must_use]
    pub fn collection(self) -> &'static str {
        match self {
            Self::Project => "projects",
            Self::Brain => "brains",
            Self::Session => "sessions",
            Self::Episode => "episodes",
            Self::Chunk => "chunks",
            Self::RejectedChunk => "rejected_chunks",
            Self::Assignment => "assignments",
            Self::Model => "models",
            Self::Snapshot => "snapshots",
            Self::OfflineEvaluation => "offline_evaluations",
            Self::OnlineEvaluation => "online_evaluations",
        }
    }

    /// Look up a kind by its collection name
    #[must_use]
    pub fn from_collection(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.collection() == name)
    }

    /// Kind of the segment that must directly precede this one
    #[must_use]
    pub fn parent_kind(self) -> Option<Self> {
        match self {
            Self::Project => None,
            Self::Brain => Some(Self::Project),
            Self::Session | Self::Snapshot => Some(Self::Brain),
            Self::Episode | Self::RejectedChunk | Self::Assignment | Self::Model => {
                Some(Self::Session)
            }
            Self::Chunk => Some(Self::Episode),
            Self::OfflineEvaluation | Self::OnlineEvaluation => Some(Self::Model),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.collection())
    }
}

/// One `collection/id` step of a key path
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Segment {
    /// Entity type
    pub kind: ResourceKind,
    /// Identifier, unique within the parent
    pub id: String,
}

/// Full path to an entity
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceKey {
    segments: Vec<Segment>,
}

impl ResourceKey {
    /// Key of a project
    pub fn project(project_id: impl Into<String>) -> Self {
        Self {
            segments: vec![Segment {
                kind: ResourceKind::Project,
                id: project_id.into(),
            }],
        }
    }

    /// Append a segment without checking the hierarchy; `validate` does that
    #[must_use]
    pub fn child(&self, kind: ResourceKind, id: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(Segment {
            kind,
            id: id.into(),
        });
        Self { segments }
    }

    /// Brain under this project
    #[must_use]
    pub fn brain(&self, brain_id: impl Into<String>) -> Self {
        self.child(ResourceKind::Brain, brain_id)
    }

    /// Session under this brain
    #[must_use]
    pub fn session(&self, session_id: impl Into<String>) -> Self {
        self.child(ResourceKind::Session, session_id)
    }

    /// Snapshot under this brain
    #[must_use]
    pub fn snapshot(&self, snapshot_id: impl Into<String>) -> Self {
        self.child(ResourceKind::Snapshot, snapshot_id)
    }

    /// Episode under this session
    #[must_use]
    pub fn episode(&self, episode_id: impl Into<String>) -> Self {
        self.child(ResourceKind::Episode, episode_id)
    }

    /// Chunk under this episode
    #[must_use]
    pub fn chunk(&self, sequence: u64) -> Self {
        self.child(
            ResourceKind::Chunk,
            format!("{sequence:0width$}", width = CHUNK_ID_WIDTH),
        )
    }

    /// Rejected-chunk audit record under this session
    #[must_use]
    pub fn rejected_chunk(&self, rejection_id: impl Into<String>) -> Self {
        self.child(ResourceKind::RejectedChunk, rejection_id)
    }

    /// Assignment under this session
    #[must_use]
    pub fn assignment(&self, assignment_id: impl Into<String>) -> Self {
        self.child(ResourceKind::Assignment, assignment_id)
    }

    /// Model under this session
    #[must_use]
    pub fn model(&self, model_id: impl Into<String>) -> Self {
        self.child(ResourceKind::Model, model_id)
    }

    /// Offline evaluation under this model
    #[must_use]
    pub fn offline_evaluation(&self, evaluation_id: impl Into<String>) -> Self {
        self.child(ResourceKind::OfflineEvaluation, evaluation_id)
    }

    /// Online evaluation under this model
    #[must_use]
    pub fn online_evaluation(&self, evaluation_id: impl Into<String>) -> Self {
        self.child(ResourceKind::OnlineEvaluation, evaluation_id)
    }

    /// Path segments, root first
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Kind of the entity this key names
    ///
    /// # Panics
    /// Never: keys always hold at least one segment.
    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        self.last().kind
    }

    /// Identifier of the entity this key names
    #[must_use]
    pub fn id(&self) -> &str {
        &self.last().id
    }

    /// Identifier of the nearest segment of the given kind
    #[must_use]
    pub fn id_of(&self, kind: ResourceKind) -> Option<&str> {
        self.segments
            .iter()
            .rev()
            .find(|segment| segment.kind == kind)
            .map(|segment| segment.id.as_str())
    }

    /// Truncate the key to the nearest ancestor of the given kind
    #[must_use]
    pub fn ancestor(&self, kind: ResourceKind) -> Option<Self> {
        let position = self.segments.iter().rposition(|segment| segment.kind == kind)?;
        Some(Self {
            segments: self.segments[..=position].to_vec(),
        })
    }

    /// Key of the enclosing entity, if any
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.segments.len() <= 1 {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Whether `prefix` is this key or one of its ancestors
    #[must_use]
    pub fn starts_with(&self, prefix: &Self) -> bool {
        self.segments.starts_with(&prefix.segments)
    }

    /// Number of segments
    #[must_use]
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Parse the sequence number out of a chunk key
    #[must_use]
    pub fn chunk_sequence(&self) -> Option<u64> {
        match self.kind() {
            ResourceKind::Chunk => self.id().parse().ok(),
            _ => None,
        }
    }

    /// Check that every segment follows its required parent kind and carries a usable id
    pub fn validate(&self) -> Result<()> {
        let mut previous: Option<ResourceKind> = None;
        for segment in &self.segments {
            if segment.kind.parent_kind() != previous {
                return Err(TutorError::InvalidArgument(format!(
                    "{} cannot follow {} in key {self}",
                    segment.kind,
                    previous.map_or("the root", ResourceKind::collection),
                )));
            }
            validate_id(&segment.id)?;
            previous = Some(segment.kind);
        }
        Ok(())
    }

    fn last(&self) -> &Segment {
        // Constructors never produce an empty key
        &self.segments[self.segments.len() - 1]
    }
}

/// Reject ids that would break path parsing
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(TutorError::InvalidArgument("identifier must not be empty".into()));
    }
    if id.contains('/') || id.chars().any(char::is_whitespace) {
        return Err(TutorError::InvalidArgument(format!(
            "identifier {id:?} must not contain '/' or whitespace"
        )));
    }
    Ok(())
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, segment) in self.segments.iter().enumerate() {
            if index > 0 {
                f.write_str("/")?;
            }
            write!(f, "{}/{}", segment.kind.collection(), segment.id)?;
        }
        Ok(())
    }
}

impl FromStr for ResourceKey {
    type Err = TutorError;

    fn from_str(path: &str) -> Result<Self> {
        let parts: Vec<&str> = path.split('/').collect();
        if parts.is_empty() || parts.len() % 2 != 0 {
            return Err(TutorError::InvalidArgument(format!(
                "key path {path:?} must be collection/id pairs"
            )));
        }

        let segments = parts
            .chunks(2)
            .map(|pair| {
                let kind = ResourceKind::from_collection(pair[0]).ok_or_else(|| {
                    TutorError::InvalidArgument(format!("unknown collection {:?}", pair[0]))
                })?;
                Ok(Segment {
                    kind,
                    id: pair[1].to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let key = Self { segments };
        key.validate()?;
        Ok(key)
    }
}

impl TryFrom<String> for ResourceKey {
    type Error = TutorError;

    fn try_from(path: String) -> Result<Self> {
        path.parse()
    }
}

impl From<ResourceKey> for String {
    fn from(key: ResourceKey) -> Self {
        key.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_key() -> ResourceKey {
        ResourceKey::project("p1")
            .brain("b1")
            .session("s1")
            .episode("e1")
            .chunk(7)
    }

    #[test]
    fn test_display_and_parse() {
        let key = chunk_key();
        let path = key.to_string();
        assert_eq!(
            path,
            "projects/p1/brains/b1/sessions/s1/episodes/e1/chunks/00000000000000000007"
        );
        assert_eq!(path.parse::<ResourceKey>().unwrap(), key);
        assert_eq!(key.chunk_sequence(), Some(7));
    }

    #[test]
    fn test_routing_accessors() {
        let key = chunk_key();
        assert_eq!(key.kind(), ResourceKind::Chunk);
        assert_eq!(key.id_of(ResourceKind::Session), Some("s1"));
        assert_eq!(
            key.ancestor(ResourceKind::Brain).unwrap().to_string(),
            "projects/p1/brains/b1"
        );
        assert!(key.starts_with(&ResourceKey::project("p1")));
        assert!(!key.starts_with(&ResourceKey::project("p2")));
    }

    #[test]
    fn test_chunk_keys_sort_by_sequence() {
        let episode = ResourceKey::project("p").brain("b").session("s").episode("e");
        assert!(episode.chunk(9) < episode.chunk(10));
        assert!(episode.chunk(10) < episode.chunk(100));
        assert!(episode.chunk(999_999_999_999) < episode.chunk(1_000_000_000_000));
        assert!(episode.chunk(u64::MAX - 1) < episode.chunk(u64::MAX));
        assert_eq!(episode.chunk(u64::MAX).chunk_sequence(), Some(u64::MAX));
    }

    #[test]
    fn test_rejects_bad_hierarchy() {
        let key = ResourceKey::project("p").session("s");
        assert!(matches!(key.validate(), Err(TutorError::InvalidArgument(_))));
        assert!("projects/p/chunks/1".parse::<ResourceKey>().is_err());
        assert!("projects".parse::<ResourceKey>().is_err());
        assert!("projects/a b".parse::<ResourceKey>().is_err());
    }
}
