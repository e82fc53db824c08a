//! Resource model and versioned store for the tutor training coordinator
//!
//! This crate provides the hierarchical keys, the entity types that live
//! under them, and the optimistic-concurrency store every other component
//! of the coordinator reads and writes through.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod assignment;
pub mod clock;
pub mod episode;
pub mod error;
pub mod evaluation;
pub mod key;
pub mod model;
pub mod project;
pub mod resource;
pub mod session;
pub mod snapshot;
pub mod store;

// Re-export core types
pub use assignment::{Assignment, AssignmentStatus, FailureReason, Lease, TrainingProgress};
pub use clock::{Clock, ManualClock, SystemClock};
pub use episode::{
    ActionSource, ChunkWatermark, Episode, EpisodeChunk, EpisodeState, RejectedChunk, Step,
    StepClassification,
};
pub use error::{Result, TutorError};
pub use evaluation::{OfflineEvaluation, OnlineEvaluation, ScoreSummary};
pub use key::{ResourceKey, ResourceKind, Segment};
pub use model::{LatencyStats, Model, ModelArtifact, ModelRef, TrainingStats};
pub use project::{Brain, Project};
pub use resource::{Entity, Resource};
pub use session::{Session, SessionStatus, SessionType};
pub use snapshot::Snapshot;
pub use store::{
    ChangeEvent, ContinuationToken, ListFilter, Lister, MemoryStore, Mutator, Page,
    ResourceStore, RetryPolicy, Revision, StoreExt, Versioned,
};
pub use store::{update, update_if};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        Clock, Entity, Resource, ResourceKey, ResourceKind, ResourceStore, Result, StoreExt,
        TutorError, Versioned,
    };
}
