//! Training coordination for the tutor service
//!
//! This crate wires the store from `tutor-core` into the components that
//! give it meaning:
//! - Episode ingestion (ordered chunk commits)
//! - Assignment scheduling (eligibility, leases, reclamation)
//! - Models and the snapshot lineage DAG
//! - Evaluation tracking and best-model selection

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod boundary;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod evaluation;
pub mod ingestion;
pub mod lineage;
pub mod logging;
pub mod scheduler;

// Re-export the service surface
pub use boundary::{ClaimedAssignment, LearnerApi};
pub use config::{LoggingConfig, SchedulerConfig, ServiceConfig, StoreConfig};
pub use context::ServiceContext;
pub use coordinator::{Coordinator, EndedSession, NewSession};
pub use evaluation::EvaluationTracker;
pub use ingestion::{ChunkUpload, CommitReceipt, EpisodeIngestion};
pub use lineage::{LineageTarget, ModelManager, SnapshotRequest};
pub use scheduler::{AssignmentScheduler, TickReport};
