//! Learner worker for the tutor training coordinator
//!
//! The worker polls the coordinator for pending assignments and drives a
//! black-box [`Trainer`] through them one increment at a time:
//! - progress reports extend the lease
//! - intermediate models are recorded as checkpoints
//! - a lost lease discards the work in flight

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod trainer;
pub mod worker;

pub use trainer::{
    Checkpoint, DemoReplayTrainer, Trainer, TrainerConfig, TrainingContext, TrainingUpdate,
};
pub use worker::{LearnerWorker, WorkOutcome, WorkerConfig, WorkerStats};
