// Tutor Control CLI
// Operator interface over a journaled coordinator store

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tutor_core::{SessionStatus, SessionType};
use tutor_service::{logging, Coordinator, ServiceConfig};

mod commands;

#[derive(Parser)]
#[command(name = "tutorctl")]
#[command(about = "Tutor training coordinator CLI", version)]
struct Cli {
    /// Service configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Journal file, overriding the configuration
    #[arg(short, long, global = true)]
    journal: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Project administration
    Project {
        #[command(subcommand)]
        action: ProjectAction,
    },

    /// Brain administration
    Brain {
        #[command(subcommand)]
        action: BrainAction,
    },

    /// Session lifecycle
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Show the assignment history of a session
    Assignments {
        project: String,
        brain: String,
        session: String,
    },

    /// Reclaim expired leases and schedule eligible sessions once
    Tick,

    /// Show a snapshot and its ancestors
    Lineage {
        project: String,
        brain: String,
        snapshot: String,
    },

    /// Resolve the model to serve
    BestModel {
        project: String,
        brain: String,

        /// Scope to a snapshot lineage
        #[arg(long, conflicts_with = "session", required_unless_present = "session")]
        snapshot: Option<String>,

        /// Scope to a session and its starting snapshots
        #[arg(long)]
        session: Option<String>,
    },

    /// Run an in-process learner worker
    Learn {
        /// Worker identity
        #[arg(short, long, default_value = "tutorctl")]
        worker: String,

        /// Stop after one assignment (or one empty poll)
        #[arg(long)]
        once: bool,

        /// Directory for model artifacts
        #[arg(long, default_value = "models")]
        artifact_dir: PathBuf,

        /// Training increments per assignment
        #[arg(long, default_value = "4")]
        increments: usize,
    },
}

#[derive(Subcommand)]
enum ProjectAction {
    /// Create a project and print its API key
    Create {
        id: String,
        #[arg(short, long, default_value = "")]
        name: String,
    },
}

#[derive(Subcommand)]
enum BrainAction {
    /// Create a brain under a project
    Create {
        project: String,
        id: String,
        #[arg(short, long, default_value = "")]
        name: String,
        /// Observation/action spec as JSON
        #[arg(short, long, default_value = "{}")]
        spec: String,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Start a session
    Create {
        project: String,
        brain: String,
        /// Session id; generated when omitted
        #[arg(long)]
        id: Option<String>,
        #[arg(short = 't', long = "type", value_enum, default_value = "training")]
        session_type: SessionKind,
        /// Starting snapshot ids
        #[arg(long = "from")]
        from: Vec<String>,
    },

    /// End a session
    End {
        project: String,
        brain: String,
        session: String,
        #[arg(short, long, value_enum, default_value = "success")]
        status: EndStatus,
    },

    /// List the sessions of a brain
    List { project: String, brain: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum SessionKind {
    Training,
    Inference,
    Evaluation,
}

impl From<SessionKind> for SessionType {
    fn from(kind: SessionKind) -> Self {
        match kind {
            SessionKind::Training => SessionType::InteractiveTraining,
            SessionKind::Inference => SessionType::Inference,
            SessionKind::Evaluation => SessionType::Evaluation,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum EndStatus {
    Success,
    Aborted,
    Expired,
}

impl From<EndStatus> for SessionStatus {
    fn from(status: EndStatus) -> Self {
        match status {
            EndStatus::Success => SessionStatus::Success,
            EndStatus::Aborted => SessionStatus::Aborted,
            EndStatus::Expired => SessionStatus::Expired,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ServiceConfig::load(path)?,
        None => ServiceConfig::default(),
    };
    if let Some(journal) = cli.journal {
        config.store.journal_path = Some(journal);
    }
    if config.store.journal_path.is_none() {
        config.store.journal_path = Some(PathBuf::from("tutor.journal"));
    }
    logging::init(&config.logging)?;

    let coordinator = Arc::new(
        Coordinator::open(config)
            .await
            .context("Failed to open coordinator")?,
    );
    let result = commands::dispatch(&coordinator, cli.command).await;
    coordinator
        .shutdown()
        .await
        .context("Failed to close the store")?;
    result
}
