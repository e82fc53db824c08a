// Command implementations for tutorctl

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tutor_core::{ResourceKey, Session};
use tutor_learner::{DemoReplayTrainer, LearnerWorker, TrainerConfig, WorkOutcome, WorkerConfig};
use tutor_service::{Coordinator, LineageTarget, NewSession};

use crate::{BrainAction, Commands, ProjectAction, SessionAction};

pub async fn dispatch(coordinator: &Arc<Coordinator>, command: Commands) -> Result<()> {
    match command {
        Commands::Project { action } => handle_project(coordinator, action).await?,
        Commands::Brain { action } => handle_brain(coordinator, action).await?,
        Commands::Session { action } => handle_session(coordinator, action).await?,
        Commands::Assignments {
            project,
            brain,
            session,
        } => show_assignments(coordinator, &brain_key(&project, &brain).session(session)).await?,
        Commands::Tick => {
            let report = coordinator.tick().await?;
            println!("⏱️  Scheduler pass complete");
            println!("   Reclaimed: {}", report.reclaimed);
            println!("   Scheduled: {}", report.scheduled);
        }
        Commands::Lineage {
            project,
            brain,
            snapshot,
        } => show_lineage(coordinator, &brain_key(&project, &brain), &snapshot).await?,
        Commands::BestModel {
            project,
            brain,
            snapshot,
            session,
        } => {
            let target = match (snapshot, session) {
                (Some(snapshot), _) => LineageTarget::Snapshot(snapshot),
                (None, Some(session)) => LineageTarget::Session(session),
                (None, None) => anyhow::bail!("either --snapshot or --session is required"),
            };
            let best = coordinator
                .resolve_best_model(&brain_key(&project, &brain), &target)
                .await?;
            println!("🏆 Best model: {}", best.key);
            println!("   Created: {}", format_micros(best.resource.created_micros));
            println!("   Demo watermark: {}", format_micros(best.resource.demo_watermark_micros));
            for path in &best.resource.artifact.paths {
                println!("   Artifact: {path}");
            }
        }
        Commands::Learn {
            worker,
            once,
            artifact_dir,
            increments,
        } => {
            let trainer = DemoReplayTrainer::new(TrainerConfig {
                increments,
                artifact_dir,
                ..TrainerConfig::default()
            });
            run_learner(coordinator, trainer, WorkerConfig::new(worker), once).await?;
        }
    }

    Ok(())
}

fn brain_key(project: &str, brain: &str) -> ResourceKey {
    ResourceKey::project(project).brain(brain)
}

fn format_micros(micros: u64) -> String {
    i64::try_from(micros)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_micros)
        .map_or_else(|| micros.to_string(), |t| t.to_rfc3339())
}

async fn handle_project(coordinator: &Coordinator, action: ProjectAction) -> Result<()> {
    match action {
        ProjectAction::Create { id, name } => {
            let project = coordinator.create_project(&id, &name).await?;
            println!("✅ Project created: {}", project.key);
            println!("   API key: {}", project.resource.api_key);
        }
    }
    Ok(())
}

async fn handle_brain(coordinator: &Coordinator, action: BrainAction) -> Result<()> {
    match action {
        BrainAction::Create {
            project,
            id,
            name,
            spec,
        } => {
            let spec: serde_json::Value =
                serde_json::from_str(&spec).context("Brain spec is not valid JSON")?;
            let brain = coordinator
                .create_brain(&ResourceKey::project(project), &id, &name, spec)
                .await?;
            println!("✅ Brain created: {}", brain.key);
        }
    }
    Ok(())
}

async fn handle_session(coordinator: &Coordinator, action: SessionAction) -> Result<()> {
    match action {
        SessionAction::Create {
            project,
            brain,
            id,
            session_type,
            from,
        } => {
            let session = coordinator
                .create_session(
                    &brain_key(&project, &brain),
                    NewSession {
                        session_id: id,
                        session_type: session_type.into(),
                        starting_snapshot_ids: from,
                    },
                )
                .await?;
            println!("✅ Session started: {}", session.key);
        }
        SessionAction::End {
            project,
            brain,
            session,
            status,
        } => {
            let key = brain_key(&project, &brain).session(session);
            let ended = coordinator.end_session(&key, status.into()).await?;
            println!("🛑 Session ended: {}", ended.session.key);
            println!("   Status: {:?}", ended.session.resource.status);
            match ended.snapshot {
                Some(snapshot) => println!("   Snapshot: {}", snapshot.key),
                None => println!("   Snapshot: none (no model trained)"),
            }
        }
        SessionAction::List { project, brain } => {
            let sessions = coordinator
                .list_sessions(&brain_key(&project, &brain))
                .await?;
            if sessions.is_empty() {
                println!("No sessions found.");
                return Ok(());
            }
            println!("📋 Sessions:\n");
            for session in sessions {
                print_session(&session.resource);
            }
        }
    }
    Ok(())
}

fn print_session(session: &Session) {
    println!("ID: {}", session.session_id);
    println!("   Type: {:?}", session.session_type);
    println!("   Status: {:?}", session.status);
    println!("   Created: {}", format_micros(session.created_micros));
    println!(
        "   Demo steps: {} total, {} untrained",
        session.total_demo_steps, session.untrained_demo_steps
    );
    if let Some(active) = &session.active_assignment_id {
        println!("   Active assignment: {active}");
    }
    if let Some(model) = &session.latest_model_id {
        println!("   Latest model: {model}");
    }
    println!();
}

async fn show_assignments(coordinator: &Coordinator, session: &ResourceKey) -> Result<()> {
    let assignments = coordinator.scheduler().list_assignments(session).await?;
    if assignments.is_empty() {
        println!("No assignments for {session}.");
        return Ok(());
    }

    println!("📋 Assignments of {session}:\n");
    for assignment in assignments {
        let a = &assignment.resource;
        println!("ID: {}", a.assignment_id);
        println!("   Status: {:?}", a.status);
        println!("   Created: {}", format_micros(a.created_micros));
        println!("   Demo steps: {}", a.demo_steps);
        println!("   Progress: {:.1}%", a.progress.fraction * 100.0);
        if let Some(lease) = &a.lease {
            println!(
                "   Lease: {} until {}",
                lease.worker_id,
                format_micros(lease.expires_micros)
            );
        }
        if let Some(reason) = &a.failure {
            println!("   Failure: {reason:?}");
        }
        if let Some(model) = &a.result_model_id {
            println!("   Model: {model}");
        }
        println!();
    }
    Ok(())
}

async fn show_lineage(coordinator: &Coordinator, brain: &ResourceKey, snapshot: &str) -> Result<()> {
    let models = coordinator.models().lineage_models(brain, snapshot).await?;
    let ancestors = coordinator.models().ancestors(brain, snapshot).await?;

    println!("🌳 Lineage of {}\n", brain.snapshot(snapshot));
    if ancestors.is_empty() {
        println!("   (root snapshot)");
    }
    for ancestor in &ancestors {
        println!(
            "   ← {} \"{}\" from session {}",
            ancestor.snapshot_id, ancestor.display_name, ancestor.session_id
        );
    }
    println!("\n   Models in lineage: {}", models.len());
    for model in models {
        println!("   • {}/{}", model.session_id, model.model_id);
    }
    Ok(())
}

async fn run_learner(
    coordinator: &Arc<Coordinator>,
    trainer: DemoReplayTrainer,
    config: WorkerConfig,
    once: bool,
) -> Result<()> {
    println!("🤖 Starting learner {}", config.worker_id);

    let mut worker = LearnerWorker::new(Arc::clone(coordinator), trainer, config);

    if once {
        match worker.run_once().await? {
            WorkOutcome::Idle => println!("No pending assignments."),
            WorkOutcome::Completed {
                assignment,
                model_id,
            } => println!("✅ {assignment} completed with model {model_id}"),
            WorkOutcome::Failed { assignment, reason } => {
                eprintln!("❌ {assignment} failed: {reason}");
            }
            WorkOutcome::Abandoned { assignment } => {
                eprintln!("⚠️  Lost the lease on {assignment}");
            }
        }
        return Ok(());
    }

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(true);
        }
    });
    let stats = worker.run(rx).await;
    println!("\n✅ Learner stopped");
    println!("   Completed: {}", stats.completed);
    println!("   Failed: {}", stats.failed);
    println!("   Abandoned: {}", stats.abandoned);
    Ok(())
}
