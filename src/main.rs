use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use uuid::Uuid;

use yokeflow::config::YokeConfig;
use yokeflow::errors::YokeError;
use yokeflow::orchestrator::Orchestrator;
use yokeflow::orchestrator::runner::ProcessRunner;
use yokeflow::store::Store;
use yokeflow::store::models::ProjectType;

#[derive(Parser)]
#[command(name = "yokeflow")]
#[command(version, about = "Autonomous coding agent platform")]
pub struct Cli {
    /// Data directory holding the database and project workspaces.
    #[arg(long, global = true, default_value = ".yokeflow")]
    pub data_dir: PathBuf,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a project from a spec file
    Create {
        name: String,
        /// Path to the specification markdown
        #[arg(long)]
        spec_file: PathBuf,
        /// greenfield or brownfield
        #[arg(long, default_value = "greenfield")]
        project_type: String,
        /// For brownfield: directory to import into the workspace
        #[arg(long)]
        import_path: Option<PathBuf>,
        /// Allow marking tasks done without tests
        #[arg(long)]
        allow_untested_tasks: bool,
    },
    /// Run the initializer session that builds the backlog
    Init { project: String },
    /// Drive coding sessions until done, paused, or stopped
    Start { project: String },
    /// Request a stop at the next safe boundary
    Stop { project: String },
    /// Pause a running session
    Pause { session_id: Uuid },
    /// Resolve an intervention and resume with a fresh session
    Resume {
        session_id: Uuid,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Delete a project, its sandbox, and all its data
    Delete {
        project: String,
        #[arg(long)]
        force: bool,
    },
    /// Show completion accounting for a project
    Progress { project: String },
    /// List interventions (paused sessions)
    Interventions {
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        unresolved: bool,
    },
    /// Score a project against its spec
    Review { project: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    let log_dir = cli.data_dir.join("logs");
    let _ = std::fs::create_dir_all(&log_dir);
    let (file_writer, _guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "yokeflow.log"));
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer((std::io::stderr as fn() -> std::io::Stderr).and(file_writer))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            let code = e
                .downcast_ref::<YokeError>()
                .map(YokeError::exit_code)
                .unwrap_or(2);
            ExitCode::from(code as u8)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = YokeConfig::load(&cli.data_dir)?;
    config.ensure_directories()?;
    let store = Store::connect(&config.resolved_database_url()).await?;
    let runner = Arc::new(ProcessRunner::new(config.agent.clone()));
    let orchestrator = Orchestrator::new(store, config, runner);

    match cli.command {
        Commands::Create {
            name,
            spec_file,
            project_type,
            import_path,
            allow_untested_tasks,
        } => {
            let spec = std::fs::read_to_string(&spec_file)
                .with_context(|| format!("failed to read {}", spec_file.display()))?;
            let project_type = ProjectType::from_str(&project_type)
                .map_err(YokeError::Validation)?;

            let mut settings = serde_json::Map::new();
            if allow_untested_tasks {
                settings.insert("allow_untested_tasks".into(), true.into());
            }
            if let Some(import_path) = import_path {
                settings.insert(
                    "import_path".into(),
                    import_path.to_string_lossy().into_owned().into(),
                );
            }

            let project = orchestrator
                .create_project(&name, &spec, project_type, settings)
                .await?;
            println!("created project {} ({})", project.name, project.id);
        }
        Commands::Init { project } => {
            let project = resolve_project(&orchestrator, &project).await?;
            let session = orchestrator.initialize(project).await?;
            println!(
                "initializer session {} finished with status {}",
                session.session_number,
                session.status.as_str()
            );
        }
        Commands::Start { project } => {
            let project = resolve_project(&orchestrator, &project).await?;
            let outcome = orchestrator.start_coding(project).await?;
            println!(
                "ran {} session(s); project is {}",
                outcome.sessions_run,
                outcome.final_status.as_str()
            );
            if let Some(session) = outcome.last_session {
                println!(
                    "last session {} ended {}",
                    session.session_number,
                    session.status.as_str()
                );
            }
        }
        Commands::Stop { project } => {
            let project = resolve_project(&orchestrator, &project).await?;
            orchestrator.stop_after_current(project).await?;
            println!("stop requested; the current session will finish first");
        }
        Commands::Pause { session_id } => {
            orchestrator.pause_session(session_id).await?;
            println!("session {session_id} pause requested");
        }
        Commands::Resume { session_id, notes } => {
            let session = orchestrator
                .resume_session(session_id, notes.as_deref())
                .await?;
            println!(
                "resumed as session {} (status {})",
                session.session_number,
                session.status.as_str()
            );
        }
        Commands::Delete { project, force } => {
            if !force {
                return Err(YokeError::Validation(
                    "deletion is destructive; pass --force to confirm".into(),
                )
                .into());
            }
            let project = resolve_project(&orchestrator, &project).await?;
            orchestrator.delete_project(project).await?;
            println!("project deleted");
        }
        Commands::Progress { project } => {
            let project = resolve_project(&orchestrator, &project).await?;
            let progress = orchestrator.get_progress(project).await?;
            println!(
                "epics {}/{}  tasks {}/{}  tests passing {}/{}",
                progress.completed_epics,
                progress.total_epics,
                progress.completed_tasks,
                progress.total_tasks,
                progress.passing_tests,
                progress.total_tests
            );
        }
        Commands::Interventions {
            project,
            unresolved,
        } => {
            let project_id = match project {
                Some(name) => Some(resolve_project(&orchestrator, &name).await?),
                None => None,
            };
            let interventions = orchestrator
                .list_interventions(project_id, unresolved)
                .await?;
            if interventions.is_empty() {
                println!("no interventions");
            }
            for pause in interventions {
                println!(
                    "session {}  [{}] resolved={}  {}",
                    pause.session_id,
                    pause.pause_type.as_str(),
                    pause.resolved,
                    pause.pause_reason
                );
            }
        }
        Commands::Review { project } => {
            let project = resolve_project(&orchestrator, &project).await?;
            let review = orchestrator.trigger_completion_review(project).await?;
            println!(
                "score {}  coverage {:.0}%  recommendation: {}",
                review.overall_score,
                review.coverage_percentage,
                review.recommendation.as_str()
            );
            for requirement in &review.requirements {
                println!(
                    "  [{:?}] {:.0}%  {}",
                    requirement.status, requirement.coverage_score, requirement.text
                );
            }
        }
    }

    Ok(())
}

/// Accept either a project name or a UUID.
async fn resolve_project(orchestrator: &Orchestrator, reference: &str) -> Result<Uuid> {
    if let Ok(id) = Uuid::parse_str(reference) {
        return Ok(id);
    }
    let project = orchestrator.store().get_project_by_name(reference).await?;
    Ok(project.id)
}
