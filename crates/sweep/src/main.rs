//! sweep: idempotent, resumable bulk transforms for the asset store
//!
//! Subcommands:
//! - `run`: execute a JSON job description
//! - `validate`: parse a job description and print it back normalized
//! - `transforms`: list the built-in transforms
//! - `checkpoint`: inspect or discard a saved checkpoint

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use miette::Result;
use sweep_github::DEFAULT_API_URL;
use sweep_jobs::{CheckpointStore, FileCheckpointStore, JobSpec, transforms};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod run;

#[derive(Parser)]
#[command(name = "sweep")]
#[command(about = "Idempotent, resumable bulk transforms for the asset store", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Connection settings shared by every command that touches the store.
#[derive(Args, Debug, Clone)]
pub struct Environment {
    /// AWS region for DynamoDB and Secrets Manager
    #[arg(long, env = "SWEEP_AWS_REGION")]
    pub region: Option<String>,

    /// DynamoDB endpoint override (e.g. DynamoDB Local)
    #[arg(long, env = "SWEEP_DYNAMODB_ENDPOINT")]
    pub dynamodb_endpoint: Option<String>,

    /// Per-operation DynamoDB timeout in milliseconds
    #[arg(long, env = "SWEEP_DYNAMODB_TIMEOUT_MS")]
    pub dynamodb_timeout_ms: Option<u64>,

    /// GitHub API base URL
    #[arg(long, env = "SWEEP_GITHUB_API_URL", default_value = DEFAULT_API_URL)]
    pub github_api_url: String,

    /// Read app private keys from this JSON file instead of AWS Secrets Manager
    #[arg(long, env = "SWEEP_SECRETS_FILE")]
    pub secrets_file: Option<PathBuf>,

    /// Directory for checkpoint files
    #[arg(long, env = "SWEEP_CHECKPOINT_DIR")]
    pub checkpoint_dir: Option<PathBuf>,
}

impl Environment {
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.checkpoint_dir
            .clone()
            .unwrap_or_else(FileCheckpointStore::default_dir)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a job
    Run {
        /// Path to the job description (JSON)
        job: PathBuf,

        /// Compute and report changes without writing anything
        #[arg(long)]
        dry_run: bool,

        /// Checkpoint file (defaults to <checkpoint-dir>/<job name>.json)
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Continue from the saved checkpoint
        #[arg(long)]
        resume: bool,

        #[command(flatten)]
        env: Environment,
    },

    /// Validate a job description without running it
    Validate {
        /// Path to the job description (JSON)
        job: PathBuf,
    },

    /// List the built-in transforms
    Transforms,

    /// Inspect or discard a job's checkpoint
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// Print the saved checkpoint
    Show {
        /// Job name
        job: String,

        /// Directory for checkpoint files
        #[arg(long, env = "SWEEP_CHECKPOINT_DIR")]
        checkpoint_dir: Option<PathBuf>,
    },

    /// Delete the saved checkpoint so the next run starts from the beginning
    Clear {
        /// Job name
        job: String,

        /// Directory for checkpoint files
        #[arg(long, env = "SWEEP_CHECKPOINT_DIR")]
        checkpoint_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "sweep=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            job,
            dry_run,
            checkpoint,
            resume,
            env,
        } => {
            run::run(run::RunOptions {
                job,
                dry_run,
                checkpoint,
                resume,
                env,
            })
            .await
        }
        Commands::Validate { job } => {
            let spec = JobSpec::from_file(&job)
                .await
                .map_err(|e| miette::miette!("invalid job {}: {}", job.display(), e))?;
            let json = serde_json::to_string_pretty(&spec).map_err(|e| miette::miette!("{}", e))?;
            println!("{}", json);
            Ok(())
        }
        Commands::Transforms => {
            for transform in transforms::catalog() {
                let kind = match transform.enrichment() {
                    sweep_jobs::Enrichment::None => "",
                    _ => " (needs GitHub enrichment)",
                };
                println!("{:<28} {}{}", transform.name(), transform.description(), kind);
            }
            Ok(())
        }
        Commands::Checkpoint { action } => match action {
            CheckpointAction::Show {
                job,
                checkpoint_dir,
            } => {
                let store = checkpoint_store(checkpoint_dir, &job);
                match store
                    .load()
                    .await
                    .map_err(|e| miette::miette!("{}", e))?
                {
                    Some(checkpoint) => {
                        let json = serde_json::to_string_pretty(&checkpoint)
                            .map_err(|e| miette::miette!("{}", e))?;
                        println!("{}", json);
                    }
                    None => println!("no checkpoint at {}", store.path().display()),
                }
                Ok(())
            }
            CheckpointAction::Clear {
                job,
                checkpoint_dir,
            } => {
                let store = checkpoint_store(checkpoint_dir, &job);
                store.clear().await.map_err(|e| miette::miette!("{}", e))?;
                println!("cleared {}", store.path().display());
                Ok(())
            }
        },
    }
}

fn checkpoint_store(dir: Option<PathBuf>, job: &str) -> FileCheckpointStore {
    let dir = dir.unwrap_or_else(FileCheckpointStore::default_dir);
    FileCheckpointStore::for_job(dir, job)
}
