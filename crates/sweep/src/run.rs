//! The `run` command: wire adapters, execute a job, print its report.

use std::path::PathBuf;
use std::sync::Arc;

use miette::Result;
use sweep_github::{AwsSecretStore, FileSecretStore, GithubClient, SecretStore};
use sweep_jobs::{
    Action, CheckpointStore, Enricher, FileCheckpointStore, JobError, JobRunner, JobSpec, Phase,
    Scope,
};
use sweep_store::{DynamoConfig, DynamoStore};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::Environment;

pub struct RunOptions {
    pub job: PathBuf,
    pub dry_run: bool,
    pub checkpoint: Option<PathBuf>,
    pub resume: bool,
    pub env: Environment,
}

fn needs_enrichment(job: &JobSpec) -> bool {
    match &job.action {
        Action::Transform { transform } => transform.build().enrichment().needs_repository(),
        Action::Delete => false,
    }
}

async fn enricher(
    job: &JobSpec,
    env: &Environment,
    sdk_config: &aws_config::SdkConfig,
) -> Result<Option<Enricher>> {
    let Scope::Tenants(scope) = &job.scope else {
        return Ok(None);
    };
    if !needs_enrichment(job) {
        return Ok(None);
    }

    let secrets: Arc<dyn SecretStore> = match &env.secrets_file {
        Some(path) => {
            let store = FileSecretStore::load(path).await.map_err(|e| {
                miette::miette!("failed to load secrets file {}: {}", path.display(), e)
            })?;
            info!(path = %path.display(), secrets = store.len(), "using secrets file");
            Arc::new(store)
        }
        None => Arc::new(AwsSecretStore::new(sdk_config, env.region.clone())),
    };
    let github = GithubClient::new(&env.github_api_url).map_err(|e| miette::miette!("{}", e))?;

    Ok(Some(Enricher::new(
        github,
        secrets,
        scope.secret_name_template.clone(),
        scope.per_page,
    )))
}

pub async fn run(options: RunOptions) -> Result<()> {
    let job = JobSpec::from_file(&options.job)
        .await
        .map_err(|e| miette::miette!("failed to load job {}: {}", options.job.display(), e))?;

    let checkpoints = match &options.checkpoint {
        Some(path) => FileCheckpointStore::new(path),
        None => FileCheckpointStore::for_job(options.env.checkpoint_dir(), &job.name),
    };
    let saved = checkpoints
        .load()
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    let resume = match (options.resume, saved) {
        (true, Some(checkpoint)) => {
            info!(
                path = %checkpoints.path().display(),
                processed = checkpoint.processed_count,
                "resuming from checkpoint"
            );
            Some(checkpoint)
        }
        (true, None) => {
            return Err(miette::miette!(
                "--resume given but no checkpoint exists at {}",
                checkpoints.path().display()
            ));
        }
        (false, Some(_)) => {
            warn!(
                path = %checkpoints.path().display(),
                "existing checkpoint ignored and will be overwritten; pass --resume to continue it"
            );
            None
        }
        (false, None) => None,
    };

    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
    if let Some(region) = &options.env.region {
        loader = loader.region(aws_config::Region::new(region.clone()));
    }
    let sdk_config = loader.load().await;

    let store = DynamoStore::new(
        &sdk_config,
        DynamoConfig {
            region: options.env.region.clone(),
            endpoint: options.env.dynamodb_endpoint.clone(),
            timeout_ms: options.env.dynamodb_timeout_ms,
        },
    );
    let enricher = enricher(&job, &options.env, &sdk_config).await?;

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current page");
            let _ = cancel_tx.send(true);
        }
    });

    let mut runner = JobRunner::new(store, job)
        .map_err(|e| miette::miette!("{}", e))?
        .dry_run(options.dry_run)
        .checkpoints(Arc::new(checkpoints.clone()))
        .cancel_on(cancel_rx);
    if let Some(enricher) = enricher {
        runner = runner.enricher(enricher);
    }

    let report = match runner.run(resume).await {
        Ok(report) => report,
        Err(JobError::Aborted { source, checkpoint }) => {
            if let Some(checkpoint) = checkpoint {
                error!(
                    processed = checkpoint.processed_count,
                    path = %checkpoints.path().display(),
                    "job aborted; rerun with --resume to continue"
                );
            }
            return Err(miette::miette!("job aborted: {}", source));
        }
        Err(e) => return Err(miette::miette!("{}", e)),
    };

    let json = serde_json::to_string_pretty(&report).map_err(|e| miette::miette!("{}", e))?;
    println!("{}", json);

    match report.phase {
        Phase::Cancelled => {
            info!(
                path = %checkpoints.path().display(),
                "cancelled; rerun with --resume to continue"
            );
            Ok(())
        }
        _ if !report.failed_chunks.is_empty() => Err(miette::miette!(
            "{} chunk(s) failed to write; see failed_chunks in the report",
            report.failed_chunks.len()
        )),
        _ => Ok(()),
    }
}
