//! Job orchestration: paginate, enrich, transform, write, checkpoint.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use sweep_store::{
    BatchWriter, ChunkFailure, Cursor, Paginator, ReadRequest, Record, RetryConfig, Store,
    StoreError, WriteMode,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::JobError;
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::enrich::{Enricher, TenantSession};
use crate::index;
use crate::job::{Action, JobSpec, Scope, TenantScope};
use crate::model::Tenant;
use crate::transform::{
    ExternalData, MissingMatchPolicy, RecordTransformer, SkipReason, TransformContext, Transformed,
};

/// Where a run currently is, or how it ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    NotStarted,
    Paginating,
    Enriching,
    Transforming,
    Writing,
    Completed,
    Cancelled,
    Failed,
}

/// A tenant whose records were left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantSkip {
    pub tenant_id: String,
    pub reason: String,
}

/// Counters and failures of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub job: String,
    pub dry_run: bool,
    pub phase: Phase,
    /// Records read, including those counted by a resumed checkpoint.
    pub processed: u64,
    /// Records written (or that would be, in a dry run).
    pub transformed: u64,
    pub unchanged: u64,
    /// Records skipped for any reason other than being unchanged.
    pub skipped_records: u64,
    /// Records whose external data could not be fetched.
    pub unresolved: u64,
    pub skip_reasons: BTreeMap<SkipReason, u64>,
    pub tenants_processed: u64,
    pub skipped_tenants: Vec<TenantSkip>,
    pub failed_chunks: Vec<ChunkFailure>,
    pub pages: u64,
    pub last_cursor: Option<Cursor>,
}

impl JobReport {
    pub fn new(job: impl Into<String>, dry_run: bool) -> Self {
        Self {
            job: job.into(),
            dry_run,
            ..Self::default()
        }
    }

    /// Whether every selected record was written or deliberately skipped.
    pub fn is_clean(&self) -> bool {
        self.phase == Phase::Completed && self.failed_chunks.is_empty()
    }

    fn record_skip(&mut self, reason: SkipReason) {
        match reason {
            SkipReason::Unchanged => self.unchanged += 1,
            other => {
                self.skipped_records += 1;
                if other == SkipReason::Unresolved {
                    self.unresolved += 1;
                }
                *self.skip_reasons.entry(other).or_default() += 1;
            }
        }
    }

    /// Fold a tenant's counters into the run's.
    fn absorb(&mut self, other: JobReport) {
        self.processed += other.processed;
        self.transformed += other.transformed;
        self.unchanged += other.unchanged;
        self.skipped_records += other.skipped_records;
        self.unresolved += other.unresolved;
        for (reason, count) in other.skip_reasons {
            *self.skip_reasons.entry(reason).or_default() += count;
        }
        self.tenants_processed += other.tenants_processed;
        self.skipped_tenants.extend(other.skipped_tenants);
        self.failed_chunks.extend(other.failed_chunks);
    }
}

enum Flow {
    Completed,
    Cancelled,
}

/// Runs one [`JobSpec`] against a store.
///
/// The runner owns no global state: every counter lives in the returned
/// [`JobReport`]. Progress is checkpointed after each outer page once all of
/// that page's writes have a known outcome.
pub struct JobRunner<S> {
    store: S,
    job: JobSpec,
    transformer: Option<Arc<dyn RecordTransformer>>,
    dry_run: bool,
    enricher: Option<Enricher>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    cancel: Option<watch::Receiver<bool>>,
    retry: RetryConfig,
    now: Option<DateTime<Utc>>,
}

impl<S: Store> JobRunner<S> {
    pub fn new(store: S, job: JobSpec) -> Result<Self, JobError> {
        job.validate()?;
        let transformer = match &job.action {
            Action::Transform { transform } => Some(transform.build()),
            Action::Delete => None,
        };
        Ok(Self {
            store,
            job,
            transformer,
            dry_run: false,
            enricher: None,
            checkpoints: None,
            cancel: None,
            retry: RetryConfig::default(),
            now: None,
        })
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn enricher(mut self, enricher: Enricher) -> Self {
        self.enricher = Some(enricher);
        self
    }

    pub fn checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Stop between pages once the receiver reads `true`.
    pub fn cancel_on(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Fix the clock used for `modified_at` stamps.
    pub fn now(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    pub fn job(&self) -> &JobSpec {
        &self.job
    }

    fn clock(&self) -> DateTime<Utc> {
        self.now.unwrap_or_else(Utc::now)
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    fn needs_enrichment(&self) -> bool {
        self.transformer
            .as_ref()
            .is_some_and(|t| t.enrichment().needs_repository())
    }

    fn missing_match(&self) -> MissingMatchPolicy {
        self.job
            .missing_match
            .unwrap_or(MissingMatchPolicy::LeaveUnchanged)
    }

    /// Execute the job, continuing from `resume` when given.
    pub async fn run(&self, resume: Option<Checkpoint>) -> Result<JobReport, JobError> {
        if let Some(checkpoint) = &resume {
            checkpoint.check_compatible(&self.job.name, self.dry_run)?;
        }
        if self.needs_enrichment() && self.enricher.is_none() {
            return Err(JobError::InvalidJob(format!(
                "job {} needs GitHub enrichment but no client was configured",
                self.job.name
            )));
        }

        let mut checkpoint = resume
            .unwrap_or_else(|| Checkpoint::start(self.job.name.clone(), self.dry_run, self.clock()));
        let mut report = JobReport::new(self.job.name.clone(), self.dry_run);
        report.processed = checkpoint.processed_count;
        report.last_cursor = checkpoint.last_cursor.clone();

        info!(
            job = %self.job.name,
            dry_run = self.dry_run,
            resumed = checkpoint.last_cursor.is_some(),
            processed = checkpoint.processed_count,
            "starting job"
        );

        let flow = match &self.job.scope {
            Scope::Table { source } => self.run_table(source, &mut checkpoint, &mut report).await,
            Scope::Tenants(scope) => self.run_tenants(scope, &mut checkpoint, &mut report).await,
        };

        match flow {
            Ok(Flow::Completed) => {
                report.phase = Phase::Completed;
                if let Some(store) = &self.checkpoints {
                    store.clear().await?;
                }
                info!(
                    job = %self.job.name,
                    processed = report.processed,
                    transformed = report.transformed,
                    unchanged = report.unchanged,
                    skipped = report.skipped_records,
                    failed_chunks = report.failed_chunks.len(),
                    "job completed"
                );
                Ok(report)
            }
            Ok(Flow::Cancelled) => {
                report.phase = Phase::Cancelled;
                warn!(
                    job = %self.job.name,
                    processed = report.processed,
                    "job cancelled, checkpoint kept"
                );
                Ok(report)
            }
            Err(e) => {
                report.phase = Phase::Failed;
                warn!(
                    job = %self.job.name,
                    phase = ?report.phase,
                    processed = report.processed,
                    transformed = report.transformed,
                    error = %e,
                    "job failed"
                );
                Err(e)
            }
        }
    }

    fn paginator(&self, request: ReadRequest, start: Option<Cursor>) -> Paginator<&S> {
        Paginator::new(&self.store, request)
            .resume_from(start)
            .with_retry(self.retry.clone())
    }

    fn aborted(&self, source: StoreError, checkpoint: &Checkpoint) -> JobError {
        JobError::Aborted {
            source,
            checkpoint: Some(Box::new(checkpoint.clone())),
        }
    }

    async fn save_checkpoint(
        &self,
        checkpoint: &mut Checkpoint,
        report: &mut JobReport,
        cursor: Option<Cursor>,
    ) -> Result<(), JobError> {
        checkpoint.last_cursor = cursor;
        checkpoint.processed_count = report.processed;
        checkpoint.updated_at = self.clock();
        report.last_cursor = checkpoint.last_cursor.clone();
        if let Some(store) = &self.checkpoints {
            store.save(checkpoint).await?;
        }
        Ok(())
    }

    async fn run_table(
        &self,
        source: &ReadRequest,
        checkpoint: &mut Checkpoint,
        report: &mut JobReport,
    ) -> Result<Flow, JobError> {
        let mut request = source.clone();
        if let Some(limit) = self.job.page_size {
            request = request.with_limit(limit);
        }
        let mut pages = self.paginator(request, checkpoint.last_cursor.clone());

        loop {
            if self.is_cancelled() {
                return Ok(Flow::Cancelled);
            }
            report.phase = Phase::Paginating;
            let page = match pages.next_page().await {
                Ok(Some(page)) => page,
                Ok(None) => return Ok(Flow::Completed),
                Err(source) => return Err(self.aborted(source, checkpoint)),
            };
            report.pages += 1;
            report.processed += page.items.len() as u64;

            let items: Vec<(Record, Option<ExternalData>)> =
                page.items.into_iter().map(|r| (r, None)).collect();
            self.apply(items, report).await?;

            let exhausted = page.cursor.is_none();
            self.save_checkpoint(checkpoint, report, page.cursor).await?;
            if exhausted {
                return Ok(Flow::Completed);
            }
        }
    }

    async fn run_tenants(
        &self,
        scope: &TenantScope,
        checkpoint: &mut Checkpoint,
        report: &mut JobReport,
    ) -> Result<Flow, JobError> {
        let request = scope.tenant_request(self.job.page_size);
        let mut pages = self.paginator(request, checkpoint.last_cursor.clone());

        loop {
            if self.is_cancelled() {
                return Ok(Flow::Cancelled);
            }
            report.phase = Phase::Paginating;
            let page = match pages.next_page().await {
                Ok(Some(page)) => page,
                Ok(None) => return Ok(Flow::Completed),
                Err(source) => return Err(self.aborted(source, checkpoint)),
            };
            report.pages += 1;

            report.phase = if self.needs_enrichment() {
                Phase::Enriching
            } else {
                Phase::Transforming
            };
            let outcomes: Vec<Result<JobReport, StoreError>> = stream::iter(page.items)
                .map(|record| self.run_tenant(scope, record))
                .buffer_unordered(self.job.concurrency)
                .collect()
                .await;

            let mut failure = None;
            for outcome in outcomes {
                match outcome {
                    Ok(tenant_report) => report.absorb(tenant_report),
                    Err(e) => failure = Some(e),
                }
            }
            if let Some(source) = failure {
                return Err(self.aborted(source, checkpoint));
            }

            let exhausted = page.cursor.is_none();
            self.save_checkpoint(checkpoint, report, page.cursor).await?;
            if exhausted {
                return Ok(Flow::Completed);
            }
        }
    }

    /// Process one tenant installation record. Tenant-level failures become
    /// skips in the returned report; store failures are returned.
    async fn run_tenant(&self, scope: &TenantScope, record: Record) -> Result<JobReport, StoreError> {
        let mut report = JobReport::default();

        let tenant = match Tenant::from_record(&record) {
            Ok(tenant) => tenant,
            Err(e) => {
                warn!(error = %e, "skipping malformed tenant record");
                report.skipped_tenants.push(TenantSkip {
                    tenant_id: record
                        .get_str(crate::model::attr::TENANT_ID)
                        .unwrap_or("<unknown>")
                        .to_string(),
                    reason: e.to_string(),
                });
                return Ok(report);
            }
        };
        if !scope.includes(&tenant.tenant_id) {
            debug!(tenant_id = %tenant.tenant_id, "tenant not included, ignoring");
            return Ok(report);
        }

        let session = match (&self.enricher, self.needs_enrichment()) {
            (Some(enricher), true) => match enricher.open_session(&tenant).await {
                Ok(session) => Some(session),
                Err(e) => {
                    warn!(tenant_id = %tenant.tenant_id, error = %e, "skipping tenant");
                    report.skipped_tenants.push(TenantSkip {
                        tenant_id: tenant.tenant_id.clone(),
                        reason: e.to_string(),
                    });
                    return Ok(report);
                }
            },
            _ => None,
        };

        let request = scope.asset_request(&tenant.tenant_id, &tenant.owner, self.job.page_size);
        let mut assets = self.paginator(request, None);
        while let Some(page) = assets.next_page().await? {
            report.processed += page.items.len() as u64;
            let items = self.resolve_all(session.as_ref(), page.items).await;
            self.apply(items, &mut report).await?;
        }

        report.tenants_processed += 1;
        debug!(
            tenant_id = %tenant.tenant_id,
            processed = report.processed,
            transformed = report.transformed,
            "tenant done"
        );
        Ok(report)
    }

    async fn resolve_all(
        &self,
        session: Option<&TenantSession>,
        records: Vec<Record>,
    ) -> Vec<(Record, Option<ExternalData>)> {
        let (Some(session), Some(enricher), Some(transformer)) =
            (session, &self.enricher, &self.transformer)
        else {
            return records.into_iter().map(|r| (r, None)).collect();
        };
        let enrichment = transformer.enrichment();

        let mut resolved = Vec::with_capacity(records.len());
        for record in records {
            let external = enricher.resolve(session, &record, enrichment).await;
            if let ExternalData::Unresolved(reason) = &external {
                warn!(key = ?record.key(), reason = %reason, "could not resolve external data");
            }
            resolved.push((record, Some(external)));
        }
        resolved
    }

    /// Transform (or select for deletion) and write one page of records.
    async fn apply(
        &self,
        items: Vec<(Record, Option<ExternalData>)>,
        report: &mut JobReport,
    ) -> Result<(), StoreError> {
        let mode = self.job.action.write_mode();
        let now = self.clock();

        let outputs = match &self.transformer {
            None => items.into_iter().map(|(record, _)| record).collect(),
            Some(transformer) => {
                let mut outputs = Vec::new();
                for (record, external) in &items {
                    let mut ctx = TransformContext::new(now).with_missing_match(self.missing_match());
                    if let Some(external) = external {
                        ctx = ctx.with_external(external);
                    }
                    match transformer.transform(record, &ctx) {
                        Transformed::Update(mut output) => {
                            if index::has_primary_attributes(&output) {
                                index::reindex(&mut output).map_err(|e| {
                                    StoreError::InvalidRecord(format!(
                                        "{}: {}",
                                        transformer.name(),
                                        e
                                    ))
                                })?;
                            }
                            outputs.push(output);
                        }
                        Transformed::Skip(reason) => {
                            debug!(key = ?record.key(), ?reason, "record skipped");
                            report.record_skip(reason);
                        }
                    }
                }
                outputs
            }
        };

        self.write(outputs, mode, report).await
    }

    async fn write(
        &self,
        records: Vec<Record>,
        mode: WriteMode,
        report: &mut JobReport,
    ) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        report.phase = Phase::Writing;
        let writer = BatchWriter::new(&self.store, self.job.target_table())
            .chunk_size(self.job.chunk_size)
            .dry_run(self.dry_run)
            .retry(self.retry.clone());
        let summary = writer.write(records, mode).await?;

        report.transformed += summary.applied as u64;
        for failure in &summary.failed_chunks {
            warn!(
                chunk = failure.chunk_index,
                keys = failure.keys.len(),
                cause = %failure.cause,
                "chunk failed"
            );
        }
        report.failed_chunks.extend(summary.failed_chunks);
        Ok(())
    }
}
