//! Table-scoped jobs against the in-memory store.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use pretty_assertions::assert_eq;
use serde_json::json;
use sweep_jobs::{
    Checkpoint, CheckpointStore, JobError, JobRunner, JobSpec, MemoryCheckpointStore, Phase,
    index,
};
use sweep_store::{
    Cursor, MemoryStore, Page, ReadRequest, Record, RecordKey, RetryConfig, Store, StoreError,
    WriteOp,
};
use tokio::sync::watch;

const ASSETS: &str = "Assets";

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

/// An asset whose index fields are missing.
fn stale_asset(i: usize, active: bool) -> Record {
    Record::from_value(json!({
        "PK": "TENANT#t1",
        "SK": format!("ASSET#{:03}", i),
        "tenant_id": "t1",
        "asset_id": format!("{:03}", i),
        "asset_type": "repo",
        "vendor": "github",
        "owner": "acme",
        "asset_name": format!("repo-{}", i),
        "is_active": active,
        "modified_at": "2023-01-01T00:00:00.000000"
    }))
    .unwrap()
}

async fn seeded(count: usize) -> MemoryStore {
    let store = MemoryStore::new();
    store
        .insert_all(ASSETS, (0..count).map(|i| stale_asset(i, true)))
        .await
        .unwrap();
    store
}

fn job(value: serde_json::Value) -> JobSpec {
    JobSpec::from_json(&value.to_string()).unwrap()
}

fn reindex_job(page_size: Option<u32>) -> JobSpec {
    let mut value = json!({
        "name": "backfill-gsi4",
        "scope": {"type": "table", "source": {"table": ASSETS}},
        "action": {"type": "transform", "transform": {"kind": "reindex"}}
    });
    if let Some(size) = page_size {
        value["page_size"] = json!(size);
    }
    job(value)
}

fn runner<S: Store>(store: S, job: JobSpec) -> JobRunner<S> {
    JobRunner::new(store, job)
        .unwrap()
        .retry(RetryConfig::immediate(2))
        .now(now())
}

#[tokio::test]
async fn test_thirty_records_take_two_write_calls_and_rerun_writes_nothing() {
    let store = seeded(30).await;

    let report = runner(&store, reindex_job(None)).run(None).await.unwrap();
    assert_eq!(report.phase, Phase::Completed);
    assert_eq!(report.processed, 30);
    assert_eq!(report.transformed, 30);
    assert_eq!(store.write_calls(), 2);
    let first_pass = store.records(ASSETS).await;
    assert!(first_pass.iter().all(index::is_consistent));

    let report = runner(&store, reindex_job(None)).run(None).await.unwrap();
    assert_eq!(report.transformed, 0);
    assert_eq!(report.unchanged, 30);
    assert_eq!(store.write_calls(), 2);
    assert_eq!(store.records(ASSETS).await, first_pass);
}

#[tokio::test]
async fn test_dry_run_writes_nothing_and_reports_the_same_count() {
    let store = seeded(30).await;
    let before = store.records(ASSETS).await;

    let report = runner(&store, reindex_job(None))
        .dry_run(true)
        .run(None)
        .await
        .unwrap();
    assert!(report.dry_run);
    assert_eq!(report.transformed, 30);
    assert_eq!(store.write_calls(), 0);
    assert_eq!(store.records(ASSETS).await, before);
}

/// Fails every read after the first `healthy` ones with a non-retryable error.
struct FlakyStore {
    inner: MemoryStore,
    healthy: usize,
    reads: AtomicUsize,
}

#[async_trait]
impl Store for FlakyStore {
    async fn read_page(
        &self,
        request: &ReadRequest,
        start: Option<&Cursor>,
    ) -> Result<Page, StoreError> {
        if self.reads.fetch_add(1, Ordering::SeqCst) >= self.healthy {
            return Err(StoreError::Backend("connection reset".to_string()));
        }
        self.inner.read_page(request, start).await
    }

    async fn batch_write(&self, table: &str, ops: &[WriteOp]) -> Result<(), StoreError> {
        self.inner.batch_write(table, ops).await
    }

    async fn get(&self, table: &str, key: &RecordKey) -> Result<Option<Record>, StoreError> {
        self.inner.get(table, key).await
    }
}

#[tokio::test]
async fn test_resume_after_failure_matches_uninterrupted_run() {
    let reference = seeded(30).await;
    runner(&reference, reindex_job(Some(10)))
        .run(None)
        .await
        .unwrap();

    let flaky = FlakyStore {
        inner: seeded(30).await,
        healthy: 2,
        reads: AtomicUsize::new(0),
    };
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let err = runner(&flaky, reindex_job(Some(10)))
        .checkpoints(checkpoints.clone())
        .run(None)
        .await
        .unwrap_err();

    let checkpoint = match err {
        JobError::Aborted { source, checkpoint } => {
            assert!(matches!(source, StoreError::Backend(_)));
            *checkpoint.expect("aborted run carries its checkpoint")
        }
        other => panic!("expected Aborted, got {:?}", other),
    };
    assert_eq!(checkpoint.processed_count, 20);
    assert!(checkpoint.last_cursor.is_some());
    assert_eq!(checkpoints.current(), Some(checkpoint.clone()));

    let report = runner(&flaky.inner, reindex_job(Some(10)))
        .checkpoints(checkpoints.clone())
        .run(Some(checkpoint))
        .await
        .unwrap();
    assert_eq!(report.processed, 30);
    assert_eq!(report.transformed, 10);
    assert_eq!(checkpoints.current(), None);
    assert_eq!(
        flaky.inner.records(ASSETS).await,
        reference.records(ASSETS).await
    );
}

/// Flips the cancellation flag as soon as the first checkpoint is saved.
struct CancelAfterFirstSave {
    inner: MemoryCheckpointStore,
    cancel: watch::Sender<bool>,
}

#[async_trait]
impl CheckpointStore for CancelAfterFirstSave {
    async fn load(&self) -> Result<Option<Checkpoint>, JobError> {
        self.inner.load().await
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), JobError> {
        self.inner.save(checkpoint).await?;
        let _ = self.cancel.send(true);
        Ok(())
    }

    async fn clear(&self) -> Result<(), JobError> {
        self.inner.clear().await
    }
}

#[tokio::test]
async fn test_cancellation_stops_between_pages_and_keeps_checkpoint() {
    let store = seeded(30).await;
    let (tx, rx) = watch::channel(false);
    let checkpoints = Arc::new(CancelAfterFirstSave {
        inner: MemoryCheckpointStore::new(),
        cancel: tx,
    });

    let report = runner(&store, reindex_job(Some(10)))
        .checkpoints(checkpoints.clone())
        .cancel_on(rx)
        .run(None)
        .await
        .unwrap();
    assert_eq!(report.phase, Phase::Cancelled);
    assert_eq!(report.pages, 1);
    assert_eq!(report.transformed, 10);

    let checkpoint = checkpoints.inner.current().unwrap();
    assert_eq!(checkpoint.processed_count, 10);

    let report = runner(&store, reindex_job(Some(10)))
        .run(Some(checkpoint))
        .await
        .unwrap();
    assert_eq!(report.phase, Phase::Completed);
    assert_eq!(report.transformed, 20);
    assert!(store.records(ASSETS).await.iter().all(index::is_consistent));
}

#[tokio::test]
async fn test_dry_run_checkpoint_is_rejected_by_real_run() {
    let store = seeded(3).await;
    let checkpoint = Checkpoint::start("backfill-gsi4", true, now());
    let err = runner(&store, reindex_job(None))
        .run(Some(checkpoint))
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::CheckpointMismatch(_)));
    assert_eq!(store.read_calls(), 0);
}

#[tokio::test]
async fn test_delete_action_removes_selected_records() {
    let store = seeded(5).await;
    store
        .insert_all(ASSETS, (5..8).map(|i| stale_asset(i, false)))
        .await
        .unwrap();

    let delete_job = job(json!({
        "name": "purge-inactive",
        "scope": {
            "type": "table",
            "source": {
                "table": ASSETS,
                "key": {"partition": "TENANT#t1"},
                "filter": {"op": "eq", "attr": "is_active", "value": false}
            }
        },
        "action": {"type": "delete"}
    }));
    let report = runner(&store, delete_job).run(None).await.unwrap();
    assert_eq!(report.transformed, 3);
    assert_eq!(store.len(ASSETS).await, 5);
    assert!(
        store
            .records(ASSETS)
            .await
            .iter()
            .all(|r| r.get_bool("is_active") == Some(true))
    );
}

#[tokio::test]
async fn test_rejected_chunk_is_reported_and_later_chunks_still_written() {
    let store = seeded(30).await;
    store
        .reject_key(RecordKey::new("TENANT#t1", "ASSET#003"))
        .await;

    let report = runner(&store, reindex_job(None)).run(None).await.unwrap();
    assert_eq!(report.phase, Phase::Completed);
    assert_eq!(report.failed_chunks.len(), 1);
    assert_eq!(report.failed_chunks[0].keys.len(), 25);
    assert_eq!(report.transformed, 5);
    assert!(!report.is_clean());

    let fixed = store
        .records(ASSETS)
        .await
        .iter()
        .filter(|r| index::is_consistent(r))
        .count();
    assert_eq!(fixed, 5);
}

#[tokio::test]
async fn test_drift_filter_selects_only_inconsistent_assets() {
    let store = seeded(0).await;
    let mut healthy = stale_asset(1, true);
    index::reindex(&mut healthy).unwrap();
    let mut drifted = stale_asset(2, false);
    index::reindex(&mut drifted).unwrap();
    drifted.set("GSI1SK", "TENANT#t1#ACTIVE#true");
    store.insert_all(ASSETS, [healthy, drifted]).await.unwrap();

    let repair = job(json!({
        "name": "repair-gsi-drift",
        "scope": {
            "type": "table",
            "source": {
                "table": ASSETS,
                "filter": {"op": "attr_ne", "left": "GSI2SK", "right": "GSI1SK"}
            }
        },
        "action": {"type": "transform", "transform": {"kind": "reindex"}}
    }));
    let report = runner(&store, repair).run(None).await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.transformed, 1);
    assert!(store.records(ASSETS).await.iter().all(index::is_consistent));
}
