//! Bounded, idempotent batch writes with a dry-run short circuit.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::StoreError;
use crate::record::{Record, RecordKey};
use crate::retry::{RetryConfig, with_retry};
use crate::store::{MAX_BATCH_WRITE, Store, WriteOp};

/// What a batch write does with each record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Full-item replace keyed by `PK`/`SK`.
    Upsert,
    /// Delete by the record's explicit `PK`/`SK`.
    Delete,
}

/// A chunk whose write failed after retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkFailure {
    pub chunk_index: usize,
    pub keys: Vec<RecordKey>,
    pub cause: String,
}

/// Outcome of [`BatchWriter::write`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteSummary {
    /// Records written (or that would have been, in a dry run).
    pub applied: usize,
    /// Chunks the records were split into.
    pub chunks: usize,
    pub failed_chunks: Vec<ChunkFailure>,
}

impl WriteSummary {
    pub fn is_clean(&self) -> bool {
        self.failed_chunks.is_empty()
    }
}

/// Splits records into store-sized chunks and writes them one call per chunk.
///
/// Chunks are independent: a failed chunk is reported and later chunks are
/// still attempted, while earlier ones stay applied.
pub struct BatchWriter<S> {
    store: S,
    table: String,
    chunk_size: usize,
    dry_run: bool,
    retry: RetryConfig,
}

impl<S: Store> BatchWriter<S> {
    pub fn new(store: S, table: impl Into<String>) -> Self {
        Self {
            store,
            table: table.into(),
            chunk_size: MAX_BATCH_WRITE,
            dry_run: false,
            retry: RetryConfig::default(),
        }
    }

    /// Chunk size, clamped to `1..=MAX_BATCH_WRITE`.
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.clamp(1, MAX_BATCH_WRITE);
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Write `records` in chunks.
    ///
    /// Every record must carry its primary key; otherwise nothing is written
    /// and [`StoreError::InvalidRecord`] is returned. Duplicate keys collapse
    /// to the last occurrence.
    pub async fn write(
        &self,
        records: Vec<Record>,
        mode: WriteMode,
    ) -> Result<WriteSummary, StoreError> {
        let ops = Self::plan(records, mode)?;
        let mut summary = WriteSummary::default();
        if ops.is_empty() {
            return Ok(summary);
        }

        for (chunk_index, chunk) in ops.chunks(self.chunk_size).enumerate() {
            summary.chunks += 1;

            if self.dry_run {
                for (key, _) in chunk {
                    debug!(table = %self.table, ?mode, key = %key, "dry run: would write");
                }
                summary.applied += chunk.len();
                continue;
            }

            let batch: Vec<WriteOp> = chunk.iter().map(|(_, op)| op.clone()).collect();
            let (store, table, ops) = (&self.store, self.table.as_str(), batch.as_slice());
            let result =
                with_retry(&self.retry, "batch_write", move || store.batch_write(table, ops)).await;

            match result {
                Ok(()) => {
                    debug!(table = %self.table, chunk_index, size = chunk.len(), "chunk written");
                    summary.applied += chunk.len();
                }
                Err(e) => {
                    let keys: Vec<RecordKey> = chunk.iter().map(|(key, _)| key.clone()).collect();
                    warn!(
                        table = %self.table,
                        chunk_index,
                        keys = ?keys.iter().map(ToString::to_string).collect::<Vec<_>>(),
                        error = %e,
                        "chunk write failed"
                    );
                    summary.failed_chunks.push(ChunkFailure {
                        chunk_index,
                        keys,
                        cause: e.to_string(),
                    });
                }
            }
        }

        info!(
            table = %self.table,
            ?mode,
            dry_run = self.dry_run,
            applied = summary.applied,
            chunks = summary.chunks,
            failed_chunks = summary.failed_chunks.len(),
            "batch write finished"
        );
        Ok(summary)
    }

    /// Validate keys and collapse duplicates, keeping first position and last value.
    fn plan(records: Vec<Record>, mode: WriteMode) -> Result<Vec<(RecordKey, WriteOp)>, StoreError> {
        let mut ops: Vec<(RecordKey, WriteOp)> = Vec::with_capacity(records.len());
        let mut positions: HashMap<RecordKey, usize> = HashMap::new();

        for record in records {
            let key = record.require_key()?;
            let op = match mode {
                WriteMode::Upsert => WriteOp::Put(record),
                WriteMode::Delete => WriteOp::Delete(key.clone()),
            };
            match positions.get(&key) {
                Some(&at) => ops[at].1 = op,
                None => {
                    positions.insert(key.clone(), ops.len());
                    ops.push((key, op));
                }
            }
        }
        Ok(ops)
    }
}
