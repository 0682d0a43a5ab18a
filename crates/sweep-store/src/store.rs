//! The storage interface the engine needs.

use async_trait::async_trait;

use crate::condition::ReadRequest;
use crate::record::{Cursor, Record, RecordKey};
use crate::StoreError;

/// Store-imposed maximum number of operations in one batch write call.
pub const MAX_BATCH_WRITE: usize = 25;

/// One page of a paginated read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    /// Items that passed the filter; may be empty while the read continues.
    pub items: Vec<Record>,
    /// Where the next page starts. `None` means the read is exhausted.
    pub cursor: Option<Cursor>,
}

/// A single operation inside a batch write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Full-item replace keyed by the record's primary key.
    Put(Record),
    /// Delete by explicit key.
    Delete(RecordKey),
}

impl WriteOp {
    pub fn key(&self) -> Option<RecordKey> {
        match self {
            WriteOp::Put(record) => record.key(),
            WriteOp::Delete(key) => Some(key.clone()),
        }
    }
}

/// A partitioned key-value store with secondary indexes and pagination tokens.
#[async_trait]
pub trait Store: Send + Sync {
    /// Read one page, starting after `start` (or from the beginning).
    async fn read_page(
        &self,
        request: &ReadRequest,
        start: Option<&Cursor>,
    ) -> Result<Page, StoreError>;

    /// Apply up to [`MAX_BATCH_WRITE`] operations in one call.
    ///
    /// There is no atomicity guarantee across the operations in a batch.
    async fn batch_write(&self, table: &str, ops: &[WriteOp]) -> Result<(), StoreError>;

    /// Fetch a single record by key.
    async fn get(&self, table: &str, key: &RecordKey) -> Result<Option<Record>, StoreError>;
}

#[async_trait]
impl<S: Store + ?Sized> Store for std::sync::Arc<S> {
    async fn read_page(
        &self,
        request: &ReadRequest,
        start: Option<&Cursor>,
    ) -> Result<Page, StoreError> {
        (**self).read_page(request, start).await
    }

    async fn batch_write(&self, table: &str, ops: &[WriteOp]) -> Result<(), StoreError> {
        (**self).batch_write(table, ops).await
    }

    async fn get(&self, table: &str, key: &RecordKey) -> Result<Option<Record>, StoreError> {
        (**self).get(table, key).await
    }
}

#[async_trait]
impl<S: Store + ?Sized> Store for &S {
    async fn read_page(
        &self,
        request: &ReadRequest,
        start: Option<&Cursor>,
    ) -> Result<Page, StoreError> {
        (**self).read_page(request, start).await
    }

    async fn batch_write(&self, table: &str, ops: &[WriteOp]) -> Result<(), StoreError> {
        (**self).batch_write(table, ops).await
    }

    async fn get(&self, table: &str, key: &RecordKey) -> Result<Option<Record>, StoreError> {
        (**self).get(table, key).await
    }
}
