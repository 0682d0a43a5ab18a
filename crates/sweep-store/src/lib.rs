//! Storage layer for sweep jobs.
//!
//! This crate provides the record model and the two primitives every bulk
//! transform is built from: paginated reads and bounded batch writes.
//!
//! ## Features
//!
//! - **Paginator**: lazy, restartable paging over a query or scan, retrying
//!   transient failures against the same cursor
//! - **BatchWriter**: chunked upserts and deletes with dry-run support and
//!   per-chunk failure reporting
//! - **MemoryStore**: in-process store with sparse indexes, for tests and rehearsals
//! - **DynamoStore** (feature `dynamodb`): Amazon DynamoDB backend

pub mod condition;
mod error;
mod memory;
mod paginator;
mod record;
mod retry;
mod store;
mod writer;

#[cfg(feature = "dynamodb")]
pub mod dynamodb;

pub use condition::{Filter, KeyCondition, ReadRequest, SortCondition};
pub use error::StoreError;
pub use memory::MemoryStore;
pub use paginator::Paginator;
pub use record::{Cursor, PARTITION_KEY, Record, RecordKey, SORT_KEY};
pub use retry::{RetryConfig, with_retry};
pub use store::{MAX_BATCH_WRITE, Page, Store, WriteOp};
pub use writer::{BatchWriter, ChunkFailure, WriteMode, WriteSummary};

#[cfg(feature = "dynamodb")]
pub use dynamodb::{DynamoConfig, DynamoStore};
