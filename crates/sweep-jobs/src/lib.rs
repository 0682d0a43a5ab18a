//! Declarative bulk-transform jobs over the asset and tenant tables.
//!
//! A job pages through a table (or through tenant installations and then each
//! tenant's assets), optionally enriches assets from the GitHub App API,
//! applies a pure transform, and writes the result in bounded batches.
//!
//! ## Features
//!
//! - **Transforms**: pure [`RecordTransformer`] strategies; every update has
//!   its denormalized index fields re-derived from primary attributes
//! - **Jobs**: JSON job descriptions with explicit missing-match policies
//! - **Checkpoints**: progress saved after every page, resumable after a
//!   failure or cancellation
//! - **Dry runs**: the full pipeline without a single write

mod checkpoint;
mod enrich;
mod error;
pub mod index;
mod job;
pub mod model;
mod runner;
pub mod transform;
pub mod transforms;

pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use enrich::{Enricher, SessionError, TenantSession};
pub use error::JobError;
pub use job::{Action, JobSpec, Scope, TenantScope};
pub use model::{MissingAttribute, Tenant};
pub use runner::{JobReport, JobRunner, Phase, TenantSkip};
pub use transform::{
    Enrichment, ExternalData, MissingMatchPolicy, Protection, RecordTransformer, RepoMatch,
    SkipReason, TransformContext, Transformed,
};
pub use transforms::TransformSpec;
