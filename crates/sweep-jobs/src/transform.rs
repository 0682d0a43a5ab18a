//! The record transformer strategy.
//!
//! A transformer is a pure function from an input record (plus the time and
//! optional external data) to an update or a skip. It never performs I/O; the
//! runner gathers external data beforehand and hands it over through
//! [`TransformContext`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sweep_github::Repository;
use sweep_store::Record;

use crate::index;
use crate::model::attr;

/// External data a transformer needs the runner to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Enrichment {
    None,
    /// The matching installation repository.
    Repository,
    /// The matching repository and its default branch's required checks.
    RepositoryAndProtection,
}

impl Enrichment {
    pub fn needs_repository(self) -> bool {
        self != Enrichment::None
    }

    pub fn needs_protection(self) -> bool {
        self == Enrichment::RepositoryAndProtection
    }
}

/// What to do with a record whose external counterpart does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingMatchPolicy {
    LeaveUnchanged,
    /// Deactivate the asset (and uncover it).
    MarkInactive,
}

/// Branch protection state of a repository's default branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protection {
    NotConfigured,
    Contexts(Vec<String>),
}

impl Protection {
    pub fn from_contexts(contexts: Option<Vec<String>>) -> Self {
        match contexts {
            Some(contexts) => Protection::Contexts(contexts),
            None => Protection::NotConfigured,
        }
    }

    pub fn requires(&self, check_name: &str) -> bool {
        match self {
            Protection::NotConfigured => false,
            Protection::Contexts(contexts) => contexts.iter().any(|c| c == check_name),
        }
    }
}

/// A record's matched repository.
#[derive(Debug, Clone, PartialEq)]
pub struct RepoMatch {
    pub repository: Repository,
    /// Present when the transformer asked for protection data.
    pub protection: Option<Protection>,
}

/// Result of looking up a record's external counterpart.
#[derive(Debug, Clone, PartialEq)]
pub enum ExternalData {
    Matched(RepoMatch),
    NotFound,
    /// The lookup failed; the record is left alone.
    Unresolved(String),
}

/// Why a record was not updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The transform does not apply to this record.
    NotApplicable,
    /// Primary attributes the transform needs are absent.
    MissingAttributes,
    /// No external counterpart and the policy leaves the record as is.
    NoMatch,
    /// External data could not be fetched.
    Unresolved,
    /// The output would move the record to another key.
    KeyChanged,
    /// The output equals the input.
    Unchanged,
}

/// Outcome of transforming one record.
#[derive(Debug, Clone, PartialEq)]
pub enum Transformed {
    Update(Record),
    Skip(SkipReason),
}

/// Inputs of a transform besides the record itself.
#[derive(Debug, Clone, Copy)]
pub struct TransformContext<'a> {
    pub now: DateTime<Utc>,
    pub external: Option<&'a ExternalData>,
    pub missing_match: MissingMatchPolicy,
}

impl<'a> TransformContext<'a> {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            external: None,
            missing_match: MissingMatchPolicy::LeaveUnchanged,
        }
    }

    pub fn with_external(mut self, external: &'a ExternalData) -> Self {
        self.external = Some(external);
        self
    }

    pub fn with_missing_match(mut self, policy: MissingMatchPolicy) -> Self {
        self.missing_match = policy;
        self
    }
}

/// A pure record-to-update strategy.
pub trait RecordTransformer: Send + Sync {
    /// Short identifier used in logs and reports.
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn enrichment(&self) -> Enrichment {
        Enrichment::None
    }

    fn transform(&self, record: &Record, ctx: &TransformContext<'_>) -> Transformed;
}

/// Render a timestamp the way asset records store them:
/// `YYYY-MM-DDTHH:MM:SS.mmm000`, UTC without a zone suffix.
pub fn format_timestamp(now: DateTime<Utc>) -> String {
    format!("{}000", now.format("%Y-%m-%dT%H:%M:%S%.3f"))
}

/// Turn a candidate output into the final outcome.
///
/// Rejects key changes, re-derives every index field when the output carries
/// the primary attributes, and stamps `modified_at` only when something other
/// than the timestamp changed.
pub fn finalize(input: &Record, mut output: Record, now: DateTime<Utc>) -> Transformed {
    if input.key() != output.key() {
        return Transformed::Skip(SkipReason::KeyChanged);
    }
    if index::has_primary_attributes(&output) && index::reindex(&mut output).is_err() {
        return Transformed::Skip(SkipReason::MissingAttributes);
    }
    if input.eq_ignoring(&output, &[attr::MODIFIED_AT]) {
        return Transformed::Skip(SkipReason::Unchanged);
    }
    output.set(attr::MODIFIED_AT, format_timestamp(now));
    Transformed::Update(output)
}

/// Apply the missing-match policy to a record without an external counterpart.
pub fn missing_match(record: &Record, ctx: &TransformContext<'_>) -> Transformed {
    match ctx.missing_match {
        MissingMatchPolicy::LeaveUnchanged => Transformed::Skip(SkipReason::NoMatch),
        MissingMatchPolicy::MarkInactive => {
            let output = record
                .clone()
                .with(attr::IS_ACTIVE, false)
                .with(attr::IS_COVERED, false);
            finalize(record, output, ctx.now)
        }
    }
}
