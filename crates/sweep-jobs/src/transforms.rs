//! Built-in transforms and their JSON descriptions.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sweep_store::Record;

use crate::index;
use crate::model::attr;
use crate::transform::{
    Enrichment, ExternalData, RecordTransformer, RepoMatch, SkipReason, TransformContext,
    Transformed, finalize, missing_match,
};

/// Required status check that marks a branch as protected by the scanner.
pub const DEFAULT_CHECK_NAME: &str = "Jit Security";

/// Recompute every index field from the primary attributes.
#[derive(Debug, Clone, Default)]
pub struct Reindex;

impl RecordTransformer for Reindex {
    fn name(&self) -> &str {
        "reindex"
    }

    fn description(&self) -> &str {
        "recompute all denormalized index fields from primary attributes"
    }

    fn transform(&self, record: &Record, ctx: &TransformContext<'_>) -> Transformed {
        if !index::has_primary_attributes(record) {
            return Transformed::Skip(SkipReason::MissingAttributes);
        }
        finalize(record, record.clone(), ctx.now)
    }
}

/// Set `is_active`, optionally uncovering deactivated assets.
#[derive(Debug, Clone)]
pub struct SetActive {
    pub active: bool,
    pub also_uncover: bool,
}

impl RecordTransformer for SetActive {
    fn name(&self) -> &str {
        "set_active"
    }

    fn description(&self) -> &str {
        "set is_active and re-derive the index fields"
    }

    fn transform(&self, record: &Record, ctx: &TransformContext<'_>) -> Transformed {
        if !index::has_primary_attributes(record) {
            return Transformed::Skip(SkipReason::MissingAttributes);
        }
        let mut output = record.clone().with(attr::IS_ACTIVE, self.active);
        if !self.active && self.also_uncover {
            output.set(attr::IS_COVERED, false);
        }
        finalize(record, output, ctx.now)
    }
}

/// Set `is_covered` on every asset except the excluded names.
#[derive(Debug, Clone)]
pub struct SetCovered {
    pub covered: bool,
    pub exclude_names: Vec<String>,
}

impl RecordTransformer for SetCovered {
    fn name(&self) -> &str {
        "set_covered"
    }

    fn description(&self) -> &str {
        "set is_covered, skipping excluded asset names"
    }

    fn transform(&self, record: &Record, ctx: &TransformContext<'_>) -> Transformed {
        let excluded = record
            .get_str(attr::ASSET_NAME)
            .is_some_and(|name| self.exclude_names.iter().any(|n| n == name));
        if excluded {
            return Transformed::Skip(SkipReason::NotApplicable);
        }
        finalize(record, record.clone().with(attr::IS_COVERED, self.covered), ctx.now)
    }
}

/// Default `is_branch_protected_by_jit` to `false` where it is missing or null.
#[derive(Debug, Clone, Default)]
pub struct DefaultBranchProtection;

impl RecordTransformer for DefaultBranchProtection {
    fn name(&self) -> &str {
        "default_branch_protection"
    }

    fn description(&self) -> &str {
        "set is_branch_protected_by_jit=false where missing or null"
    }

    fn transform(&self, record: &Record, ctx: &TransformContext<'_>) -> Transformed {
        if !record.is_missing_or_null(attr::IS_BRANCH_PROTECTED_BY_JIT) {
            return Transformed::Skip(SkipReason::NotApplicable);
        }
        let output = record
            .clone()
            .with(attr::IS_BRANCH_PROTECTED_BY_JIT, false);
        finalize(record, output, ctx.now)
    }
}

/// Resolve the matched repository, or the outcome for records without one.
fn matched<'a>(
    record: &Record,
    ctx: &'a TransformContext<'_>,
) -> Result<&'a RepoMatch, Transformed> {
    match ctx.external {
        Some(ExternalData::Matched(found)) => Ok(found),
        Some(ExternalData::NotFound) => Err(missing_match(record, ctx)),
        Some(ExternalData::Unresolved(_)) | None => {
            Err(Transformed::Skip(SkipReason::Unresolved))
        }
    }
}

/// Copy the repository's archived flag; archived repositories are uncovered.
#[derive(Debug, Clone, Default)]
pub struct ArchivedFlag;

impl RecordTransformer for ArchivedFlag {
    fn name(&self) -> &str {
        "archived_flag"
    }

    fn description(&self) -> &str {
        "copy the repository's archived flag and uncover archived repositories"
    }

    fn enrichment(&self) -> Enrichment {
        Enrichment::Repository
    }

    fn transform(&self, record: &Record, ctx: &TransformContext<'_>) -> Transformed {
        let found = match matched(record, ctx) {
            Ok(found) => found,
            Err(outcome) => return outcome,
        };
        let archived = found.repository.archived;
        let covered = if record.get_bool(attr::IS_COVERED) == Some(false) {
            false
        } else {
            !archived
        };
        let output = record
            .clone()
            .with(attr::IS_ARCHIVED, archived)
            .with(attr::IS_COVERED, covered);
        finalize(record, output, ctx.now)
    }
}

/// Record repository details and whether the default branch requires a check.
#[derive(Debug, Clone)]
pub struct BranchProtection {
    pub check_name: String,
}

impl Default for BranchProtection {
    fn default() -> Self {
        Self {
            check_name: DEFAULT_CHECK_NAME.to_string(),
        }
    }
}

impl RecordTransformer for BranchProtection {
    fn name(&self) -> &str {
        "branch_protection"
    }

    fn description(&self) -> &str {
        "record repository id, default branch, visibility and required-check protection"
    }

    fn enrichment(&self) -> Enrichment {
        Enrichment::RepositoryAndProtection
    }

    fn transform(&self, record: &Record, ctx: &TransformContext<'_>) -> Transformed {
        let found = match matched(record, ctx) {
            Ok(found) => found,
            Err(outcome) => return outcome,
        };
        let repository = &found.repository;
        let protected = found
            .protection
            .as_ref()
            .is_some_and(|p| p.requires(&self.check_name));

        let mut output = record
            .clone()
            .with(attr::EXTERNAL_REPOSITORY_ID, repository.id)
            .with(attr::IS_PRIVATE, repository.private)
            .with(attr::IS_BRANCH_PROTECTED_BY_JIT, protected);
        if let Some(branch) = &repository.default_branch {
            output.set(attr::DEFAULT_BRANCH, branch.clone());
        }
        finalize(record, output, ctx.now)
    }
}

/// Activate assets whose repository exists; the missing-match policy handles the rest.
#[derive(Debug, Clone, Default)]
pub struct SyncActive;

impl RecordTransformer for SyncActive {
    fn name(&self) -> &str {
        "sync_active"
    }

    fn description(&self) -> &str {
        "activate assets with a live repository and apply the missing-match policy to the rest"
    }

    fn enrichment(&self) -> Enrichment {
        Enrichment::Repository
    }

    fn transform(&self, record: &Record, ctx: &TransformContext<'_>) -> Transformed {
        let found = match matched(record, ctx) {
            Ok(found) => found,
            Err(outcome) => return outcome,
        };
        if !index::has_primary_attributes(record) {
            return Transformed::Skip(SkipReason::MissingAttributes);
        }
        let output = record
            .clone()
            .with(attr::IS_ACTIVE, true)
            .with(attr::EXTERNAL_ID, found.repository.id);
        finalize(record, output, ctx.now)
    }
}

/// JSON description of a built-in transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransformSpec {
    Reindex,
    SetActive {
        active: bool,
        #[serde(default)]
        also_uncover: bool,
    },
    SetCovered {
        covered: bool,
        #[serde(default)]
        exclude_names: Vec<String>,
    },
    DefaultBranchProtection,
    ArchivedFlag,
    BranchProtection {
        #[serde(default = "default_check_name")]
        check_name: String,
    },
    SyncActive,
}

fn default_check_name() -> String {
    DEFAULT_CHECK_NAME.to_string()
}

impl TransformSpec {
    pub fn build(&self) -> Arc<dyn RecordTransformer> {
        match self {
            TransformSpec::Reindex => Arc::new(Reindex),
            TransformSpec::SetActive {
                active,
                also_uncover,
            } => Arc::new(SetActive {
                active: *active,
                also_uncover: *also_uncover,
            }),
            TransformSpec::SetCovered {
                covered,
                exclude_names,
            } => Arc::new(SetCovered {
                covered: *covered,
                exclude_names: exclude_names.clone(),
            }),
            TransformSpec::DefaultBranchProtection => Arc::new(DefaultBranchProtection),
            TransformSpec::ArchivedFlag => Arc::new(ArchivedFlag),
            TransformSpec::BranchProtection { check_name } => Arc::new(BranchProtection {
                check_name: check_name.clone(),
            }),
            TransformSpec::SyncActive => Arc::new(SyncActive),
        }
    }
}

/// Every built-in transform with default parameters, for listings.
pub fn catalog() -> Vec<Arc<dyn RecordTransformer>> {
    vec![
        Arc::new(Reindex),
        Arc::new(SetActive {
            active: false,
            also_uncover: true,
        }),
        Arc::new(SetCovered {
            covered: true,
            exclude_names: Vec::new(),
        }),
        Arc::new(DefaultBranchProtection),
        Arc::new(ArchivedFlag),
        Arc::new(BranchProtection::default()),
        Arc::new(SyncActive),
    ]
}
