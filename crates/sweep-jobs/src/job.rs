//! Declarative job descriptions.
//!
//! A job is plain JSON: where the records come from, what happens to them,
//! and the policies that govern writes and missing external data.
//!
//! ```json
//! {
//!   "name": "backfill-gsi4",
//!   "scope": {
//!     "type": "table",
//!     "source": {
//!       "table": "Assets",
//!       "filter": {"op": "and", "all": [
//!         {"op": "not_exists", "attr": "GSI4PK"},
//!         {"op": "exists", "attr": "GSI1PK"}
//!       ]}
//!     }
//!   },
//!   "action": {"type": "transform", "transform": {"kind": "reindex"}}
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use sweep_github::DEFAULT_SECRET_TEMPLATE;
use sweep_store::{Filter, KeyCondition, MAX_BATCH_WRITE, ReadRequest, WriteMode};

use crate::JobError;
use crate::model::attr;
use crate::transform::MissingMatchPolicy;
use crate::transforms::TransformSpec;

/// A complete job description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Identifies the job in logs, reports and checkpoints.
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    pub scope: Scope,

    pub action: Action,

    /// Table written to. Defaults to the table records are read from.
    #[serde(default)]
    pub target_table: Option<String>,

    /// Required for jobs whose transform uses external data.
    #[serde(default)]
    pub missing_match: Option<MissingMatchPolicy>,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Items evaluated per store read. Store default when unset.
    #[serde(default)]
    pub page_size: Option<u32>,

    /// Tenants processed concurrently within one tenant page.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_chunk_size() -> usize {
    MAX_BATCH_WRITE
}

fn default_concurrency() -> usize {
    1
}

/// Where a job's records come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Scope {
    /// Page through one table or index directly.
    Table { source: ReadRequest },
    /// Page through tenant installations and process each tenant's assets.
    Tenants(TenantScope),
}

/// Tenant-by-tenant processing with GitHub enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantScope {
    pub table: String,
    pub index: Option<String>,
    pub partition_attr: String,
    pub partition: String,
    pub vendor: String,
    /// Only these tenant ids, when set.
    pub include: Option<Vec<String>>,
    /// Secret name holding the app key; `{app_id}` is substituted.
    pub secret_name_template: String,
    pub assets_table: String,
    pub asset_type: String,
    pub active_only: bool,
    /// Extra filter ANDed into each tenant's asset query.
    pub asset_filter: Option<Filter>,
    /// Repositories per listing request.
    pub per_page: u32,
}

impl Default for TenantScope {
    fn default() -> Self {
        Self {
            table: "Tenants".to_string(),
            index: Some("GSI5".to_string()),
            partition_attr: "GSI5PK".to_string(),
            partition: "TYPE#Installation#ACTIVE#True".to_string(),
            vendor: "github".to_string(),
            include: None,
            secret_name_template: DEFAULT_SECRET_TEMPLATE.to_string(),
            assets_table: "Assets".to_string(),
            asset_type: "repo".to_string(),
            active_only: false,
            asset_filter: None,
            per_page: 100,
        }
    }
}

impl TenantScope {
    /// The paginated read over tenant installations.
    pub fn tenant_request(&self, page_size: Option<u32>) -> ReadRequest {
        let key = KeyCondition::partition_on(self.partition_attr.clone(), self.partition.clone());
        let mut request = ReadRequest::query(self.table.clone(), key)
            .with_filter(Filter::eq(attr::VENDOR, self.vendor.clone()));
        if let Some(index) = &self.index {
            request = request.on_index(index.clone());
        }
        if let Some(limit) = page_size {
            request = request.with_limit(limit);
        }
        request
    }

    /// The paginated read over one tenant's assets.
    pub fn asset_request(&self, tenant_id: &str, owner: &str, page_size: Option<u32>) -> ReadRequest {
        let key = KeyCondition::partition(format!("TENANT#{}", tenant_id));
        let mut filters = vec![
            Filter::eq(attr::VENDOR, self.vendor.clone()),
            Filter::eq(attr::OWNER, owner),
            Filter::eq(attr::ASSET_TYPE, self.asset_type.clone()),
        ];
        if self.active_only {
            filters.push(Filter::eq(attr::IS_ACTIVE, true));
        }
        if let Some(extra) = &self.asset_filter {
            filters.push(extra.clone());
        }
        let mut request =
            ReadRequest::query(self.assets_table.clone(), key).with_filter(Filter::and(filters));
        if let Some(limit) = page_size {
            request = request.with_limit(limit);
        }
        request
    }

    pub fn includes(&self, tenant_id: &str) -> bool {
        self.include
            .as_ref()
            .is_none_or(|ids| ids.iter().any(|id| id == tenant_id))
    }
}

/// What happens to each selected record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Transform and upsert.
    Transform { transform: TransformSpec },
    /// Delete every selected record by key.
    Delete,
}

impl Action {
    pub fn write_mode(&self) -> WriteMode {
        match self {
            Action::Transform { .. } => WriteMode::Upsert,
            Action::Delete => WriteMode::Delete,
        }
    }
}

impl JobSpec {
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, JobError> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        let job: JobSpec = serde_json::from_str(&content)?;
        job.validate()?;
        Ok(job)
    }

    pub fn from_json(json: &str) -> Result<Self, JobError> {
        let job: JobSpec = serde_json::from_str(json)?;
        job.validate()?;
        Ok(job)
    }

    /// Table the job writes to.
    pub fn target_table(&self) -> &str {
        if let Some(table) = &self.target_table {
            return table;
        }
        match &self.scope {
            Scope::Table { source } => &source.table,
            Scope::Tenants(tenants) => &tenants.assets_table,
        }
    }

    /// Check the description for combinations the runner cannot execute.
    pub fn validate(&self) -> Result<(), JobError> {
        let invalid = |msg: String| Err(JobError::InvalidJob(msg));

        if self.name.trim().is_empty() {
            return invalid("job name must not be empty".to_string());
        }
        if !(1..=MAX_BATCH_WRITE).contains(&self.chunk_size) {
            return invalid(format!(
                "chunk_size must be between 1 and {}, got {}",
                MAX_BATCH_WRITE, self.chunk_size
            ));
        }
        if self.concurrency == 0 {
            return invalid("concurrency must be at least 1".to_string());
        }
        if self.page_size == Some(0) {
            return invalid("page_size must be at least 1".to_string());
        }

        if let Action::Transform { transform } = &self.action {
            let transformer = transform.build();
            if transformer.enrichment().needs_repository() {
                if !matches!(self.scope, Scope::Tenants(_)) {
                    return invalid(format!(
                        "{} transform needs repository data and requires a tenants scope",
                        transformer.name()
                    ));
                }
                if self.missing_match.is_none() {
                    return invalid(
                        "jobs using repository data must set missing_match explicitly".to_string(),
                    );
                }
            }
        }
        match &self.scope {
            Scope::Tenants(tenants) if !(1..=100).contains(&tenants.per_page) => invalid(format!(
                "per_page must be between 1 and 100, got {}",
                tenants.per_page
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_table_job_parses_with_defaults() {
        let job = JobSpec::from_json(
            &json!({
                "name": "backfill-gsi4",
                "scope": {"type": "table", "source": {"table": "Assets"}},
                "action": {"type": "transform", "transform": {"kind": "reindex"}}
            })
            .to_string(),
        )
        .unwrap();
        assert_eq!(job.chunk_size, 25);
        assert_eq!(job.concurrency, 1);
        assert_eq!(job.target_table(), "Assets");
        assert_eq!(job.action.write_mode(), WriteMode::Upsert);
    }

    #[test]
    fn test_tenant_scope_defaults() {
        let job = JobSpec::from_json(
            &json!({
                "name": "protection",
                "scope": {"type": "tenants", "include": ["t1"]},
                "action": {"type": "transform", "transform": {"kind": "branch_protection"}},
                "missing_match": "leave_unchanged"
            })
            .to_string(),
        )
        .unwrap();
        let Scope::Tenants(scope) = &job.scope else {
            panic!("expected tenants scope");
        };
        assert_eq!(scope.partition, "TYPE#Installation#ACTIVE#True");
        assert_eq!(scope.index.as_deref(), Some("GSI5"));
        assert!(scope.includes("t1"));
        assert!(!scope.includes("t2"));
        assert_eq!(job.target_table(), "Assets");
    }

    #[test]
    fn test_enrichment_requires_missing_match() {
        let err = JobSpec::from_json(
            &json!({
                "name": "sync",
                "scope": {"type": "tenants"},
                "action": {"type": "transform", "transform": {"kind": "sync_active"}}
            })
            .to_string(),
        )
        .unwrap_err();
        assert!(matches!(err, JobError::InvalidJob(msg) if msg.contains("missing_match")));
    }

    #[test]
    fn test_enrichment_requires_tenant_scope() {
        let err = JobSpec::from_json(
            &json!({
                "name": "sync",
                "scope": {"type": "table", "source": {"table": "Assets"}},
                "action": {"type": "transform", "transform": {"kind": "archived_flag"}},
                "missing_match": "mark_inactive"
            })
            .to_string(),
        )
        .unwrap_err();
        assert!(matches!(err, JobError::InvalidJob(msg) if msg.contains("tenants scope")));
    }

    #[test]
    fn test_chunk_size_is_bounded() {
        let err = JobSpec::from_json(
            &json!({
                "name": "too-big",
                "scope": {"type": "table", "source": {"table": "Assets"}},
                "action": {"type": "delete"},
                "chunk_size": 26
            })
            .to_string(),
        )
        .unwrap_err();
        assert!(matches!(err, JobError::InvalidJob(_)));
    }

    #[test]
    fn test_asset_request_filters_by_owner_and_type() {
        let scope = TenantScope {
            active_only: true,
            ..TenantScope::default()
        };
        let request = scope.asset_request("t1", "acme", Some(50));
        assert_eq!(request.table, "Assets");
        assert_eq!(request.limit, Some(50));
        let key = request.key.as_ref().unwrap();
        assert_eq!(key.partition, json!("TENANT#t1"));

        let matching = sweep_store::Record::from_value(json!({
            "PK": "TENANT#t1", "SK": "ASSET#1",
            "vendor": "github", "owner": "acme", "asset_type": "repo", "is_active": true
        }))
        .unwrap();
        let other_owner = matching.clone().with("owner", "other");
        let filter = request.filter.as_ref().unwrap();
        assert!(filter.matches(&matching));
        assert!(!filter.matches(&other_owner));
    }
}
