//! Asset and tenant attribute names, and the tenant installation record.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sweep_store::Record;
use thiserror::Error;

/// Attribute names used by asset and tenant records.
pub mod attr {
    pub const TENANT_ID: &str = "tenant_id";
    pub const ASSET_ID: &str = "asset_id";
    pub const ASSET_NAME: &str = "asset_name";
    pub const ASSET_TYPE: &str = "asset_type";
    pub const VENDOR: &str = "vendor";
    pub const OWNER: &str = "owner";
    pub const IS_ACTIVE: &str = "is_active";
    pub const IS_COVERED: &str = "is_covered";
    pub const IS_ARCHIVED: &str = "is_archived";
    pub const IS_BRANCH_PROTECTED_BY_JIT: &str = "is_branch_protected_by_jit";
    pub const IS_PRIVATE: &str = "is_private";
    pub const DEFAULT_BRANCH: &str = "default_branch";
    pub const EXTERNAL_REPOSITORY_ID: &str = "external_repository_id";
    pub const EXTERNAL_ID: &str = "external_id";
    pub const CREATED_AT: &str = "created_at";
    pub const MODIFIED_AT: &str = "modified_at";
    pub const APP_ID: &str = "app_id";
    pub const INSTALLATION_ID: &str = "installation_id";
}

/// Attributes every denormalized index field is derived from.
pub const PRIMARY_ATTRIBUTES: [&str; 6] = [
    attr::TENANT_ID,
    attr::IS_ACTIVE,
    attr::ASSET_TYPE,
    attr::VENDOR,
    attr::OWNER,
    attr::ASSET_NAME,
];

/// A record lacks an attribute the caller needs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{record} is missing attribute {attr}")]
pub struct MissingAttribute {
    pub record: String,
    pub attr: &'static str,
}

/// Read an identifier that may be stored as a string or a number.
pub fn identifier(record: &Record, attr: &str) -> Option<String> {
    match record.get(attr)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A vendor installation owned by a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub tenant_id: String,
    pub owner: String,
    pub app_id: String,
    pub installation_id: String,
    pub vendor: String,
    pub is_active: bool,
}

impl Tenant {
    pub fn from_record(record: &Record) -> Result<Self, MissingAttribute> {
        let label = record
            .key()
            .map(|k| k.to_string())
            .unwrap_or_else(|| "tenant record".to_string());
        let require = |attr: &'static str| {
            identifier(record, attr).ok_or_else(|| MissingAttribute {
                record: label.clone(),
                attr,
            })
        };

        Ok(Self {
            tenant_id: require(attr::TENANT_ID)?,
            owner: require(attr::OWNER)?,
            app_id: require(attr::APP_ID)?,
            installation_id: require(attr::INSTALLATION_ID)?,
            vendor: require(attr::VENDOR)?,
            is_active: record.get_bool(attr::IS_ACTIVE).unwrap_or(true),
        })
    }

    /// Partition key of the tenant's assets.
    pub fn asset_partition(&self) -> String {
        format!("TENANT#{}", self.tenant_id)
    }
}
