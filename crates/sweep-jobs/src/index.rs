//! Denormalized index fields of asset records.
//!
//! Every index attribute is a pure function of the asset's primary
//! attributes. Updates recompute all of them together from scratch; the
//! stored composite strings are never patched in place.

use serde_json::Value;
use sweep_store::Record;
use thiserror::Error;

use crate::model::{PRIMARY_ATTRIBUTES, attr};

pub const GSI1PK: &str = "GSI1PK";
pub const GSI1SK: &str = "GSI1SK";
pub const GSI2PK: &str = "GSI2PK";
pub const GSI2SK: &str = "GSI2SK";
pub const GSI3PK: &str = "GSI3PK";
pub const GSI4PK: &str = "GSI4PK";
pub const GSI4SK: &str = "GSI4SK";

/// Every derived index attribute of an asset.
pub const INDEX_ATTRIBUTES: [&str; 7] = [GSI1PK, GSI1SK, GSI2PK, GSI2SK, GSI3PK, GSI4PK, GSI4SK];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    #[error("missing primary attribute {0}")]
    MissingAttribute(&'static str),

    #[error("primary attribute {attr} has unexpected value {value}")]
    InvalidAttribute { attr: &'static str, value: String },
}

/// Normalized composite key: upper-case key names, lower-case values, `#`-joined.
pub fn composite_key(parts: &[(&str, &str)]) -> String {
    parts
        .iter()
        .map(|(key, value)| format!("{}#{}", key.to_uppercase(), value.to_lowercase()))
        .collect::<Vec<_>>()
        .join("#")
}

/// The primary attributes of an asset, as read from its record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetIdentity<'a> {
    pub tenant_id: &'a str,
    pub is_active: bool,
    pub asset_type: &'a str,
    pub vendor: &'a str,
    pub owner: &'a str,
    pub asset_name: &'a str,
}

impl<'a> AssetIdentity<'a> {
    pub fn from_record(record: &'a Record) -> Result<Self, IndexError> {
        let text = |name: &'static str| match record.get(name) {
            Some(Value::String(s)) => Ok(s.as_str()),
            Some(other) => Err(IndexError::InvalidAttribute {
                attr: name,
                value: other.to_string(),
            }),
            None => Err(IndexError::MissingAttribute(name)),
        };
        let is_active = match record.get(attr::IS_ACTIVE) {
            Some(Value::Bool(b)) => *b,
            Some(other) => {
                return Err(IndexError::InvalidAttribute {
                    attr: attr::IS_ACTIVE,
                    value: other.to_string(),
                });
            }
            None => return Err(IndexError::MissingAttribute(attr::IS_ACTIVE)),
        };

        Ok(Self {
            tenant_id: text(attr::TENANT_ID)?,
            is_active,
            asset_type: text(attr::ASSET_TYPE)?,
            vendor: text(attr::VENDOR)?,
            owner: text(attr::OWNER)?,
            asset_name: text(attr::ASSET_NAME)?,
        })
    }
}

/// Values of all index attributes for one asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexFields {
    pub gsi1pk: String,
    pub gsi1sk: String,
    pub gsi2pk: String,
    pub gsi2sk: String,
    pub gsi3pk: String,
    pub gsi4pk: String,
    pub gsi4sk: String,
}

impl IndexFields {
    pub fn derive(asset: &AssetIdentity<'_>) -> Self {
        let active = if asset.is_active { "true" } else { "false" };
        let tenant_active = format!("TENANT#{}#ACTIVE#{}", asset.tenant_id, active);

        Self {
            gsi1pk: format!(
                "TYPE#{}#VENDOR#{}#OWNER#{}#NAME#{}",
                asset.asset_type, asset.vendor, asset.owner, asset.asset_name
            ),
            gsi1sk: tenant_active.clone(),
            gsi2pk: tenant_active.clone(),
            gsi2sk: tenant_active.clone(),
            gsi3pk: tenant_active,
            gsi4pk: composite_key(&[("tenant", asset.tenant_id), ("active", active)]),
            gsi4sk: composite_key(&[
                ("type", asset.asset_type),
                ("vendor", asset.vendor),
                ("owner", asset.owner),
                ("name", asset.asset_name),
            ]),
        }
    }

    pub fn pairs(&self) -> [(&'static str, &str); 7] {
        [
            (GSI1PK, &self.gsi1pk),
            (GSI1SK, &self.gsi1sk),
            (GSI2PK, &self.gsi2pk),
            (GSI2SK, &self.gsi2sk),
            (GSI3PK, &self.gsi3pk),
            (GSI4PK, &self.gsi4pk),
            (GSI4SK, &self.gsi4sk),
        ]
    }
}

/// Derive the index fields of a record.
pub fn derive(record: &Record) -> Result<IndexFields, IndexError> {
    Ok(IndexFields::derive(&AssetIdentity::from_record(record)?))
}

/// Whether the record carries every primary attribute.
pub fn has_primary_attributes(record: &Record) -> bool {
    PRIMARY_ATTRIBUTES.iter().all(|a| record.contains(a))
}

/// Recompute and overwrite all index fields in place.
pub fn reindex(record: &mut Record) -> Result<(), IndexError> {
    let fields = derive(record)?;
    for (name, value) in fields.pairs() {
        record.set(name, value);
    }
    Ok(())
}

/// Whether every stored index field equals its derived value.
pub fn is_consistent(record: &Record) -> bool {
    match derive(record) {
        Ok(fields) => fields
            .pairs()
            .iter()
            .all(|(name, value)| record.get_str(name) == Some(*value)),
        Err(_) => false,
    }
}

/// Whether any primary attribute differs between two versions of a record.
pub fn primary_changed(before: &Record, after: &Record) -> bool {
    PRIMARY_ATTRIBUTES
        .iter()
        .any(|a| before.get(a) != after.get(a))
}
