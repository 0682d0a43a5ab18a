//! Lookup of GitHub App private keys by secret name.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

/// Default secret name for an app's private key.
pub const DEFAULT_SECRET_TEMPLATE: &str = "github-app-certification-{app_id}";

/// Errors from secret lookups.
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported secrets file version {0}")]
    UnsupportedVersion(u32),

    /// The secret store backend failed.
    #[error("secret backend error: {0}")]
    Backend(String),
}

/// Expand `{app_id}` in a secret name template.
pub fn secret_name(template: &str, app_id: &str) -> String {
    template.replace("{app_id}", app_id)
}

/// Source of named secret strings.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// The secret's value, or `None` if no such secret exists.
    async fn get_secret(&self, name: &str) -> Result<Option<String>, SecretError>;
}

/// Secret file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SecretFile {
    version: u32,
    secrets: HashMap<String, String>,
}

/// Secrets read once from a local JSON file.
#[derive(Debug)]
pub struct FileSecretStore {
    path: PathBuf,
    secrets: HashMap<String, String>,
}

impl FileSecretStore {
    /// Load secrets from `path`. A missing file is an error.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, SecretError> {
        let path = path.as_ref().to_path_buf();
        let content = fs::read_to_string(&path).await?;
        let file: SecretFile = serde_json::from_str(&content)?;
        if file.version != 1 {
            return Err(SecretError::UnsupportedVersion(file.version));
        }
        Ok(Self {
            path,
            secrets: file.secrets,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn get_secret(&self, name: &str) -> Result<Option<String>, SecretError> {
        Ok(self.secrets.get(name).cloned())
    }
}

/// Fixed in-memory secrets.
#[derive(Debug, Default, Clone)]
pub struct StaticSecretStore {
    secrets: HashMap<String, String>,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(name.into(), value.into());
        self
    }
}

#[async_trait]
impl SecretStore for StaticSecretStore {
    async fn get_secret(&self, name: &str) -> Result<Option<String>, SecretError> {
        Ok(self.secrets.get(name).cloned())
    }
}

/// AWS Secrets Manager backend.
#[cfg(feature = "secretsmanager")]
#[derive(Debug, Clone)]
pub struct AwsSecretStore {
    client: aws_sdk_secretsmanager::Client,
}

#[cfg(feature = "secretsmanager")]
impl AwsSecretStore {
    pub fn new(sdk_config: &aws_config::SdkConfig, region: Option<String>) -> Self {
        let mut builder = aws_sdk_secretsmanager::config::Builder::from(sdk_config);
        if let Some(region) = region {
            builder = builder.region(aws_sdk_secretsmanager::config::Region::new(region));
        }
        Self {
            client: aws_sdk_secretsmanager::Client::from_conf(builder.build()),
        }
    }

    pub fn from_client(client: aws_sdk_secretsmanager::Client) -> Self {
        Self { client }
    }
}

#[cfg(feature = "secretsmanager")]
#[async_trait]
impl SecretStore for AwsSecretStore {
    async fn get_secret(&self, name: &str) -> Result<Option<String>, SecretError> {
        use aws_sdk_secretsmanager::error::{DisplayErrorContext, SdkError};
        use aws_sdk_secretsmanager::operation::get_secret_value::GetSecretValueError;

        match self.client.get_secret_value().secret_id(name).send().await {
            Ok(output) => Ok(output.secret_string().map(String::from)),
            Err(SdkError::ServiceError(service_err))
                if matches!(
                    service_err.err(),
                    GetSecretValueError::ResourceNotFoundException(_)
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(SecretError::Backend(format!(
                "GetSecretValue {} failed: {}",
                name,
                DisplayErrorContext(&e)
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_secret_name_template() {
        assert_eq!(
            secret_name(DEFAULT_SECRET_TEMPLATE, "4242"),
            "github-app-certification-4242"
        );
        assert_eq!(secret_name("static-name", "4242"), "static-name");
    }

    #[tokio::test]
    async fn test_file_store_lookup() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("secrets.json");
        tokio::fs::write(
            &path,
            r#"{"version": 1, "secrets": {"github-app-certification-7": "PEM"}}"#,
        )
        .await
        .unwrap();

        let store = FileSecretStore::load(&path).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.get_secret("github-app-certification-7").await.unwrap(),
            Some("PEM".to_string())
        );
        assert_eq!(store.get_secret("other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_rejects_unknown_version() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("secrets.json");
        tokio::fs::write(&path, r#"{"version": 2, "secrets": {}}"#)
            .await
            .unwrap();
        assert!(matches!(
            FileSecretStore::load(&path).await,
            Err(SecretError::UnsupportedVersion(2))
        ));
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            FileSecretStore::load(dir.path().join("nope.json")).await,
            Err(SecretError::Io(_))
        ));
    }
}
