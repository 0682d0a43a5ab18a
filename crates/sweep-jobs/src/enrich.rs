//! Per-tenant GitHub sessions and repository matching.

use std::collections::HashMap;
use std::sync::Arc;

use sweep_github::{
    GithubClient, GithubError, Repository, SecretError, SecretStore, secret_name,
};
use sweep_store::Record;
use thiserror::Error;
use tracing::{debug, info};

use crate::model::{Tenant, attr};
use crate::transform::{Enrichment, ExternalData, Protection, RepoMatch};

/// Why a tenant's GitHub session could not be opened.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("private key secret {0} not found")]
    MissingSecret(String),

    #[error("secret lookup failed: {0}")]
    Secret(#[from] SecretError),

    #[error(transparent)]
    Github(#[from] GithubError),
}

/// An installation token and the repositories it can see.
///
/// Tokens belong to exactly one tenant and are never reused across tenants.
#[derive(Debug, Clone)]
pub struct TenantSession {
    pub tenant: Tenant,
    token: String,
    repositories: HashMap<(String, String), Repository>,
}

impl TenantSession {
    pub fn new(tenant: Tenant, token: impl Into<String>, repositories: Vec<Repository>) -> Self {
        let mut by_key: HashMap<(String, String), Repository> = HashMap::new();
        for repo in repositories {
            // Same owner and name seen twice: a live repository wins over an archived one.
            let key = repository_key(&repo.owner.login, &repo.name);
            let replace = by_key
                .get(&key)
                .is_none_or(|existing| existing.archived && !repo.archived);
            if replace {
                by_key.insert(key, repo);
            }
        }
        Self {
            tenant,
            token: token.into(),
            repositories: by_key,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Owner logins compare case-insensitively, repository names exactly.
    pub fn repository(&self, owner: &str, name: &str) -> Option<&Repository> {
        self.repositories.get(&repository_key(owner, name))
    }

    pub fn repository_count(&self) -> usize {
        self.repositories.len()
    }
}

fn repository_key(owner: &str, name: &str) -> (String, String) {
    (owner.to_lowercase(), name.to_string())
}

/// Opens tenant sessions and resolves assets against them.
#[derive(Clone)]
pub struct Enricher {
    github: GithubClient,
    secrets: Arc<dyn SecretStore>,
    secret_template: String,
    per_page: u32,
}

impl std::fmt::Debug for Enricher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enricher")
            .field("github", &self.github)
            .field("secret_template", &self.secret_template)
            .field("per_page", &self.per_page)
            .finish_non_exhaustive()
    }
}

impl Enricher {
    pub fn new(
        github: GithubClient,
        secrets: Arc<dyn SecretStore>,
        secret_template: impl Into<String>,
        per_page: u32,
    ) -> Self {
        Self {
            github,
            secrets,
            secret_template: secret_template.into(),
            per_page,
        }
    }

    /// Private key lookup, token exchange and the full repository listing.
    pub async fn open_session(&self, tenant: &Tenant) -> Result<TenantSession, SessionError> {
        let name = secret_name(&self.secret_template, &tenant.app_id);
        let private_key = self
            .secrets
            .get_secret(&name)
            .await?
            .ok_or(SessionError::MissingSecret(name))?;

        let token = self
            .github
            .exchange_token(&tenant.app_id, &private_key, &tenant.installation_id, None)
            .await?;
        let repositories = self
            .github
            .list_all_installation_repositories(&token.token, self.per_page)
            .await?;

        info!(
            tenant_id = %tenant.tenant_id,
            installation_id = %tenant.installation_id,
            repositories = repositories.len(),
            "opened GitHub session"
        );
        Ok(TenantSession::new(tenant.clone(), token.token, repositories))
    }

    /// Look up the asset's repository, and its protection when asked for.
    pub async fn resolve(
        &self,
        session: &TenantSession,
        asset: &Record,
        enrichment: Enrichment,
    ) -> ExternalData {
        let Some(name) = asset.get_str(attr::ASSET_NAME) else {
            return ExternalData::Unresolved("asset has no asset_name".to_string());
        };
        let owner = asset
            .get_str(attr::OWNER)
            .unwrap_or(&session.tenant.owner);
        let Some(repository) = session.repository(owner, name) else {
            debug!(
                tenant_id = %session.tenant.tenant_id,
                owner,
                asset_name = name,
                "no matching repository"
            );
            return ExternalData::NotFound;
        };

        let protection = if enrichment.needs_protection() {
            match self.protection(session, repository).await {
                Ok(protection) => Some(protection),
                Err(e) => return ExternalData::Unresolved(e.to_string()),
            }
        } else {
            None
        };

        ExternalData::Matched(RepoMatch {
            repository: repository.clone(),
            protection,
        })
    }

    async fn protection(
        &self,
        session: &TenantSession,
        repository: &Repository,
    ) -> Result<Protection, GithubError> {
        let Some(branch) = repository.default_branch.as_deref() else {
            return Ok(Protection::NotConfigured);
        };
        let contexts = self
            .github
            .branch_protection_contexts(&repository.owner.login, &repository.name, branch, session.token())
            .await?;
        Ok(Protection::from_contexts(contexts))
    }
}
