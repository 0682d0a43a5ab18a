//! GitHub REST client for installation-scoped enrichment.
//!
//! The client is stateless: every call takes the token it should use, so a
//! token obtained for one tenant is never reused for another.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::{Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::GithubError;
use crate::jwt::sign_app_jwt;

/// Public GitHub API.
pub const DEFAULT_API_URL: &str = "https://api.github.com";

const API_VERSION: &str = "2022-11-28";

/// Repository as returned by the installation and repository endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub full_name: Option<String>,
    pub owner: RepositoryOwner,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub default_branch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryOwner {
    pub login: String,
}

/// Result of a successful token exchange.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InstallationToken {
    pub token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Present when the token was scoped to named repositories.
    #[serde(default)]
    pub repositories: Option<Vec<Repository>>,
}

/// One page of `GET /installation/repositories`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RepositoryPage {
    pub total_count: u64,
    pub repositories: Vec<Repository>,
}

/// Retry budget for rate limits and server errors.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base delay, doubled per attempt when no Retry-After is given.
    pub base_delay: Duration,
    /// Upper bound on any single wait, including Retry-After.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    fn delay(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        let wait = match retry_after_secs {
            Some(secs) => Duration::from_secs(secs),
            None => self.base_delay * (1u32 << attempt.min(16)),
        };
        wait.min(self.max_delay)
    }
}

/// Outcome of classifying a response before the caller interprets it.
enum Throttle {
    RateLimited(Option<u64>),
    ServerError(u16),
}

fn retry_after(response: &Response) -> Option<u64> {
    response
        .headers()
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
}

fn throttle(response: &Response) -> Option<Throttle> {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Some(Throttle::RateLimited(retry_after(response)));
    }
    if status == StatusCode::FORBIDDEN {
        let exhausted = response
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            == Some("0");
        let secondary = response.headers().contains_key("Retry-After");
        if exhausted || secondary {
            return Some(Throttle::RateLimited(retry_after(response)));
        }
    }
    if status.is_server_error() {
        return Some(Throttle::ServerError(status.as_u16()));
    }
    None
}

/// GitHub App client.
#[derive(Debug, Clone)]
pub struct GithubClient {
    http: reqwest::Client,
    base_url: Url,
    retry: RetryPolicy,
}

impl GithubClient {
    /// Create a client for the API at `base_url` (e.g. [`DEFAULT_API_URL`]).
    pub fn new(base_url: &str) -> Result<Self, GithubError> {
        let base_url =
            Url::parse(base_url).map_err(|e| GithubError::InvalidBaseUrl(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(GithubError::InvalidBaseUrl(base_url.to_string()));
        }

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert(USER_AGENT, HeaderValue::from_static("sweep"));
        headers.insert("X-GitHub-Api-Version", HeaderValue::from_static(API_VERSION));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            base_url,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, segments: &[&str]) -> Result<Url, GithubError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| GithubError::InvalidBaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Send a request, retrying rate limits, server errors and connection
    /// failures. Any other response is returned for the caller to interpret.
    async fn send<F>(&self, endpoint: &str, build: F) -> Result<Response, GithubError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            let (err, retry_after_secs) = match build().send().await {
                Ok(response) => match throttle(&response) {
                    None => return Ok(response),
                    Some(Throttle::RateLimited(secs)) => (
                        GithubError::RateLimited {
                            endpoint: Some(endpoint.to_string()),
                            retry_after_secs: secs,
                        },
                        secs,
                    ),
                    Some(Throttle::ServerError(status)) => (
                        GithubError::Unavailable {
                            status,
                            endpoint: endpoint.to_string(),
                        },
                        None,
                    ),
                },
                Err(e) if e.is_timeout() || e.is_connect() => (GithubError::Http(e), None),
                Err(e) => return Err(GithubError::Http(e)),
            };

            if attempt >= self.retry.max_retries {
                return Err(err);
            }
            let backoff = self.retry.delay(attempt, retry_after_secs);
            attempt += 1;
            warn!(
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "transient error in {}, retrying",
                endpoint
            );
            tokio::time::sleep(backoff).await;
        }
    }

    async fn error_body(response: Response) -> String {
        let status = response.status();
        match response.text().await {
            Ok(text) => serde_json::from_str::<serde_json::Value>(&text)
                .ok()
                .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
                .unwrap_or(text),
            Err(e) => format!("{} (failed to read body: {})", status, e),
        }
    }

    /// Exchange the app's credentials for an installation access token.
    ///
    /// With `repositories`, the token is scoped to those repository names.
    /// Anything but `201 Created` is [`GithubError::AuthExchangeFailed`].
    pub async fn exchange_token(
        &self,
        app_id: &str,
        private_key_pem: &str,
        installation_id: &str,
        repositories: Option<&[String]>,
    ) -> Result<InstallationToken, GithubError> {
        #[derive(Serialize)]
        struct TokenRequest<'a> {
            #[serde(skip_serializing_if = "Option::is_none")]
            repositories: Option<&'a [String]>,
        }

        let jwt = sign_app_jwt(app_id, private_key_pem, Utc::now())?;
        let url = self.url(&["app", "installations", installation_id, "access_tokens"])?;
        let body = TokenRequest { repositories };

        let response = self
            .send("app/installations/access_tokens", || {
                self.http.post(url.clone()).bearer_auth(&jwt).json(&body)
            })
            .await?;

        if response.status() != StatusCode::CREATED {
            let status = response.status().as_u16();
            let message = Self::error_body(response).await;
            return Err(GithubError::AuthExchangeFailed { status, message });
        }

        let token: InstallationToken = response.json().await?;
        debug!(
            installation_id,
            scoped = repositories.is_some(),
            "obtained installation token"
        );
        Ok(token)
    }

    /// One page of the installation's repositories (pages start at 1).
    pub async fn list_installation_repositories(
        &self,
        token: &str,
        page: u32,
        per_page: u32,
    ) -> Result<RepositoryPage, GithubError> {
        let url = self.url(&["installation", "repositories"])?;
        let query = [("per_page", per_page.to_string()), ("page", page.to_string())];

        let response = self
            .send("installation/repositories", || {
                self.http.get(url.clone()).bearer_auth(token).query(&query)
            })
            .await?;

        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            StatusCode::NOT_FOUND => Err(GithubError::NotFound("installation repositories".into())),
            status => Err(GithubError::InvalidResponse(format!(
                "list repositories failed ({}): {}",
                status,
                Self::error_body(response).await
            ))),
        }
    }

    /// Every repository of the installation, stopping at the first empty or
    /// short page.
    pub async fn list_all_installation_repositories(
        &self,
        token: &str,
        per_page: u32,
    ) -> Result<Vec<Repository>, GithubError> {
        let per_page = per_page.clamp(1, 100);
        let mut repositories = Vec::new();
        let mut page = 1;

        loop {
            let batch = self
                .list_installation_repositories(token, page, per_page)
                .await?;
            let count = batch.repositories.len();
            repositories.extend(batch.repositories);
            debug!(
                page,
                count,
                total = batch.total_count,
                "listed installation repositories"
            );

            if count == 0 || count < per_page as usize {
                break;
            }
            page += 1;
        }

        Ok(repositories)
    }

    /// Required status check contexts of a branch.
    ///
    /// `None` means no protection is configured: any non-200 answer that is
    /// not a rate limit or server error. That answer is final and not retried.
    pub async fn branch_protection_contexts(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        token: &str,
    ) -> Result<Option<Vec<String>>, GithubError> {
        let url = self.url(&[
            "repos",
            owner,
            repo,
            "branches",
            branch,
            "protection",
            "required_status_checks",
            "contexts",
        ])?;

        let response = self
            .send("branches/protection/contexts", || {
                self.http.get(url.clone()).bearer_auth(token)
            })
            .await?;

        if response.status() != StatusCode::OK {
            debug!(
                owner,
                repo,
                branch,
                status = response.status().as_u16(),
                "no branch protection configured"
            );
            return Ok(None);
        }
        Ok(Some(response.json().await?))
    }

    /// A single repository, or `None` if it does not exist or is not visible.
    pub async fn get_repository(
        &self,
        owner: &str,
        repo: &str,
        token: &str,
    ) -> Result<Option<Repository>, GithubError> {
        let url = self.url(&["repos", owner, repo])?;
        let response = self
            .send("repos", || self.http.get(url.clone()).bearer_auth(token))
            .await?;

        match response.status() {
            StatusCode::OK => Ok(Some(response.json().await?)),
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(GithubError::InvalidResponse(format!(
                "get repository failed ({}): {}",
                status,
                Self::error_body(response).await
            ))),
        }
    }
}
