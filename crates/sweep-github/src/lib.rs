//! GitHub App enrichment for sweep jobs.
//!
//! ## Features
//!
//! - **Client**: installation token exchange, paginated repository listing,
//!   branch protection lookup, with rate-limit aware retries
//! - **JWT**: RS256 app assertions
//! - **Secrets**: app private keys from a JSON file or AWS Secrets Manager
//!   (feature `secretsmanager`)

mod client;
mod error;
pub mod jwt;
pub mod secrets;

pub use client::{
    DEFAULT_API_URL, GithubClient, InstallationToken, Repository, RepositoryOwner,
    RepositoryPage, RetryPolicy,
};
pub use error::GithubError;
pub use secrets::{
    DEFAULT_SECRET_TEMPLATE, FileSecretStore, SecretError, SecretStore, StaticSecretStore,
    secret_name,
};

#[cfg(feature = "secretsmanager")]
pub use secrets::AwsSecretStore;
