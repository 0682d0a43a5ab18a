//! GitHub App JWT signing.

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::{Deserialize, Serialize};

use crate::GithubError;

/// Seconds `iat` is backdated to tolerate clock drift.
pub const CLOCK_DRIFT_SECS: i64 = 60;

/// Lifetime of an app JWT (GitHub caps it at ten minutes).
pub const APP_JWT_TTL_SECS: i64 = 600;

/// Claims of a GitHub App JWT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppClaims {
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
}

pub fn claims(app_id: &str, now: DateTime<Utc>) -> AppClaims {
    let now = now.timestamp();
    AppClaims {
        iat: now - CLOCK_DRIFT_SECS,
        exp: now + APP_JWT_TTL_SECS,
        iss: app_id.to_string(),
    }
}

/// Sign an RS256 app JWT with the app's PEM private key.
pub fn sign_app_jwt(
    app_id: &str,
    private_key_pem: &str,
    now: DateTime<Utc>,
) -> Result<String, GithubError> {
    let key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
        .map_err(|e| GithubError::InvalidKey(e.to_string()))?;
    encode(&Header::new(Algorithm::RS256), &claims(app_id, now), &key)
        .map_err(|e| GithubError::InvalidKey(e.to_string()))
}
