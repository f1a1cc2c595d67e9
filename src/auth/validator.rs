//! Token validator
//!
//! Verifies a bearer token offline (RS256 signature via the JWKS cache,
//! expiry with 60 s clock-skew tolerance, issuer) and then confirms online
//! that the auth service has not revoked it. The online check failing open
//! is deliberately not an option: an unreachable auth service rejects the
//! request.

use std::sync::Arc;

use jsonwebtoken::{decode, decode_header, Algorithm, Validation};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use super::claims::{JwtClaims, UserClaims};
use super::{AuthError, JwksCache};
use crate::config::timeouts;

/// Accepted clock skew on `exp`, seconds.
const LEEWAY_SECS: u64 = 60;

/// Response shape of `POST /api/token/validate`.
#[derive(Debug, Deserialize)]
struct ValidateResponse {
    #[serde(default = "default_true")]
    valid: bool,
    #[serde(default)]
    revoked: bool,
}

fn default_true() -> bool {
    true
}

/// Validates gateway JWTs.
#[derive(Clone)]
pub struct TokenValidator {
    http: Client,
    jwks: Arc<JwksCache>,
    validate_url: String,
    issuer: String,
}

impl TokenValidator {
    /// Create a validator against the given auth service.
    #[must_use]
    pub fn new(http: Client, jwks: Arc<JwksCache>, auth_service_url: &Url, issuer: &str) -> Self {
        let validate_url = format!(
            "{}/api/token/validate",
            auth_service_url.as_str().trim_end_matches('/')
        );
        Self {
            http,
            jwks,
            validate_url,
            issuer: issuer.to_string(),
        }
    }

    /// Validate a token and derive the caller's claims.
    ///
    /// # Errors
    ///
    /// See [`AuthError`] for the taxonomy; every variant maps to a specific
    /// user-visible behavior.
    pub async fn validate(&self, token: &str) -> Result<UserClaims, AuthError> {
        let header =
            decode_header(token).map_err(|e| AuthError::BadSignature(e.to_string()))?;

        if header.alg != Algorithm::RS256 {
            return Err(AuthError::BadSignature(format!(
                "unsupported algorithm {:?}",
                header.alg
            )));
        }
        let kid = header
            .kid
            .ok_or_else(|| AuthError::UnknownKid("<missing kid>".to_string()))?;

        let key = self.jwks.resolve(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[&self.issuer]);
        validation.leeway = LEEWAY_SECS;

        let data = decode::<JwtClaims>(token, &key, &validation).map_err(|e| {
            use jsonwebtoken::errors::ErrorKind;
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::ExpiredToken,
                ErrorKind::InvalidIssuer => AuthError::IssuerMismatch,
                _ => AuthError::BadSignature(e.to_string()),
            }
        })?;

        self.check_revocation(token).await?;

        Ok(UserClaims::from(data.claims))
    }

    /// Ask the auth service whether the token is still live.
    async fn check_revocation(&self, token: &str) -> Result<(), AuthError> {
        let response = self
            .http
            .post(&self.validate_url)
            .timeout(timeouts::TOKEN_VALIDATE)
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "Auth service unreachable during token validation");
                AuthError::AuthServiceUnreachable(e.to_string())
            })?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(AuthError::Revoked);
        }
        if !response.status().is_success() {
            return Err(AuthError::AuthServiceUnreachable(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let body: ValidateResponse = response
            .json()
            .await
            .map_err(|e| AuthError::AuthServiceUnreachable(e.to_string()))?;

        if body.revoked || !body.valid {
            debug!("Token rejected by auth service");
            return Err(AuthError::Revoked);
        }

        Ok(())
    }
}
