//! JWKS cache with coalescing refresh.
//!
//! Key lookups take a shared lock. A `kid` miss triggers one refresh;
//! concurrent missers wait on the same in-flight refresh instead of
//! stampeding the auth service. The refresh runs on its own task so it
//! publishes its result even when the originating request is cancelled.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet, KeyAlgorithm};
use jsonwebtoken::DecodingKey;
use parking_lot::RwLock;
use reqwest::Client;
use tracing::{debug, info, warn};

use super::AuthError;

/// Timeout on one JWKS document fetch.
const REFRESH_TIMEOUT: Duration = Duration::from_secs(5);

/// JWKS cache keyed by `kid`.
pub struct JwksCache {
    http: Client,
    jwks_url: String,
    keys: RwLock<HashMap<String, DecodingKey>>,
    last_refresh: RwLock<Option<Instant>>,
    /// Serializes refreshes; holders never do I/O under `keys`
    refresh_gate: tokio::sync::Mutex<()>,
}

impl JwksCache {
    /// Create a cache for `{auth_service}/.well-known/jwks.json`.
    #[must_use]
    pub fn new(http: Client, auth_service_url: &url::Url) -> Self {
        let jwks_url = format!(
            "{}/.well-known/jwks.json",
            auth_service_url.as_str().trim_end_matches('/')
        );
        Self {
            http,
            jwks_url,
            keys: RwLock::new(HashMap::new()),
            last_refresh: RwLock::new(None),
            refresh_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Resolve a decoding key, refreshing the key set once on a miss.
    ///
    /// # Errors
    ///
    /// [`AuthError::JwksUnavailable`] when the key set cannot be fetched;
    /// [`AuthError::UnknownKid`] when the kid is absent even after refresh.
    pub async fn resolve(&self, kid: &str) -> Result<DecodingKey, AuthError> {
        if let Some(key) = self.keys.read().get(kid) {
            return Ok(key.clone());
        }

        // Coalesce: one refresh at a time; waiters re-check before fetching.
        let _gate = self.refresh_gate.lock().await;
        if let Some(key) = self.keys.read().get(kid) {
            return Ok(key.clone());
        }

        self.refresh().await?;

        self.keys
            .read()
            .get(kid)
            .cloned()
            .ok_or_else(|| AuthError::UnknownKid(kid.to_string()))
    }

    /// Fetch the JWKS document and swap the key map.
    ///
    /// Runs on a detached task so the new key set is published even if every
    /// waiter has gone away.
    async fn refresh(&self) -> Result<(), AuthError> {
        let http = self.http.clone();
        let url = self.jwks_url.clone();

        let handle = tokio::spawn(async move { fetch_keys(&http, &url).await });
        let keys = handle
            .await
            .map_err(|e| AuthError::JwksUnavailable(format!("refresh task failed: {e}")))??;

        let count = keys.len();
        *self.keys.write() = keys;
        *self.last_refresh.write() = Some(Instant::now());
        info!(keys = count, "JWKS refreshed");
        Ok(())
    }

    /// Number of cached keys (diagnostics).
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.keys.read().len()
    }

    /// When the key set was last fetched, if ever (diagnostics).
    #[must_use]
    pub fn last_refresh(&self) -> Option<Instant> {
        *self.last_refresh.read()
    }

    #[cfg(test)]
    pub(crate) fn insert_for_test(&self, kid: &str, key: DecodingKey) {
        self.keys.write().insert(kid.to_string(), key);
    }
}

/// Fetch and parse a JWKS document, keeping only RS256 RSA keys.
async fn fetch_keys(
    http: &Client,
    url: &str,
) -> Result<HashMap<String, DecodingKey>, AuthError> {
    let response = http
        .get(url)
        .timeout(REFRESH_TIMEOUT)
        .send()
        .await
        .map_err(|e| AuthError::JwksUnavailable(e.to_string()))?;

    if !response.status().is_success() {
        return Err(AuthError::JwksUnavailable(format!(
            "HTTP {}",
            response.status()
        )));
    }

    let jwk_set: JwkSet = response
        .json()
        .await
        .map_err(|e| AuthError::JwksUnavailable(format!("bad JWKS document: {e}")))?;

    let mut keys = HashMap::new();
    for jwk in &jwk_set.keys {
        let Some(kid) = jwk.common.key_id.clone() else {
            debug!("Skipping JWK without kid");
            continue;
        };

        if !matches!(jwk.algorithm, AlgorithmParameters::RSA(_)) {
            debug!(kid = %kid, "Skipping non-RSA JWK");
            continue;
        }
        if jwk
            .common
            .key_algorithm
            .is_some_and(|alg| alg != KeyAlgorithm::RS256)
        {
            debug!(kid = %kid, "Skipping JWK with algorithm other than RS256");
            continue;
        }

        match DecodingKey::from_jwk(jwk) {
            Ok(key) => {
                keys.insert(kid, key);
            }
            Err(e) => {
                warn!(kid = %kid, error = %e, "Unusable JWK in key set");
            }
        }
    }

    Ok(keys)
}
