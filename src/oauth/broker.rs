//! The authorization-code flow, gateway-side.

use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::Rng;
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::config::{timeouts, Config};
use crate::proxy::idp::IDP_PREFIX;
use crate::session::SessionState;

/// Failures of the `/auth-callback` leg. Each maps to its own status.
#[derive(Error, Debug)]
pub enum CompleteError {
    /// The IdP reported an error in the callback query
    #[error("identity provider error: {0}")]
    IdpError(String),

    /// `state` missing or not matching the session
    #[error("state mismatch")]
    StateMismatch,

    /// No authorization code in the callback
    #[error("missing authorization code")]
    MissingCode,

    /// The code-for-token exchange at the IdP failed
    #[error("code exchange failed: {0}")]
    CodeExchange(String),

    /// The auth service refused to mint a gateway token
    #[error("token exchange failed: {0}")]
    TokenExchange(String),
}

#[derive(Debug, Deserialize)]
struct IdpTokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct ExchangeResponse {
    token: String,
}

/// Drives `/login`, `/auth-callback`, and `/logout`.
#[derive(Clone)]
pub struct OAuthBroker {
    http: Client,
    config: Arc<Config>,
}

impl OAuthBroker {
    /// Create a broker over the shared HTTP client.
    #[must_use]
    pub fn new(http: Client, config: Arc<Config>) -> Self {
        Self { http, config }
    }

    /// Begin the flow: arm the session and produce the authorization URL.
    ///
    /// The URL routes through the gateway's own `/idp` proxy so the IdP
    /// stays reachable for browsers that can only see the gateway.
    pub fn begin(&self, session: &mut SessionState, next: Option<String>) -> String {
        let state = random_token::<16>();
        let (verifier, challenge) = generate_pkce();

        session.oauth_state = Some(state.clone());
        session.code_verifier = Some(verifier);
        session.post_login_target = Some(sanitize_target(next.as_deref()));

        let mut auth_url = self.browser_facing(&self.config.idp_authorization_url);
        {
            let mut params = auth_url.query_pairs_mut();
            params.append_pair("response_type", "code");
            params.append_pair("client_id", &self.config.idp_client_id);
            params.append_pair("redirect_uri", &self.config.callback_url());
            params.append_pair("scope", "openid profile email");
            params.append_pair("state", &state);
            params.append_pair("code_challenge", &challenge);
            params.append_pair("code_challenge_method", "S256");
        }

        auth_url.to_string()
    }

    /// Complete the flow: verify state, exchange the code, mint the gateway
    /// JWT. On success the session carries the token and the flow fields are
    /// cleared; the returned string is the post-login redirect target.
    ///
    /// # Errors
    ///
    /// Any [`CompleteError`]; the caller clears the session on every one.
    pub async fn complete(
        &self,
        session: &mut SessionState,
        code: Option<&str>,
        state: Option<&str>,
        idp_error: Option<&str>,
    ) -> Result<String, CompleteError> {
        if let Some(error) = idp_error {
            return Err(CompleteError::IdpError(error.to_string()));
        }

        let expected = session.oauth_state.take();
        let verifier = session.code_verifier.take();
        match (state, expected.as_deref()) {
            (Some(got), Some(want)) if got == want => {}
            _ => return Err(CompleteError::StateMismatch),
        }

        let code = code.ok_or(CompleteError::MissingCode)?;

        let access_token = self.exchange_code(code, verifier.as_deref()).await?;
        let jwt = self.exchange_for_gateway_token(&access_token).await?;

        session.token = Some(jwt);
        let target = session
            .post_login_target
            .take()
            .unwrap_or_else(|| "/".to_string());

        info!("Authorization-code flow completed");
        Ok(target)
    }

    /// End the session: best-effort revocation, then the logout redirect
    /// target (IdP end-session endpoint when configured, `/login` otherwise).
    pub async fn end(&self, token: Option<&str>) -> String {
        if let Some(token) = token {
            self.revoke(token).await;
        }

        match self.config.idp_end_session_url {
            Some(ref url) => self.browser_facing(url).to_string(),
            None => "/login".to_string(),
        }
    }

    /// `POST <idp>/token`: trade the code for an IdP access token.
    async fn exchange_code(
        &self,
        code: &str,
        verifier: Option<&str>,
    ) -> Result<String, CompleteError> {
        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", self.config.callback_url()),
            ("client_id", self.config.idp_client_id.clone()),
            ("client_secret", self.config.idp_client_secret.clone()),
        ];
        if let Some(verifier) = verifier {
            form.push(("code_verifier", verifier.to_string()));
        }

        let response = self
            .http
            .post(self.config.idp_token_url.as_str())
            .timeout(timeouts::TOKEN_EXCHANGE)
            .form(&form)
            .send()
            .await
            .map_err(|e| CompleteError::CodeExchange(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CompleteError::CodeExchange(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let body: IdpTokenResponse = response
            .json()
            .await
            .map_err(|e| CompleteError::CodeExchange(e.to_string()))?;
        Ok(body.access_token)
    }

    /// `POST <auth>/api/token/exchange`: mint the revocable gateway JWT.
    async fn exchange_for_gateway_token(
        &self,
        access_token: &str,
    ) -> Result<String, CompleteError> {
        let url = format!(
            "{}/api/token/exchange",
            self.config.auth_service_url.as_str().trim_end_matches('/')
        );

        let response = self
            .http
            .post(&url)
            .timeout(timeouts::TOKEN_EXCHANGE)
            .bearer_auth(access_token)
            .json(&serde_json::json!({ "access_token": access_token }))
            .send()
            .await
            .map_err(|e| CompleteError::TokenExchange(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CompleteError::TokenExchange(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let body: ExchangeResponse = response
            .json()
            .await
            .map_err(|e| CompleteError::TokenExchange(e.to_string()))?;
        Ok(body.token)
    }

    /// `POST <auth>/api/token/revoke`, once plus one retry; failures are
    /// logged and swallowed — logout must always complete.
    async fn revoke(&self, token: &str) {
        let url = format!(
            "{}/api/token/revoke",
            self.config.auth_service_url.as_str().trim_end_matches('/')
        );

        for attempt in 0..2 {
            let result = self
                .http
                .post(&url)
                .timeout(timeouts::TOKEN_EXCHANGE)
                .json(&serde_json::json!({ "token": token }))
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => return,
                Ok(response) => {
                    warn!(status = %response.status(), "Token revocation refused");
                    return;
                }
                Err(e) if attempt == 0 => {
                    warn!(error = %e, "Token revocation failed; retrying once");
                }
                Err(e) => {
                    warn!(error = %e, "Token revocation failed; giving up");
                }
            }
        }
    }

    /// Map an internal IdP URL onto the gateway's `/idp` proxy path so a
    /// browser can reach it.
    fn browser_facing(&self, idp_url: &Url) -> Url {
        let public = self.config.public_origin.as_str().trim_end_matches('/');
        let browser = format!("{public}{IDP_PREFIX}{}", idp_url.path());
        // Both components were validated at startup; joining them cannot
        // produce an unparseable URL.
        Url::parse(&browser).unwrap_or_else(|_| idp_url.clone())
    }
}

/// `next` targets must stay on this origin; anything absolute is dropped.
fn sanitize_target(next: Option<&str>) -> String {
    match next {
        Some(path) if path.starts_with('/') && !path.starts_with("//") => path.to_string(),
        _ => "/".to_string(),
    }
}

/// URL-safe random token from `N` bytes of entropy.
fn random_token<const N: usize>() -> String {
    let bytes: [u8; N] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// PKCE verifier and S256 challenge.
fn generate_pkce() -> (String, String) {
    let verifier_bytes: [u8; 32] = rand::rng().random();
    let verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);

    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    let challenge = URL_SAFE_NO_PAD.encode(hasher.finalize());

    (verifier, challenge)
}
