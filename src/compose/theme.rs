//! Per-user theme lookup against the preference service.
//!
//! The composer asks the preference service (registry entry `codex` by
//! default) which theme the user picked. The call is authenticated with a
//! short-lived service-to-service token minted by the auth service and is
//! aggressively bounded: 500 ms, then the default theme wins. Results are
//! cached in the session cookie for five minutes.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::auth::UserClaims;
use crate::config::{origin_of, timeouts};
use crate::registry::RegistrySnapshot;
use crate::session::SessionState;

/// Themes the UI ships stylesheets for.
const VALID_THEMES: &[&str] = &["light", "dark"];

/// Accent palettes the UI ships stylesheets for.
const VALID_COLOR_THEMES: &[&str] = &[
    "purple", "blue", "green", "orange", "gold", "red", "yellow", "matrix", "bee",
];

/// Assumed lifetime of a service token whose `exp` cannot be read.
const FALLBACK_TOKEN_TTL: Duration = Duration::from_secs(300);

/// Re-mint when a cached service token is this close to expiry.
const TOKEN_RENEWAL_MARGIN: u64 = 60;

/// A resolved theme pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Theme {
    /// `light` or `dark`
    pub theme: String,
    /// Accent palette name
    pub color_theme: String,
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            theme: "light".to_string(),
            color_theme: "purple".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ThemeResponse {
    #[serde(default)]
    theme: Option<String>,
    #[serde(default)]
    color_theme: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ServiceTokenResponse {
    token: String,
}

/// Mints and caches service-to-service tokens from the auth service.
///
/// Tokens are reused until shortly before expiry rather than minted per
/// call; the expiry is read from the token's own `exp` claim without
/// signature verification (the gateway just received it from the auth
/// service over a trusted channel).
#[derive(Clone)]
pub struct ServiceTokenProvider {
    http: Client,
    token_url: String,
    target_service: String,
    cached: Arc<Mutex<Option<(String, u64)>>>,
}

impl ServiceTokenProvider {
    /// Create a provider minting tokens for calls to `target_service`.
    #[must_use]
    pub fn new(http: Client, auth_service_url: &Url, target_service: &str) -> Self {
        let token_url = format!(
            "{}/api/service/token",
            auth_service_url.as_str().trim_end_matches('/')
        );
        Self {
            http,
            token_url,
            target_service: target_service.to_string(),
            cached: Arc::new(Mutex::new(None)),
        }
    }

    /// A token valid for at least [`TOKEN_RENEWAL_MARGIN`] more seconds.
    pub async fn token(&self) -> Option<String> {
        {
            let cached = self.cached.lock();
            if let Some((token, expires_at)) = cached.as_ref() {
                if expires_at.saturating_sub(now_unix()) > TOKEN_RENEWAL_MARGIN {
                    return Some(token.clone());
                }
            }
        }

        let response = self
            .http
            .post(&self.token_url)
            .timeout(timeouts::TOKEN_EXCHANGE)
            .json(&serde_json::json!({
                "calling_service": "nexus",
                "target_service": self.target_service,
            }))
            .send()
            .await
            .ok()?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "Service token mint failed");
            return None;
        }

        let body: ServiceTokenResponse = response.json().await.ok()?;
        let expires_at = token_expiry(&body.token)
            .unwrap_or_else(|| now_unix() + FALLBACK_TOKEN_TTL.as_secs());

        *self.cached.lock() = Some((body.token.clone(), expires_at));
        Some(body.token)
    }
}

/// Read `exp` from a JWT without verifying it.
fn token_expiry(token: &str) -> Option<u64> {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};

    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    claims.get("exp")?.as_u64()
}

/// Looks up a user's theme preference.
#[derive(Clone)]
pub struct ThemeClient {
    http: Client,
    tokens: ServiceTokenProvider,
    theme_service: String,
}

impl ThemeClient {
    /// Create a client reading preferences from the named registry entry.
    #[must_use]
    pub fn new(http: Client, tokens: ServiceTokenProvider, theme_service: &str) -> Self {
        Self {
            http,
            tokens,
            theme_service: theme_service.to_string(),
        }
    }

    /// Resolve the caller's theme, consulting the session cache first.
    /// Every failure mode resolves to the default theme.
    pub async fn resolve(
        &self,
        registry: &RegistrySnapshot,
        claims: &UserClaims,
        session: &mut SessionState,
    ) -> Theme {
        if let Some((theme, color)) = session.fresh_theme() {
            return Theme {
                theme: theme.to_string(),
                color_theme: color.to_string(),
            };
        }

        let Some(email) = claims.email.as_deref() else {
            debug!("No email in claims; using default theme");
            return Theme::default();
        };

        let Some(entry) = registry.lookup(&self.theme_service) else {
            debug!(service = %self.theme_service, "Theme service not registered");
            return Theme::default();
        };

        match self.fetch(&origin_of(&entry.origin), email).await {
            Some(theme) => {
                session.cache_theme(&theme.theme, &theme.color_theme);
                theme
            }
            None => Theme::default(),
        }
    }

    async fn fetch(&self, origin: &str, email: &str) -> Option<Theme> {
        let mut request = self
            .http
            .get(format!("{origin}/api/public/user/theme"))
            .query(&[("email", email)])
            .timeout(timeouts::THEME_LOOKUP);

        if let Some(token) = self.tokens.token().await {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }

        let body: ThemeResponse = response.json().await.ok()?;
        let theme = body.theme?;
        let color_theme = body.color_theme.unwrap_or_else(|| "purple".to_string());

        if !VALID_THEMES.contains(&theme.as_str())
            || !VALID_COLOR_THEMES.contains(&color_theme.as_str())
        {
            debug!(theme = %theme, color = %color_theme, "Out-of-range theme values ignored");
            return None;
        }

        Some(Theme { theme, color_theme })
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
