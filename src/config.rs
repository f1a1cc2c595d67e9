//! Configuration management
//!
//! All runtime configuration comes from the environment (the deployment
//! scripts export it before exec). Required values fast-fail at startup with
//! exit code 2; see [`crate::Error::exit_code`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use figment::{providers::Env, Figment};
use serde::Deserialize;
use url::Url;

use crate::{Error, Result};

/// Minimum length of `COOKIE_SECRET` in bytes.
const MIN_COOKIE_SECRET_LEN: usize = 32;

/// Main configuration, deserialized from the process environment.
///
/// Field names map 1:1 to upper-cased environment variables
/// (`listen_addr` ← `LISTEN_ADDR`, and so on).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Socket address the listener binds to (e.g. `0.0.0.0:443`)
    pub listen_addr: SocketAddr,
    /// Path to the PEM-encoded server certificate (TLS enabled when set)
    #[serde(default)]
    pub tls_cert: Option<PathBuf>,
    /// Path to the PEM-encoded server private key
    #[serde(default)]
    pub tls_key: Option<PathBuf>,
    /// Session-cookie key material; at least 32 bytes
    pub cookie_secret: String,
    /// Origin of the auth service ("Core")
    pub auth_service_url: Url,
    /// Expected `iss` claim on gateway JWTs
    #[serde(default = "default_auth_issuer")]
    pub auth_issuer: String,
    /// IdP authorization endpoint
    pub idp_authorization_url: Url,
    /// IdP token endpoint
    pub idp_token_url: Url,
    /// IdP end-session endpoint (logout redirects here when set)
    #[serde(default)]
    pub idp_end_session_url: Option<Url>,
    /// OAuth2 client id registered at the IdP
    pub idp_client_id: String,
    /// OAuth2 client secret
    pub idp_client_secret: String,
    /// Externally visible origin of this gateway (absolute URL)
    pub public_origin: Url,
    /// Path to the service registry document
    #[serde(default = "default_services_file")]
    pub services_file: PathBuf,
    /// Registry entry whose backend serves user preference lookups
    #[serde(default = "default_theme_service")]
    pub theme_service: String,
}

fn default_auth_issuer() -> String {
    "hivematrix-core".to_string()
}

fn default_services_file() -> PathBuf {
    PathBuf::from("services.json")
}

fn default_theme_service() -> String {
    "codex".to_string()
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when a required variable is missing or a
    /// value fails validation.
    pub fn load() -> Result<Self> {
        let config: Self = Figment::new()
            .merge(Env::prefixed(""))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints that serde cannot express.
    fn validate(&self) -> Result<()> {
        if self.cookie_secret.len() < MIN_COOKIE_SECRET_LEN {
            return Err(Error::Config(format!(
                "COOKIE_SECRET must be at least {MIN_COOKIE_SECRET_LEN} bytes, got {}",
                self.cookie_secret.len()
            )));
        }

        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err(Error::Config(
                "TLS_CERT and TLS_KEY must be set together".to_string(),
            ));
        }

        for (name, url) in [
            ("AUTH_SERVICE_URL", &self.auth_service_url),
            ("IDP_AUTHORIZATION_URL", &self.idp_authorization_url),
            ("IDP_TOKEN_URL", &self.idp_token_url),
            ("PUBLIC_ORIGIN", &self.public_origin),
        ] {
            if !matches!(url.scheme(), "http" | "https") {
                return Err(Error::Config(format!(
                    "{name} must be an absolute http(s) URL, got '{url}'"
                )));
            }
        }

        Ok(())
    }

    /// Whether the listener terminates TLS.
    #[must_use]
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some()
    }

    /// The session-cookie AEAD key: the first 32 bytes of `COOKIE_SECRET`.
    #[must_use]
    pub fn cookie_key(&self) -> [u8; 32] {
        let mut key = [0u8; 32];
        key.copy_from_slice(&self.cookie_secret.as_bytes()[..32]);
        key
    }

    /// Scheme+authority of the IdP, derived from the authorization endpoint.
    ///
    /// This is the prefix the IdP proxy strips from upstream responses and
    /// the origin it forwards `/idp/*` requests to.
    #[must_use]
    pub fn idp_origin(&self) -> String {
        origin_of(&self.idp_authorization_url)
    }

    /// The `redirect_uri` registered for the authorization-code flow.
    #[must_use]
    pub fn callback_url(&self) -> String {
        format!(
            "{}/auth-callback",
            self.public_origin.as_str().trim_end_matches('/')
        )
    }
}

/// Timeouts applied to outbound calls; fixed by design rather than tunable.
pub mod timeouts {
    use super::Duration;

    /// TCP connect to any upstream
    pub const CONNECT: Duration = Duration::from_secs(5);
    /// Time to response headers from a proxied backend
    pub const FIRST_BYTE: Duration = Duration::from_secs(30);
    /// Total time to buffer a non-streaming backend body
    pub const BUFFERED_BODY: Duration = Duration::from_secs(300);
    /// Auth-service revocation check
    pub const TOKEN_VALIDATE: Duration = Duration::from_secs(2);
    /// IdP code-for-token exchange
    pub const TOKEN_EXCHANGE: Duration = Duration::from_secs(5);
    /// Preference-service theme lookup
    pub const THEME_LOOKUP: Duration = Duration::from_millis(500);
}

/// Scheme + authority of a URL, without any path or trailing slash.
#[must_use]
pub fn origin_of(url: &Url) -> String {
    let mut origin = format!("{}://{}", url.scheme(), url.host_str().unwrap_or_default());
    if let Some(port) = url.port() {
        origin.push(':');
        origin.push_str(&port.to_string());
    }
    origin
}
