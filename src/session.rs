//! Session store
//!
//! Sessions live entirely inside one encrypted cookie; the server keeps no
//! per-browser state. The payload is serialized with serde, sealed with
//! XChaCha20-Poly1305 under a versioned associated-data string, and carried
//! as `base64url(nonce ‖ ciphertext)`. A cookie that fails to open for any
//! reason is treated as absent, never as an error.

use std::time::{SystemTime, UNIX_EPOCH};

use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    Key, XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Cookie name carried by every browser.
pub const SESSION_COOKIE: &str = "nexus_session";

/// Versioned AAD; bump the suffix when the payload layout changes so stale
/// deployed cookies fail authentication instead of misparsing.
const SESSION_AAD: &[u8] = b"nexus.session.v1";

/// Session lifetime.
const SESSION_TTL_SECS: u64 = 60 * 60;

/// How long a theme looked up from the preference service stays cached.
const THEME_CACHE_TTL_SECS: u64 = 5 * 60;

/// Per-browser session payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// Gateway JWT issued by the auth service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// CSRF state of an in-flight authorization-code flow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_state: Option<String>,
    /// PKCE verifier paired with `oauth_state`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_verifier: Option<String>,
    /// Where to send the browser once the flow completes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_login_target: Option<String>,
    /// Cached `(theme, color_theme, fetched_at)` from the preference service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_theme: Option<(String, String, u64)>,
    /// Absolute payload expiry (unix seconds)
    #[serde(default)]
    pub exp: u64,
}

impl SessionState {
    /// Whether this session carries a token.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    /// Theme pair from the session cache, if still fresh.
    #[must_use]
    pub fn fresh_theme(&self) -> Option<(&str, &str)> {
        let (theme, color, fetched_at) = self.cached_theme.as_ref()?;
        if now_unix().saturating_sub(*fetched_at) < THEME_CACHE_TTL_SECS {
            Some((theme, color))
        } else {
            None
        }
    }

    /// Record a freshly fetched theme pair.
    pub fn cache_theme(&mut self, theme: &str, color_theme: &str) {
        self.cached_theme = Some((theme.to_string(), color_theme.to_string(), now_unix()));
    }
}

/// Seals and opens session cookies.
#[derive(Clone)]
pub struct SessionStore {
    key: [u8; 32],
    /// Controls the `Secure` attribute; true when the listener has TLS
    secure: bool,
}

impl SessionStore {
    /// Create a store from the 32-byte cookie key.
    #[must_use]
    pub fn new(key: [u8; 32], secure: bool) -> Self {
        Self { key, secure }
    }

    /// Load the session from the request cookie jar.
    ///
    /// Missing cookie, bad encoding, failed MAC, or an expired payload all
    /// yield an empty session.
    #[must_use]
    pub fn load(&self, jar: &CookieJar) -> SessionState {
        jar.get(SESSION_COOKIE)
            .and_then(|c| self.open(c.value()))
            .unwrap_or_default()
    }

    /// Save the session into the jar with the standard cookie attributes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Session`] when the token is not syntactically a JWT
    /// or encryption fails.
    pub fn save(&self, jar: CookieJar, mut state: SessionState) -> Result<CookieJar> {
        if let Some(ref token) = state.token {
            if !looks_like_jwt(token) {
                return Err(Error::Session(
                    "refusing to store a non-JWT token".to_string(),
                ));
            }
        }

        state.exp = now_unix() + SESSION_TTL_SECS;
        let sealed = self.seal(&state)?;

        let cookie = Cookie::build((SESSION_COOKIE, sealed))
            .path("/")
            .http_only(true)
            .secure(self.secure)
            .same_site(SameSite::Lax)
            .max_age(time_duration(SESSION_TTL_SECS))
            .build();

        Ok(jar.add(cookie))
    }

    /// Emit an expired cookie so the browser drops the session.
    #[must_use]
    pub fn clear(&self, jar: CookieJar) -> CookieJar {
        let cookie = Cookie::build((SESSION_COOKIE, ""))
            .path("/")
            .http_only(true)
            .secure(self.secure)
            .same_site(SameSite::Lax)
            .max_age(time_duration(0))
            .build();
        jar.add(cookie)
    }

    fn seal(&self, state: &SessionState) -> Result<String> {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.key));
        let mut nonce_bytes = [0u8; 24];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from_slice(&nonce_bytes);

        let plaintext = serde_json::to_vec(state)?;
        let ciphertext = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: &plaintext,
                    aad: SESSION_AAD,
                },
            )
            .map_err(|e| Error::Session(format!("encrypt: {e}")))?;

        let mut out = Vec::with_capacity(24 + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(out))
    }

    fn open(&self, value: &str) -> Option<SessionState> {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.key));
        let bytes = URL_SAFE_NO_PAD.decode(value).ok()?;
        if bytes.len() < 24 {
            return None;
        }
        let (nonce_bytes, ciphertext) = bytes.split_at(24);
        let plaintext = cipher
            .decrypt(
                XNonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: SESSION_AAD,
                },
            )
            .ok()?;
        let state: SessionState = serde_json::from_slice(&plaintext).ok()?;
        if now_unix() > state.exp {
            return None;
        }
        Some(state)
    }
}

/// Three dot-separated base64 segments.
fn looks_like_jwt(token: &str) -> bool {
    let parts: Vec<&str> = token.split('.').collect();
    parts.len() == 3 && parts.iter().all(|p| !p.is_empty())
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn time_duration(secs: u64) -> time::Duration {
    time::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const FAKE_JWT: &str = "eyJhbGciOiJSUzI1NiJ9.eyJzdWIiOiJ1MSJ9.c2ln";

    fn store() -> SessionStore {
        SessionStore::new([7u8; 32], true)
    }

    fn roundtrip(store: &SessionStore, state: SessionState) -> SessionState {
        let jar = store.save(CookieJar::new(), state).unwrap();
        store.load(&jar)
    }

    #[test]
    fn save_then_load_round_trips() {
        let mut state = SessionState::default();
        state.token = Some(FAKE_JWT.to_string());
        state.post_login_target = Some("/codex/companies".to_string());

        let loaded = roundtrip(&store(), state);
        assert_eq!(loaded.token.as_deref(), Some(FAKE_JWT));
        assert_eq!(loaded.post_login_target.as_deref(), Some("/codex/companies"));
    }

    #[test]
    fn missing_cookie_yields_empty_session() {
        let state = store().load(&CookieJar::new());
        assert_eq!(state, SessionState::default());
    }

    #[test]
    fn tampered_cookie_is_treated_as_absent() {
        let s = store();
        let jar = s
            .save(
                CookieJar::new(),
                SessionState {
                    token: Some(FAKE_JWT.to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        let mut value = jar.get(SESSION_COOKIE).unwrap().value().to_string();
        // Flip a character somewhere inside the ciphertext.
        let flipped = if value.ends_with('A') { 'B' } else { 'A' };
        value.pop();
        value.push(flipped);

        let tampered = CookieJar::new().add(Cookie::new(SESSION_COOKIE, value));
        assert_eq!(s.load(&tampered), SessionState::default());
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let jar = store()
            .save(
                CookieJar::new(),
                SessionState {
                    token: Some(FAKE_JWT.to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        let other = SessionStore::new([8u8; 32], true);
        assert_eq!(other.load(&jar), SessionState::default());
    }

    #[test]
    fn non_jwt_token_is_refused_at_save() {
        let result = store().save(
            CookieJar::new(),
            SessionState {
                token: Some("not-a-jwt".to_string()),
                ..Default::default()
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn cookie_attributes_follow_policy() {
        let jar = store().save(CookieJar::new(), SessionState::default()).unwrap();
        let cookie = jar.get(SESSION_COOKIE).unwrap();
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.secure(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        assert_eq!(cookie.path(), Some("/"));
    }

    #[test]
    fn clear_expires_the_cookie() {
        let jar = store().clear(CookieJar::new());
        let cookie = jar.get(SESSION_COOKIE).unwrap();
        assert_eq!(cookie.max_age(), Some(time::Duration::ZERO));
        assert!(cookie.value().is_empty());
    }

    #[test]
    fn theme_cache_expires() {
        let mut state = SessionState::default();
        state.cache_theme("dark", "blue");
        assert_eq!(state.fresh_theme(), Some(("dark", "blue")));

        state.cached_theme = Some(("dark".into(), "blue".into(), now_unix() - 600));
        assert_eq!(state.fresh_theme(), None);
    }

    #[test]
    fn cookie_stays_under_four_kib() {
        // A JWT on the large side of realistic.
        let big_token = format!(
            "{}.{}.{}",
            "a".repeat(40),
            "b".repeat(1200),
            "c".repeat(350)
        );
        let jar = store()
            .save(
                CookieJar::new(),
                SessionState {
                    token: Some(big_token),
                    post_login_target: Some("/codex/companies?page=2".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        let len = jar.get(SESSION_COOKIE).unwrap().value().len();
        assert!(len < 4096, "cookie value is {len} bytes");
    }
}
