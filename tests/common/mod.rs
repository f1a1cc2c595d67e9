//! Shared fixtures for integration tests: a fully wired gateway with
//! httpmock doubles standing in for the IdP, the auth service, and backends.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use axum_extra::extract::cookie::CookieJar;
use httpmock::MockServer;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde_json::json;
use url::Url;

use nexus_gateway::auth::{JwksCache, TokenValidator};
use nexus_gateway::compose::theme::ServiceTokenProvider;
use nexus_gateway::compose::{Composer, ThemeClient};
use nexus_gateway::config::Config;
use nexus_gateway::gateway::{create_router, AppState};
use nexus_gateway::oauth::OAuthBroker;
use nexus_gateway::proxy::ProxyClient;
use nexus_gateway::registry::{Registry, RegistrySnapshot};
use nexus_gateway::session::{SessionState, SessionStore, SESSION_COOKIE};

pub const TEST_KEY_PEM: &str = include_str!("../data/test_rsa.pem");
pub const TEST_KID: &str = "test-key";
pub const TEST_ISSUER: &str = "hivematrix-core";
pub const COOKIE_SECRET: &str = "0123456789abcdef0123456789abcdef";

pub const TEST_N: &str = "w_9bPqBUclFRXLHSylZ5hzuXiIxlYCUBIa0PM_PfRxudd4qvQMfIm6AonX3Ew_LkjWXYlNsRL74HTDHJ4QNe9A\
                          Bh5dbzJRmICZFZRWe0gcE-2rKY7eq-krpi9DMaJDTq_0AHQGt_KGaocejLOwK_1gP6X9zsjSF5mmWwulf4H6Pe\
                          VududwbLo0XTSXAo5wODvmenZ29IKC_1eWPC6b1tJEtxaXrVDO2LSvMCNQiYfceOOs_e7xFYLfHAhfMKdkDs9g\
                          pO9X9_d1Eo0cr6uUct50fpnoDzf3Ba-PLmkW3n5p1xIOw2p2eXe-N01tiHLYedzmAWhpCO8xgpYLzEvozsbQ";
pub const TEST_E: &str = "AQAB";

/// A gateway wired against one mock server playing IdP + auth service,
/// with backends registered per `services_json`.
pub struct TestGateway {
    pub state: Arc<AppState>,
    pub sessions: SessionStore,
}

impl TestGateway {
    pub fn new(auth_and_idp: &MockServer, services_json: &str) -> Self {
        let base = auth_and_idp.base_url();
        let config = Arc::new(Config {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            tls_cert: None,
            tls_key: None,
            cookie_secret: COOKIE_SECRET.to_string(),
            auth_service_url: Url::parse(&base).unwrap(),
            auth_issuer: TEST_ISSUER.to_string(),
            idp_authorization_url: Url::parse(&format!("{base}/realms/hive/auth")).unwrap(),
            idp_token_url: Url::parse(&format!("{base}/realms/hive/token")).unwrap(),
            idp_end_session_url: None,
            idp_client_id: "gateway-client".to_string(),
            idp_client_secret: "s3cret".to_string(),
            public_origin: Url::parse("https://gateway.example.com").unwrap(),
            services_file: "services.json".into(),
            theme_service: "codex".to_string(),
        });

        let registry =
            Registry::from_snapshot(RegistrySnapshot::parse(services_json).expect("services"));

        let proxy = ProxyClient::new().expect("proxy client");
        let http = proxy.http().clone();

        let jwks = Arc::new(JwksCache::new(http.clone(), &config.auth_service_url));
        let validator = TokenValidator::new(
            http.clone(),
            jwks,
            &config.auth_service_url,
            &config.auth_issuer,
        );

        let tokens =
            ServiceTokenProvider::new(http.clone(), &config.auth_service_url, &config.theme_service);
        let composer =
            Composer::new(ThemeClient::new(http.clone(), tokens, &config.theme_service));

        // Secure=false so plain-HTTP test clients round-trip the cookie.
        let sessions = SessionStore::new(config.cookie_key(), false);
        let broker = OAuthBroker::new(http, Arc::clone(&config));

        let state = Arc::new(AppState {
            config,
            registry,
            sessions: sessions.clone(),
            validator,
            proxy,
            composer,
            broker,
        });

        Self { state, sessions }
    }

    /// Serve the router on an ephemeral port; returns its address.
    pub async fn spawn(&self) -> SocketAddr {
        let app = create_router(Arc::clone(&self.state))
            .into_make_service_with_connect_info::<SocketAddr>();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    /// `Cookie` header value for a session holding `token`.
    pub fn session_cookie_with_token(&self, token: &str) -> String {
        let jar = self
            .sessions
            .save(
                CookieJar::new(),
                SessionState {
                    token: Some(token.to_string()),
                    ..Default::default()
                },
            )
            .expect("seal session");
        format!(
            "{SESSION_COOKIE}={}",
            jar.get(SESSION_COOKIE).unwrap().value()
        )
    }

    /// `Cookie` header value for an arbitrary session state.
    pub fn session_cookie(&self, state: SessionState) -> String {
        let jar = self.sessions.save(CookieJar::new(), state).expect("seal");
        format!(
            "{SESSION_COOKIE}={}",
            jar.get(SESSION_COOKIE).unwrap().value()
        )
    }

    /// Decode a `Set-Cookie` header back into a session state.
    pub fn open_set_cookie(&self, set_cookie: &str) -> SessionState {
        let value = set_cookie
            .split(';')
            .next()
            .and_then(|kv| kv.strip_prefix(&format!("{SESSION_COOKIE}=")))
            .expect("session cookie in Set-Cookie");
        let jar = CookieJar::new().add(axum_extra::extract::cookie::Cookie::new(
            SESSION_COOKIE,
            value.to_string(),
        ));
        self.sessions.load(&jar)
    }
}

/// Sign a JWT with the test RSA key.
pub fn sign_token(claims: serde_json::Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(TEST_KID.to_string());
    let key = EncodingKey::from_rsa_pem(TEST_KEY_PEM.as_bytes()).unwrap();
    encode(&header, &claims, &key).unwrap()
}

/// A signed token for a regular user, valid for an hour.
pub fn user_token(permission_level: &str) -> String {
    sign_token(json!({
        "sub": "user-1",
        "email": "user@example.com",
        "permission_level": permission_level,
        "iss": TEST_ISSUER,
        "exp": now_unix() + 3600,
        "jti": "tok-1"
    }))
}

pub fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// Register the JWKS endpoint on the auth-service double.
pub fn mock_jwks(server: &MockServer) {
    server.mock(|when, then| {
        when.method(httpmock::Method::GET)
            .path("/.well-known/jwks.json");
        then.status(200).json_body(json!({
            "keys": [{
                "kty": "RSA",
                "kid": TEST_KID,
                "alg": "RS256",
                "use": "sig",
                "n": TEST_N,
                "e": TEST_E
            }]
        }));
    });
}

/// Register a token-validate endpoint that accepts everything.
pub fn mock_validate_ok(server: &MockServer) {
    server.mock(|when, then| {
        when.method(httpmock::Method::POST)
            .path("/api/token/validate");
        then.status(200)
            .json_body(json!({"valid": true, "revoked": false}));
    });
}

/// HTTP client that never follows redirects (we assert on them).
pub fn no_redirect_client() -> Client {
    Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}
