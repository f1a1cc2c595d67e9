//! HTTP router and handlers
//!
//! The externally visible routing table, first match wins:
//!
//! 1. `GET /health` — liveness probe
//! 2. `GET|POST /login` — OAuth2 broker, begin
//! 3. `GET /auth-callback` — OAuth2 broker, complete
//! 4. `GET /logout` — OAuth2 broker, end
//! 5. `ANY /idp/*` — IdP reverse proxy (no session required)
//! 6. `GET /static/*` — built-in stylesheets
//! 7. `ANY /<service>/*` — authenticated backend reverse proxy
//! 8. `GET /` — redirect to the first service the caller may see
//! 9. anything else — 404
//!
//! Authenticated routes run the same staged pipeline: authenticate (session
//! cookie → validated claims), authorize (permission level vs. registry
//! entry), proxy, compose.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Query, RawQuery, State};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, warn};

use crate::auth::{AuthError, TokenValidator, UserClaims};
use crate::compose::Composer;
use crate::config::Config;
use crate::oauth::{CompleteError, OAuthBroker};
use crate::proxy::backend::{proxy_backend, BackendRequest};
use crate::proxy::headers::ForwardedContext;
use crate::proxy::idp::proxy_idp;
use crate::proxy::ProxyClient;
use crate::registry::Registry;
use crate::session::{SessionState, SessionStore};

use super::assets;

/// Shared application state
pub struct AppState {
    /// Environment configuration
    pub config: Arc<Config>,
    /// Service registry (live snapshot)
    pub registry: Registry,
    /// Session cookie codec
    pub sessions: SessionStore,
    /// Token validator (JWKS + revocation)
    pub validator: TokenValidator,
    /// Upstream HTTP client
    pub proxy: ProxyClient,
    /// HTML composer
    pub composer: Composer,
    /// OAuth2 broker
    pub broker: OAuthBroker,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/login", get(login_handler).post(login_handler))
        .route("/auth-callback", get(callback_handler))
        .route("/logout", get(logout_handler))
        .route("/idp", any(idp_root_handler))
        .route("/idp/", any(idp_root_handler))
        .route("/idp/{*path}", any(idp_handler))
        .route("/static/{*path}", get(static_handler))
        .route("/", get(root_handler))
        .route("/{service}", any(service_root_handler))
        .route("/{service}/", any(service_root_handler))
        .route("/{service}/{*path}", any(service_handler))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Plumbing
// ============================================================================

/// Outcome of the authenticate stage.
enum Authenticated {
    /// Valid session; proceed with these credentials
    Ok {
        session: SessionState,
        claims: UserClaims,
        token: String,
    },
    /// Short-circuit with this response (redirect, 503, …)
    Reject(Box<Response>),
}

/// Authenticate the request from its session cookie.
///
/// Implements the error policy: missing or unverifiable tokens redirect to
/// `/login` carrying the original target; a JWKS outage is a retryable 503;
/// an unreachable auth service fails closed but keeps the cookie (the token
/// may outlive the outage).
async fn authenticate(state: &AppState, jar: &CookieJar, original_uri: &Uri) -> Authenticated {
    let session = state.sessions.load(jar);

    let Some(token) = session.token.clone() else {
        return Authenticated::Reject(Box::new(login_redirect(original_uri).into_response()));
    };

    match state.validator.validate(&token).await {
        Ok(claims) => Authenticated::Ok {
            session,
            claims,
            token,
        },
        Err(AuthError::JwksUnavailable(e)) => {
            warn!(error = %e, "JWKS unavailable; failing request with 503");
            Authenticated::Reject(Box::new(
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    [(header::RETRY_AFTER, "5")],
                    "signing keys temporarily unavailable",
                )
                    .into_response(),
            ))
        }
        Err(AuthError::AuthServiceUnreachable(e)) => {
            warn!(error = %e, "Auth service unreachable; failing closed");
            Authenticated::Reject(Box::new(login_redirect(original_uri).into_response()))
        }
        Err(e) => {
            debug!(error = %e, "Session token rejected; clearing session");
            let cleared = state.sessions.clear(jar.clone());
            Authenticated::Reject(Box::new(
                (cleared, login_redirect(original_uri)).into_response(),
            ))
        }
    }
}

/// 302 to `/login?next=<original path+query>`.
fn login_redirect(original_uri: &Uri) -> Redirect {
    let target = original_uri
        .path_and_query()
        .map_or_else(|| "/".to_string(), ToString::to_string);
    let encoded: String = url::form_urlencoded::byte_serialize(target.as_bytes()).collect();
    Redirect::to(&format!("/login?next={encoded}"))
}

/// Forwarding context of the external request.
fn forwarded_context(
    state: &AppState,
    addr: SocketAddr,
    headers: &HeaderMap,
    prefix: String,
) -> ForwardedContext {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map_or_else(
            || {
                state
                    .config
                    .public_origin
                    .host_str()
                    .unwrap_or_default()
                    .to_string()
            },
            ToString::to_string,
        );

    ForwardedContext {
        client_ip: addr.ip().to_string(),
        scheme: if state.config.tls_enabled() {
            "https"
        } else {
            "http"
        },
        host,
        prefix,
    }
}

/// Re-save the session cookie when a handler mutated the session.
fn persist_session(
    state: &AppState,
    jar: CookieJar,
    before: &SessionState,
    after: SessionState,
    response: Response,
) -> Response {
    if *before == after {
        return response;
    }
    match state.sessions.save(jar, after) {
        Ok(jar) => (jar, response).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to re-save session cookie");
            response
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /health
async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({"status": "healthy"}))
}

#[derive(Debug, Deserialize)]
struct LoginQuery {
    next: Option<String>,
}

/// GET|POST /login — arm the session and bounce to the IdP.
async fn login_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Query(query): Query<LoginQuery>,
) -> Response {
    let mut session = state.sessions.load(&jar);
    let authorize_url = state.broker.begin(&mut session, query.next);

    match state.sessions.save(jar, session) {
        Ok(jar) => (jar, Redirect::to(&authorize_url)).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to save login session");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// GET /auth-callback — finish the code flow.
async fn callback_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let mut session = state.sessions.load(&jar);

    let result = state
        .broker
        .complete(
            &mut session,
            query.code.as_deref(),
            query.state.as_deref(),
            query.error.as_deref(),
        )
        .await;

    match result {
        Ok(target) => match state.sessions.save(jar, session) {
            Ok(jar) => (jar, Redirect::to(&target)).into_response(),
            Err(e) => {
                warn!(error = %e, "Failed to save authenticated session");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        },
        Err(e) => {
            // The flow record is one-shot: any failure tears the session down.
            let jar = state.sessions.clear(jar);
            let response = match e {
                CompleteError::StateMismatch | CompleteError::MissingCode => {
                    (StatusCode::BAD_REQUEST, "invalid authorization state").into_response()
                }
                CompleteError::IdpError(_) => {
                    warn!(error = %e, "IdP reported an authentication error");
                    (
                        StatusCode::UNAUTHORIZED,
                        format!("authentication failed: {}", describe(&query)),
                    )
                        .into_response()
                }
                CompleteError::CodeExchange(_) | CompleteError::TokenExchange(_) => {
                    warn!(error = %e, "Token exchange failed");
                    (StatusCode::BAD_GATEWAY, "sign-in could not be completed").into_response()
                }
            };
            (jar, response).into_response()
        }
    }
}

fn describe(query: &CallbackQuery) -> String {
    match (&query.error, &query.error_description) {
        (Some(e), Some(d)) => format!("{e} - {d}"),
        (Some(e), None) => e.clone(),
        _ => "unknown error".to_string(),
    }
}

/// GET /logout — revoke, clear, and send the browser away.
async fn logout_handler(State(state): State<Arc<AppState>>, jar: CookieJar) -> Response {
    let session = state.sessions.load(&jar);
    let target = state.broker.end(session.token.as_deref()).await;
    let jar = state.sessions.clear(jar);

    (
        jar,
        [(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")],
        Redirect::to(&target),
    )
        .into_response()
}

/// ANY /idp and /idp/
async fn idp_root_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    method: Method,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Body,
) -> Response {
    idp_common(&state, addr, method, "/".to_string(), query, headers, body).await
}

/// ANY /idp/{*path}
async fn idp_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(path): Path<String>,
    method: Method,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Body,
) -> Response {
    idp_common(
        &state,
        addr,
        method,
        format!("/{path}"),
        query,
        headers,
        body,
    )
    .await
}

async fn idp_common(
    state: &AppState,
    addr: SocketAddr,
    method: Method,
    tail: String,
    query: Option<String>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let ctx = forwarded_context(state, addr, &headers, "/idp".to_string());
    proxy_idp(
        &state.proxy,
        &state.config.idp_origin(),
        ctx,
        method,
        &tail,
        query.as_deref(),
        &headers,
        body,
    )
    .await
}

/// GET /static/{*path}
async fn static_handler(Path(path): Path<String>) -> Response {
    match assets::lookup(&path) {
        Some((content_type, body)) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, content_type),
                (header::CACHE_CONTROL, "public, max-age=3600"),
            ],
            body,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// GET / — land the caller on the first service they may see.
async fn root_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    uri: Uri,
) -> Response {
    let (claims, _session, _token) = match authenticate(&state, &jar, &uri).await {
        Authenticated::Ok {
            claims,
            session,
            token,
        } => (claims, session, token),
        Authenticated::Reject(response) => return *response,
    };

    let snapshot = state.registry.snapshot();
    match snapshot.visible_for(claims.permission_level).first() {
        Some(entry) => Redirect::to(&format!("/{}/", entry.name)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            "no services available for your permission level",
        )
            .into_response(),
    }
}

/// ANY /{service} and /{service}/
#[allow(clippy::too_many_arguments)]
async fn service_root_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(service): Path<String>,
    method: Method,
    uri: Uri,
    RawQuery(query): RawQuery,
    jar: CookieJar,
    headers: HeaderMap,
    body: Body,
) -> Response {
    service_common(
        &state,
        addr,
        service,
        "/".to_string(),
        method,
        uri,
        query,
        jar,
        headers,
        body,
    )
    .await
}

/// ANY /{service}/{*path}
#[allow(clippy::too_many_arguments)]
async fn service_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path((service, path)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    RawQuery(query): RawQuery,
    jar: CookieJar,
    headers: HeaderMap,
    body: Body,
) -> Response {
    service_common(
        &state,
        addr,
        service,
        format!("/{path}"),
        method,
        uri,
        query,
        jar,
        headers,
        body,
    )
    .await
}

/// The authenticate → authorize → proxy → compose pipeline.
#[allow(clippy::too_many_arguments)]
async fn service_common(
    state: &AppState,
    addr: SocketAddr,
    service: String,
    tail: String,
    method: Method,
    uri: Uri,
    query: Option<String>,
    jar: CookieJar,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let snapshot = state.registry.snapshot();
    let Some(entry) = snapshot.lookup(&service) else {
        return (StatusCode::NOT_FOUND, format!("service '{service}' not found")).into_response();
    };

    // Authenticate.
    let (claims, session, token) = match authenticate(state, &jar, &uri).await {
        Authenticated::Ok {
            claims,
            session,
            token,
        } => (claims, session, token),
        Authenticated::Reject(response) => return *response,
    };

    // Authorize.
    if claims.permission_level < entry.min_role {
        debug!(service = %service, subject = %claims.subject, "Permission denied");
        return (StatusCode::FORBIDDEN, "you do not have access to this service").into_response();
    }

    // Proxy (and compose, for HTML).
    let ctx = forwarded_context(state, addr, &headers, format!("/{service}"));
    let session_before = session.clone();
    let mut session = session;

    let response = proxy_backend(
        &state.proxy,
        &state.composer,
        &snapshot,
        entry,
        &token,
        &claims,
        &mut session,
        ctx,
        BackendRequest {
            method,
            tail,
            query,
            headers,
            body,
        },
    )
    .await;

    persist_session(state, jar, &session_before, session, response)
}
