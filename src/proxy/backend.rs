//! Backend reverse proxy
//!
//! Forwards `/<service>/*` to the matching registry entry with the session
//! bearer injected and the `/<service>` prefix stripped. Response handling
//! is three-way: event streams are piped through chunk-by-chunk with no
//! buffering, HTML is buffered (capped) and composed, everything else
//! streams through untouched.

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use tracing::{debug, warn};

use super::headers::{
    forwardable_request_headers, inject_forwarded_headers, is_hop_by_hop, ForwardedContext,
};
use super::ProxyClient;
use crate::auth::UserClaims;
use crate::compose::Composer;
use crate::config::{origin_of, timeouts};
use crate::registry::{RegistrySnapshot, ServiceEntry};
use crate::session::SessionState;

/// Largest HTML body the composer will buffer. Bigger documents stream
/// through unmodified.
pub const COMPOSE_CAP: usize = 8 * 1024 * 1024;

/// One proxied request, after routing and authentication.
pub struct BackendRequest {
    /// HTTP method
    pub method: Method,
    /// Path after the service prefix; always begins with `/`
    pub tail: String,
    /// Raw query string, if any
    pub query: Option<String>,
    /// Inbound request headers
    pub headers: HeaderMap,
    /// Inbound request body (streamed, never buffered)
    pub body: Body,
}

/// Forward a request to `entry`'s backend and shape the response.
#[allow(clippy::too_many_arguments)]
pub async fn proxy_backend(
    client: &ProxyClient,
    composer: &Composer,
    registry: &RegistrySnapshot,
    entry: &ServiceEntry,
    token: &str,
    claims: &UserClaims,
    session: &mut SessionState,
    ctx: ForwardedContext,
    req: BackendRequest,
) -> Response {
    let origin = origin_of(&entry.origin);
    let mut url = format!("{origin}{}", req.tail);
    if let Some(ref q) = req.query {
        url.push('?');
        url.push_str(q);
    }

    let mut headers = forwardable_request_headers(&req.headers, true);
    if let Ok(value) = axum::http::HeaderValue::from_str(&format!("Bearer {token}")) {
        headers.insert(header::AUTHORIZATION, value);
    }
    inject_forwarded_headers(&mut headers, &ctx);

    let permit = client.acquire(&origin).await;

    // First-byte bound only: the timeout wraps the send (headers received),
    // never the body — SSE streams have no total cap.
    let send = client
        .http()
        .request(req.method, &url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(req.body.into_data_stream()))
        .send();

    let mut upstream = match tokio::time::timeout(timeouts::FIRST_BYTE, send).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            warn!(service = %entry.name, url = %url, error = %e, "Backend unreachable");
            return error_page(composer, registry, entry, claims, session).await;
        }
        Err(_) => {
            warn!(service = %entry.name, url = %url, "Backend did not respond in time");
            return error_page(composer, registry, entry, claims, session).await;
        }
    };

    let status = upstream.status();
    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let chunked = upstream.content_length().is_none();

    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        if is_hop_by_hop(name) {
            continue;
        }
        response_headers.append(name.clone(), value.clone());
    }

    // Declared event streams pipe straight through.
    if content_type.starts_with("text/event-stream") {
        debug!(service = %entry.name, "Streaming SSE response");
        return stream_response(status, response_headers, Vec::new(), upstream, permit, None);
    }

    // Undeclared streams: chunked responses whose body opens with an SSE
    // data line are treated as event streams too.
    let mut peeked: Vec<Bytes> = Vec::new();
    if chunked && !content_type.starts_with("text/html") {
        match upstream.chunk().await {
            Ok(Some(first)) => {
                let is_sse = first.starts_with(b"data:");
                peeked.push(first);
                if is_sse {
                    debug!(service = %entry.name, "Streaming undeclared event stream");
                    return stream_response(
                        status,
                        response_headers,
                        peeked,
                        upstream,
                        permit,
                        None,
                    );
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(service = %entry.name, error = %e, "Backend body error");
                return error_page(composer, registry, entry, claims, session).await;
            }
        }
    }

    // HTML (non-5xx) gets composed; everything else passes through.
    if content_type.starts_with("text/html") && !status.is_server_error() {
        match buffer_capped(peeked, &mut upstream).await {
            Ok(Buffered::Complete(bytes)) => {
                let composed = composer
                    .compose(&bytes, registry, &entry.name, claims, session)
                    .await;
                response_headers.remove(header::CONTENT_LENGTH);
                let mut response = Response::new(Body::from(composed));
                *response.status_mut() = status;
                *response.headers_mut() = response_headers;
                return response;
            }
            Ok(Buffered::OverCap(prefix)) => {
                warn!(service = %entry.name, cap = COMPOSE_CAP, "HTML body over compose cap; passing through");
                return stream_response(
                    status,
                    response_headers,
                    prefix,
                    upstream,
                    permit,
                    Some(timeouts::BUFFERED_BODY),
                );
            }
            Err(e) => {
                warn!(service = %entry.name, error = %e, "Backend body error");
                return error_page(composer, registry, entry, claims, session).await;
            }
        }
    }

    stream_response(
        status,
        response_headers,
        peeked,
        upstream,
        permit,
        Some(timeouts::BUFFERED_BODY),
    )
}

/// Result of the capped HTML read.
enum Buffered {
    Complete(Vec<u8>),
    /// Cap exceeded; the chunks read so far, to be replayed ahead of the rest
    OverCap(Vec<Bytes>),
}

/// Read the remaining body, bounded by [`COMPOSE_CAP`] and a total timeout.
async fn buffer_capped(
    peeked: Vec<Bytes>,
    upstream: &mut reqwest::Response,
) -> std::result::Result<Buffered, String> {
    let read = async {
        let mut chunks = peeked;
        let mut total: usize = chunks.iter().map(Bytes::len).sum();

        while let Some(chunk) = upstream.chunk().await.map_err(|e| e.to_string())? {
            total += chunk.len();
            chunks.push(chunk);
            if total > COMPOSE_CAP {
                return Ok(Buffered::OverCap(chunks));
            }
        }

        let mut body = Vec::with_capacity(total);
        for chunk in &chunks {
            body.extend_from_slice(chunk);
        }
        Ok(Buffered::Complete(body))
    };

    tokio::time::timeout(timeouts::BUFFERED_BODY, read)
        .await
        .map_err(|_| "timed out reading backend body".to_string())?
}

/// Build a pass-through streaming response, replaying any peeked chunks
/// first. The in-flight permit rides inside the stream so it is released
/// when the body finishes or the client disconnects. Non-event-stream
/// bodies carry a total deadline; event streams run until either side
/// closes.
fn stream_response(
    status: StatusCode,
    headers: HeaderMap,
    peeked: Vec<Bytes>,
    upstream: reqwest::Response,
    permit: tokio::sync::OwnedSemaphorePermit,
    total_cap: Option<std::time::Duration>,
) -> Response {
    type BoxError = Box<dyn std::error::Error + Send + Sync>;

    let deadline = total_cap.map(|cap| std::time::Instant::now() + cap);
    let replay = futures::stream::iter(peeked.into_iter().map(Ok));
    let rest = upstream.bytes_stream();
    let body_stream =
        replay
            .chain(rest)
            .map(move |item| -> std::result::Result<Bytes, BoxError> {
                let _permit = &permit;
                if deadline.is_some_and(|d| std::time::Instant::now() > d) {
                    return Err("backend body exceeded the total response timeout".into());
                }
                item.map_err(Into::into)
            });

    let mut response = Response::new(Body::from_stream(body_stream));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// 502 with a short HTML page, itself routed through the composer so the
/// user keeps the navigation chrome.
async fn error_page(
    composer: &Composer,
    registry: &RegistrySnapshot,
    entry: &ServiceEntry,
    claims: &UserClaims,
    session: &mut SessionState,
) -> Response {
    let page = format!(
        "<!doctype html><html><head><title>Bad Gateway</title></head>\
         <body><h1>502 Bad Gateway</h1>\
         <p>The {} service did not respond.</p></body></html>",
        crate::compose::panel::display_name(&entry.name)
    );

    let composed = composer
        .compose(page.as_bytes(), registry, &entry.name, claims, session)
        .await;

    (
        StatusCode::BAD_GATEWAY,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        composed,
    )
        .into_response()
}
