//! IdP reverse proxy
//!
//! Proxies `/idp/*` to the identity provider so it never has to face the
//! Internet directly. The IdP believes it is serving its own origin; every
//! response is rewritten so the browser only ever sees `/idp/…` URLs:
//! `Location` headers, cookie paths/domains, and absolute self-references
//! inside HTML/CSS/JS bodies.
//!
//! This path deliberately requires no gateway session: it is how sessions
//! are obtained in the first place.

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use super::headers::{
    forwardable_request_headers, inject_forwarded_headers, is_hop_by_hop, rewrite_location,
    rewrite_set_cookie, ForwardedContext,
};
use super::ProxyClient;
use crate::config::timeouts;

/// Path prefix the browser sees.
pub const IDP_PREFIX: &str = "/idp";

/// Largest IdP body we rewrite; larger ones stream through untouched.
const REWRITE_CAP: usize = 8 * 1024 * 1024;

/// Proxy one request to the IdP.
///
/// `tail` is the path after `/idp` (always starting with `/` or empty);
/// `query` the raw query string.
pub async fn proxy_idp(
    client: &ProxyClient,
    idp_origin: &str,
    ctx: ForwardedContext,
    method: Method,
    tail: &str,
    query: Option<&str>,
    request_headers: &HeaderMap,
    body: Body,
) -> Response {
    let mut url = format!("{idp_origin}{tail}");
    if let Some(q) = query {
        url.push('?');
        url.push_str(q);
    }

    let mut headers = forwardable_request_headers(request_headers, false);
    // The IdP authenticates with its own cookies; bearer headers never
    // travel on this path.
    headers.remove(header::AUTHORIZATION);
    // The IdP validates Origin on form posts; it must see its own authority.
    if headers.contains_key(header::ORIGIN) {
        if let Ok(value) = HeaderValue::from_str(idp_origin) {
            headers.insert(header::ORIGIN, value);
        }
    }
    inject_forwarded_headers(&mut headers, &ctx);

    let permit = client.acquire(idp_origin).await;

    // Bound to response headers only; bodies stream for as long as they like.
    let send = client
        .http()
        .request(method, &url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .send();

    let upstream = match tokio::time::timeout(timeouts::FIRST_BYTE, send).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            warn!(error = %e, url = %url, "IdP proxy upstream error");
            return (StatusCode::BAD_GATEWAY, "identity provider unreachable").into_response();
        }
        Err(_) => {
            warn!(url = %url, "IdP did not respond in time");
            return (StatusCode::BAD_GATEWAY, "identity provider unreachable").into_response();
        }
    };

    let status = upstream.status();
    let mut response_headers = HeaderMap::new();

    for (name, value) in upstream.headers() {
        if is_hop_by_hop(name) || name == header::CONTENT_LENGTH {
            continue;
        }

        if name == header::LOCATION {
            if let Some(rewritten) = value
                .to_str()
                .ok()
                .and_then(|v| rewrite_location(v, idp_origin, IDP_PREFIX))
            {
                debug!(location = %rewritten, "Rewrote IdP redirect");
                if let Ok(v) = HeaderValue::from_str(&rewritten) {
                    response_headers.append(header::LOCATION, v);
                    continue;
                }
            }
        } else if name == header::SET_COOKIE {
            if let Ok(raw) = value.to_str() {
                let rewritten = rewrite_set_cookie(raw, IDP_PREFIX);
                if let Ok(v) = HeaderValue::from_str(&rewritten) {
                    response_headers.append(header::SET_COOKIE, v);
                    continue;
                }
            }
        }

        response_headers.append(name.clone(), value.clone());
    }

    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if needs_body_rewrite(&content_type) {
        match read_capped(upstream).await {
            Ok(Some(bytes)) => {
                let rewritten = rewrite_body(&bytes, idp_origin);
                let mut response = Response::new(Body::from(rewritten));
                *response.status_mut() = status;
                *response.headers_mut() = response_headers;
                return response;
            }
            Ok(None) => {
                warn!(url = %url, "IdP body exceeds rewrite cap; passing through");
                // Body was consumed during the capped read; nothing sane to
                // return but an error.
                return (StatusCode::BAD_GATEWAY, "identity provider response too large")
                    .into_response();
            }
            Err(e) => {
                warn!(error = %e, "Failed to read IdP response body");
                return (StatusCode::BAD_GATEWAY, "identity provider read error").into_response();
            }
        }
    }

    let stream = upstream.bytes_stream();
    let body = Body::from_stream(hold_permit(stream, permit));

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    response
}

/// Keep the in-flight permit alive for the duration of a streamed body.
fn hold_permit<S, T, E>(
    stream: S,
    permit: tokio::sync::OwnedSemaphorePermit,
) -> impl futures::Stream<Item = std::result::Result<T, E>>
where
    S: futures::Stream<Item = std::result::Result<T, E>>,
{
    use futures::StreamExt;
    stream.map(move |item| {
        let _permit = &permit;
        item
    })
}

fn needs_body_rewrite(content_type: &str) -> bool {
    content_type.starts_with("text/html")
        || content_type.starts_with("text/css")
        || content_type.starts_with("application/javascript")
}

/// Read the whole body, up to the rewrite cap. `Ok(None)` means over cap.
async fn read_capped(mut upstream: reqwest::Response) -> reqwest::Result<Option<Vec<u8>>> {
    let mut buf = Vec::new();
    while let Some(chunk) = upstream.chunk().await? {
        if buf.len() + chunk.len() > REWRITE_CAP {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(Some(buf))
}

/// Literal substitution of the IdP's scheme+authority with `/idp`.
///
/// No structural parsing: the IdP's markup is its own business, only its
/// absolute self-references change.
fn rewrite_body(bytes: &[u8], idp_origin: &str) -> Vec<u8> {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.replace(idp_origin, IDP_PREFIX).into_bytes(),
        // Mislabelled binary: leave it alone.
        Err(_) => bytes.to_vec(),
    }
}
