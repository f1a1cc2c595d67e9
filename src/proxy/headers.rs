//! Header plumbing shared by both proxy paths.
//!
//! Hop-by-hop headers are scoped to a single transport hop and must never be
//! forwarded (RFC 2616 §13.5.1). On top of that, the backend proxy strips
//! browser credentials before injecting its own, and both proxies attach the
//! standard `X-Forwarded-*` set so upstreams can reconstruct the external
//! request.

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use regex::Regex;

/// Whether a header is hop-by-hop.
#[must_use]
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Copy forwardable request headers from the inbound request.
///
/// Always drops hop-by-hop headers and `Host` (the upstream URL carries the
/// right authority). With `strip_credentials`, also drops `Authorization`
/// and `Cookie` — backends must only ever see the gateway-injected bearer —
/// and `Accept-Encoding`, so HTML comes back identity-encoded for the
/// composer.
#[must_use]
pub fn forwardable_request_headers(src: &HeaderMap, strip_credentials: bool) -> HeaderMap {
    let mut dst = HeaderMap::new();
    for (name, value) in src {
        if is_hop_by_hop(name) || name == axum::http::header::HOST {
            continue;
        }
        if strip_credentials
            && matches!(name.as_str(), "authorization" | "cookie" | "accept-encoding")
        {
            continue;
        }
        dst.append(name.clone(), value.clone());
    }
    dst
}

/// Parameters of the external request, used to build `X-Forwarded-*`.
#[derive(Debug, Clone)]
pub struct ForwardedContext {
    /// Client IP as observed by the listener
    pub client_ip: String,
    /// `https` when the listener terminates TLS
    pub scheme: &'static str,
    /// Externally visible `Host` header
    pub host: String,
    /// Path prefix stripped before forwarding (e.g. `/codex`)
    pub prefix: String,
}

/// Inject the `X-Forwarded-*` headers, appending to any existing
/// `X-Forwarded-For` chain.
pub fn inject_forwarded_headers(headers: &mut HeaderMap, ctx: &ForwardedContext) {
    let chain = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{existing}, {}", ctx.client_ip),
        _ => ctx.client_ip.clone(),
    };

    let set = |headers: &mut HeaderMap, name: &'static str, value: &str| {
        if let Ok(v) = HeaderValue::from_str(value) {
            headers.insert(HeaderName::from_static(name), v);
        }
    };

    set(headers, "x-forwarded-for", &chain);
    set(headers, "x-forwarded-proto", ctx.scheme);
    set(headers, "x-forwarded-host", &ctx.host);
    set(headers, "x-forwarded-prefix", &ctx.prefix);
}

/// Rewrite a `Location` header that points at the proxied origin so the
/// browser stays on the gateway. Returns `None` when the value does not
/// reference `origin`.
#[must_use]
pub fn rewrite_location(value: &str, origin: &str, prefix: &str) -> Option<String> {
    let remainder = value.strip_prefix(origin)?;
    if remainder.is_empty() {
        Some(format!("{prefix}/"))
    } else {
        Some(format!("{prefix}{remainder}"))
    }
}

/// Rewrite a `Set-Cookie` header for delivery under `prefix`: the `Domain`
/// attribute is dropped and the `Path` attribute is re-rooted.
#[must_use]
pub fn rewrite_set_cookie(value: &str, prefix: &str) -> String {
    let domain_re = Regex::new(r"(?i);\s*Domain=[^;]*").unwrap();
    let path_re = Regex::new(r"(?i);\s*Path=([^;]*)").unwrap();

    let without_domain = domain_re.replace_all(value, "");
    path_re
        .replace_all(&without_domain, |caps: &regex::Captures| {
            let path = caps[1].trim();
            let tail = path.strip_prefix('/').unwrap_or(path);
            if tail.is_empty() {
                format!("; Path={prefix}/")
            } else {
                format!("; Path={prefix}/{tail}")
            }
        })
        .into_owned()
}
