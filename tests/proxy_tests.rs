//! Backend reverse proxy: forwarding, composition, streaming.

mod common;

use std::convert::Infallible;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use common::*;
use httpmock::prelude::*;
use serde_json::json;

fn services_with_backend(backend_url: &str) -> String {
    format!(
        r#"{{
            "helm":   {{"url": "http://localhost:59991", "visible": true}},
            "codex":  {{"url": "{backend_url}", "visible": true}},
            "ledger": {{"url": "http://localhost:59993", "visible": true, "billing_or_admin_only": true}}
        }}"#
    )
}

#[tokio::test]
async fn forwards_with_prefix_stripped_bearer_and_forwarded_headers() {
    let mocks = MockServer::start();
    mock_jwks(&mocks);
    mock_validate_ok(&mocks);

    let backend = MockServer::start();
    let token = user_token("user");
    let upstream = backend.mock(|when, then| {
        when.method(GET)
            .path("/companies")
            .query_param("page", "2")
            .header("authorization", format!("Bearer {token}"))
            .header("x-forwarded-proto", "http")
            .header("x-forwarded-prefix", "/codex")
            .header_exists("x-forwarded-for")
            .header_exists("x-forwarded-host");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"companies": []}"#);
    });

    let gateway = TestGateway::new(&mocks, &services_with_backend(&backend.base_url()));
    let addr = gateway.spawn().await;

    let response = no_redirect_client()
        .get(format!("http://{addr}/codex/companies?page=2"))
        .header("cookie", gateway.session_cookie_with_token(&token))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), r#"{"companies": []}"#);
    upstream.assert();
}

#[tokio::test]
async fn browser_cookies_never_reach_the_backend() {
    let mocks = MockServer::start();
    mock_jwks(&mocks);
    mock_validate_ok(&mocks);

    let backend = MockServer::start();
    let upstream = backend.mock(|when, then| {
        when.method(GET).path("/").matches(|req| {
            req.headers.as_ref().is_none_or(|headers| {
                !headers
                    .iter()
                    .any(|(name, _)| name.eq_ignore_ascii_case("cookie"))
            })
        });
        then.status(200).body("ok");
    });

    let gateway = TestGateway::new(&mocks, &services_with_backend(&backend.base_url()));
    let addr = gateway.spawn().await;

    let response = no_redirect_client()
        .get(format!("http://{addr}/codex/"))
        .header("cookie", gateway.session_cookie_with_token(&user_token("user")))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    upstream.assert();
}

#[tokio::test]
async fn html_responses_get_the_chrome() {
    let mocks = MockServer::start();
    mock_jwks(&mocks);
    mock_validate_ok(&mocks);

    let backend = MockServer::start();
    backend.mock(|when, then| {
        when.method(GET).path("/");
        then.status(200)
            .header("content-type", "text/html; charset=utf-8")
            .body("<!doctype html><html><head><title>X</title></head><body><h1>Hi</h1></body></html>");
    });

    let gateway = TestGateway::new(&mocks, &services_with_backend(&backend.base_url()));
    let addr = gateway.spawn().await;

    let response = no_redirect_client()
        .get(format!("http://{addr}/codex/"))
        .header("cookie", gateway.session_cookie_with_token(&user_token("billing")))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();

    // Theme attribute (lookup fails here, so the default applies).
    assert!(body.contains(r#"data-theme="light""#), "{body}");
    // Stylesheets injected exactly once.
    assert_eq!(body.matches(r#"href="/static/css/global.css""#).count(), 1);
    assert_eq!(body.matches(r#"href="/static/css/side-panel.css""#).count(), 1);
    // Navigation filtered by permission: billing sees ledger too.
    assert!(body.contains(r#"href="/helm/""#));
    assert!(body.contains(r#"href="/codex/""#));
    assert!(body.contains(r#"href="/ledger/""#));
    // Original content survives inside the frame.
    assert!(body.contains("<h1>Hi</h1>"));
}

#[tokio::test]
async fn nav_panel_is_filtered_for_plain_users() {
    let mocks = MockServer::start();
    mock_jwks(&mocks);
    mock_validate_ok(&mocks);

    let backend = MockServer::start();
    backend.mock(|when, then| {
        when.method(GET).path("/");
        then.status(200)
            .header("content-type", "text/html")
            .body("<html><head></head><body></body></html>");
    });

    let gateway = TestGateway::new(&mocks, &services_with_backend(&backend.base_url()));
    let addr = gateway.spawn().await;

    let response = no_redirect_client()
        .get(format!("http://{addr}/codex/"))
        .header("cookie", gateway.session_cookie_with_token(&user_token("user")))
        .send()
        .await
        .unwrap();

    let body = response.text().await.unwrap();
    assert!(body.contains(r#"href="/helm/""#));
    assert!(!body.contains(r#"href="/ledger/""#));
}

#[tokio::test]
async fn user_theme_is_applied_from_the_preference_service() {
    let mocks = MockServer::start();
    mock_jwks(&mocks);
    mock_validate_ok(&mocks);
    mocks.mock(|when, then| {
        when.method(POST).path("/api/service/token");
        then.status(200).json_body(json!({"token": "svc.tok.en"}));
    });

    let backend = MockServer::start();
    backend.mock(|when, then| {
        when.method(GET).path("/");
        then.status(200)
            .header("content-type", "text/html")
            .body("<html><head></head><body></body></html>");
    });
    // The preference service lives on the backend double (it is `codex`).
    backend.mock(|when, then| {
        when.method(GET)
            .path("/api/public/user/theme")
            .query_param("email", "user@example.com");
        then.status(200)
            .json_body(json!({"theme": "dark", "color_theme": "gold"}));
    });

    let gateway = TestGateway::new(&mocks, &services_with_backend(&backend.base_url()));
    let addr = gateway.spawn().await;

    let response = no_redirect_client()
        .get(format!("http://{addr}/codex/"))
        .header("cookie", gateway.session_cookie_with_token(&user_token("user")))
        .send()
        .await
        .unwrap();

    let body = response.text().await.unwrap();
    assert!(body.contains(r#"data-theme="dark""#), "{body}");
    assert!(body.contains(r#"data-color-theme="gold""#));
}

#[tokio::test]
async fn non_html_bodies_pass_through_untouched() {
    let mocks = MockServer::start();
    mock_jwks(&mocks);
    mock_validate_ok(&mocks);

    let backend = MockServer::start();
    backend.mock(|when, then| {
        when.method(GET).path("/export.csv");
        then.status(200)
            .header("content-type", "text/csv")
            .body("name,city\nacme,berlin\n");
    });

    let gateway = TestGateway::new(&mocks, &services_with_backend(&backend.base_url()));
    let addr = gateway.spawn().await;

    let response = no_redirect_client()
        .get(format!("http://{addr}/codex/export.csv"))
        .header("cookie", gateway.session_cookie_with_token(&user_token("user")))
        .send()
        .await
        .unwrap();

    assert_eq!(response.text().await.unwrap(), "name,city\nacme,berlin\n");
}

#[tokio::test]
async fn backend_5xx_html_passes_through_uncomposed() {
    let mocks = MockServer::start();
    mock_jwks(&mocks);
    mock_validate_ok(&mocks);

    let backend = MockServer::start();
    backend.mock(|when, then| {
        when.method(GET).path("/");
        then.status(500)
            .header("content-type", "text/html")
            .body("<html><body>backend exploded</body></html>");
    });

    let gateway = TestGateway::new(&mocks, &services_with_backend(&backend.base_url()));
    let addr = gateway.spawn().await;

    let response = no_redirect_client()
        .get(format!("http://{addr}/codex/"))
        .header("cookie", gateway.session_cookie_with_token(&user_token("user")))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 500);
    let body = response.text().await.unwrap();
    assert_eq!(body, "<html><body>backend exploded</body></html>");
}

#[tokio::test]
async fn unreachable_backend_is_a_composed_502() {
    let mocks = MockServer::start();
    mock_jwks(&mocks);
    mock_validate_ok(&mocks);

    // Nothing listens on this port.
    let gateway = TestGateway::new(&mocks, &services_with_backend("http://127.0.0.1:9"));
    let addr = gateway.spawn().await;

    let response = no_redirect_client()
        .get(format!("http://{addr}/codex/"))
        .header("cookie", gateway.session_cookie_with_token(&user_token("user")))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 502);
    let body = response.text().await.unwrap();
    assert!(body.contains("502 Bad Gateway"));
    // The error page wears the same chrome as every other page.
    assert!(body.contains("nexus-layout"));
    assert!(body.contains(r#"href="/helm/""#));
}

#[tokio::test]
async fn post_bodies_are_forwarded() {
    let mocks = MockServer::start();
    mock_jwks(&mocks);
    mock_validate_ok(&mocks);

    let backend = MockServer::start();
    let upstream = backend.mock(|when, then| {
        when.method(POST)
            .path("/api/companies")
            .json_body(json!({"name": "acme"}));
        then.status(201).json_body(json!({"id": 7}));
    });

    let gateway = TestGateway::new(&mocks, &services_with_backend(&backend.base_url()));
    let addr = gateway.spawn().await;

    let response = no_redirect_client()
        .post(format!("http://{addr}/codex/api/companies"))
        .header("cookie", gateway.session_cookie_with_token(&user_token("user")))
        .json(&json!({"name": "acme"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 201);
    upstream.assert();
}

/// A real streaming backend: two SSE events, 120 ms apart.
async fn spawn_sse_backend() -> std::net::SocketAddr {
    let app = Router::new().route(
        "/events",
        get(|| async {
            let stream = futures::stream::unfold(0u8, |i| async move {
                match i {
                    0 => Some((Ok::<_, Infallible>(Bytes::from_static(b"data: 1\n\n")), 1)),
                    1 => {
                        tokio::time::sleep(Duration::from_millis(120)).await;
                        Some((Ok(Bytes::from_static(b"data: 2\n\n")), 2))
                    }
                    _ => None,
                }
            });
            Response::builder()
                .header("content-type", "text/event-stream")
                .header("cache-control", "no-cache")
                .body(Body::from_stream(stream))
                .unwrap()
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn sse_events_arrive_unbuffered_and_in_order() {
    let mocks = MockServer::start();
    mock_jwks(&mocks);
    mock_validate_ok(&mocks);

    let sse_addr = spawn_sse_backend().await;
    let gateway = TestGateway::new(&mocks, &services_with_backend(&format!("http://{sse_addr}")));
    let addr = gateway.spawn().await;

    let mut response = no_redirect_client()
        .get(format!("http://{addr}/codex/events"))
        .header("cookie", gateway.session_cookie_with_token(&user_token("user")))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert!(response.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let first = response.chunk().await.unwrap().unwrap();
    let first_at = Instant::now();
    assert_eq!(&first[..], b"data: 1\n\n");

    let second = response.chunk().await.unwrap().unwrap();
    let gap = first_at.elapsed();
    assert_eq!(&second[..], b"data: 2\n\n");

    // The second event must not have been held back with the first.
    assert!(
        gap >= Duration::from_millis(80),
        "events were buffered together (gap {gap:?})"
    );

    assert!(response.chunk().await.unwrap().is_none());
}

#[tokio::test]
async fn undeclared_chunked_sse_is_detected_and_streamed() {
    let mocks = MockServer::start();
    mock_jwks(&mocks);
    mock_validate_ok(&mocks);

    // Same stream, but without the text/event-stream content type.
    let app = Router::new().route(
        "/events",
        get(|| async {
            let stream = futures::stream::unfold(0u8, |i| async move {
                match i {
                    0 => Some((Ok::<_, Infallible>(Bytes::from_static(b"data: a\n\n")), 1)),
                    1 => {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Some((Ok(Bytes::from_static(b"data: b\n\n")), 2))
                    }
                    _ => None,
                }
            });
            Response::new(Body::from_stream(stream))
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let sse_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let gateway = TestGateway::new(&mocks, &services_with_backend(&format!("http://{sse_addr}")));
    let addr = gateway.spawn().await;

    let mut response = no_redirect_client()
        .get(format!("http://{addr}/codex/events"))
        .header("cookie", gateway.session_cookie_with_token(&user_token("user")))
        .send()
        .await
        .unwrap();

    let first = response.chunk().await.unwrap().unwrap();
    let first_at = Instant::now();
    assert_eq!(&first[..], b"data: a\n\n");

    let second = response.chunk().await.unwrap().unwrap();
    assert_eq!(&second[..], b"data: b\n\n");
    assert!(first_at.elapsed() >= Duration::from_millis(80));
}
