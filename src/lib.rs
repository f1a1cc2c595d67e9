//! Nexus Gateway
//!
//! Multi-tenant HTTPS edge gateway for the internal service ecosystem.
//!
//! # Features
//!
//! - **OAuth2 brokering**: authorization-code flow against the IdP, traded
//!   for revocable gateway JWTs at the auth service
//! - **Reverse proxying**: path-based routing to registered backends with
//!   prefix stripping, forwarded headers, and SSE passthrough
//! - **HTML composition**: stylesheet, theme, and navigation-panel injection
//!   into backend HTML responses
//! - **IdP proxying**: the identity provider stays off the Internet; the
//!   gateway rewrites its URLs, cookies, and bodies
//!
//! All state lives in encrypted cookies and in-memory snapshots; the
//! gateway persists nothing.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod cli;
pub mod compose;
pub mod config;
pub mod error;
pub mod gateway;
pub mod oauth;
pub mod proxy;
pub mod registry;
pub mod session;

pub use error::{Error, Result};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
