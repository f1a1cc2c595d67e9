//! Command-line interface definitions for `nexus-gateway`.
//!
//! The CLI is intentionally thin: everything that matters operationally is
//! environment-driven (see [`crate::config::Config`]); the flags here only
//! control logging and point at the service registry document.

use std::path::PathBuf;

use clap::Parser;

/// Multi-tenant HTTPS edge gateway
///
/// Fronts the internal service ecosystem behind a single external endpoint:
/// brokers OAuth2 logins against the identity provider, reverse-proxies
/// path-prefixed requests to registered backends, and composes HTML
/// responses with the shared navigation chrome.
#[derive(Parser, Debug)]
#[command(name = "nexus-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the service registry document (overrides SERVICES_FILE)
    #[arg(short, long)]
    pub services_file: Option<PathBuf>,

    /// Minimum log level: trace, debug, info, warn, or error
    #[arg(long, default_value = "info", env = "NEXUS_LOG_LEVEL")]
    pub log_level: String,

    /// Log output format: "text" for human-readable, "json" for structured
    #[arg(long, env = "NEXUS_LOG_FORMAT")]
    pub log_format: Option<String>,
}
