//! Error types for the gateway

use std::io;

use thiserror::Error;

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Service registry error (bad services.json)
    #[error("Registry error: {0}")]
    Registry(String),

    /// Cannot bind the listener socket
    #[error("Bind error: {0}")]
    Bind(String),

    /// Cannot load TLS certificate or key material
    #[error("TLS error: {0}")]
    Tls(String),

    /// Session cookie error
    #[error("Session error: {0}")]
    Session(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map startup errors to the documented process exit codes.
    ///
    /// 0 clean, 2 bad configuration, 3 cannot bind, 4 cannot load TLS
    /// materials; anything else is a generic failure.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) | Self::Registry(_) => 2,
            Self::Bind(_) => 3,
            Self::Tls(_) => 4,
            _ => 1,
        }
    }
}
