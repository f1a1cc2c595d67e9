//! Token authentication
//!
//! Bearer tokens are JWTs minted by the auth service. Validation is
//! two-stage: signatures are checked offline against the auth service's JWKS
//! (cached, refreshed on an unknown `kid`), then revocation is confirmed
//! online. The auth service being unreachable fails the request closed.

pub mod claims;
pub mod jwks;
pub mod validator;

pub use claims::UserClaims;
pub use jwks::JwksCache;
pub use validator::TokenValidator;

use thiserror::Error;

/// Token validation failures.
///
/// Each variant maps to a distinct user-visible behavior in the router:
/// expired/revoked/unverifiable tokens clear the session and redirect to
/// `/login`; a JWKS outage is a 503 for the single affected request; an
/// unreachable auth service is treated as an invalid token.
#[derive(Error, Debug)]
pub enum AuthError {
    /// The token's `exp` is in the past (beyond clock-skew tolerance)
    #[error("token expired")]
    ExpiredToken,

    /// Signature verification failed, or the token is malformed
    #[error("bad token signature: {0}")]
    BadSignature(String),

    /// The token's `kid` is not in the JWKS, even after a refresh
    #[error("unknown signing key '{0}'")]
    UnknownKid(String),

    /// The auth service reports the token revoked or invalid
    #[error("token revoked")]
    Revoked,

    /// The `iss` claim does not match the configured issuer
    #[error("issuer mismatch")]
    IssuerMismatch,

    /// The revocation check could not be completed
    #[error("auth service unreachable: {0}")]
    AuthServiceUnreachable(String),

    /// The JWKS endpoint could not be fetched or parsed
    #[error("JWKS unavailable: {0}")]
    JwksUnavailable(String),
}
