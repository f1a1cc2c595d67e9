//! Claims carried by gateway JWTs.

use serde::Deserialize;

use crate::registry::PermissionLevel;

/// Raw JWT claim set as the auth service mints it.
#[derive(Debug, Clone, Deserialize)]
pub struct JwtClaims {
    /// Subject (stable user id)
    pub sub: String,
    /// User email; drives preference lookups
    #[serde(default)]
    pub email: Option<String>,
    /// Permission level; absent means plain user
    #[serde(default)]
    pub permission_level: Option<PermissionLevel>,
    /// Expiry, unix seconds
    pub exp: u64,
    /// Token id, used for revocation bookkeeping
    #[serde(default)]
    pub jti: Option<String>,
}

/// Validated per-request identity. Never persisted; rebuilt on every request
/// from the session token.
#[derive(Debug, Clone)]
pub struct UserClaims {
    /// Stable subject identifier
    pub subject: String,
    /// Email, when the IdP released one
    pub email: Option<String>,
    /// Effective permission level
    pub permission_level: PermissionLevel,
    /// Token expiry, unix seconds
    pub expires_at: u64,
    /// Token id
    pub token_id: Option<String>,
}

impl From<JwtClaims> for UserClaims {
    fn from(claims: JwtClaims) -> Self {
        Self {
            subject: claims.sub,
            email: claims.email,
            permission_level: claims.permission_level.unwrap_or(PermissionLevel::User),
            expires_at: claims.exp,
            token_id: claims.jti,
        }
    }
}
