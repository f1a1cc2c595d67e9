//! OAuth2 authorization-code brokering
//!
//! The gateway is the only OAuth2 client in the ecosystem: it drives the
//! code flow against the IdP, trades the IdP access token for a
//! gateway-local JWT at the auth service, and parks that JWT in the session
//! cookie. Backends never see IdP credentials.

pub mod broker;

pub use broker::{CompleteError, OAuthBroker};
