//! HTML response composition
//!
//! Backends return plain application pages; the gateway dresses them in the
//! shared chrome before they reach the browser: global stylesheets, the
//! per-user theme attributes, and the navigation side panel built from the
//! service registry. Composition never fails a request — any error returns
//! the upstream body untouched.

pub mod composer;
pub mod panel;
pub mod theme;

pub use theme::{Theme, ThemeClient};

use tracing::debug;

use crate::auth::UserClaims;
use crate::registry::RegistrySnapshot;
use crate::session::SessionState;

/// Composes backend HTML with the gateway chrome.
#[derive(Clone)]
pub struct Composer {
    theme: ThemeClient,
}

impl Composer {
    /// Create a composer using the given theme client.
    #[must_use]
    pub fn new(theme: ThemeClient) -> Self {
        Self { theme }
    }

    /// Rewrite one HTML document. Returns the input unchanged when the
    /// document cannot be parsed or rewritten.
    pub async fn compose(
        &self,
        input: &[u8],
        registry: &RegistrySnapshot,
        active_service: &str,
        claims: &UserClaims,
        session: &mut SessionState,
    ) -> Vec<u8> {
        let theme = self.theme.resolve(registry, claims, session).await;
        let panel = panel::panel_html(registry, claims.permission_level, active_service);

        let chrome = composer::ChromeSpec {
            theme: &theme.theme,
            color_theme: &theme.color_theme,
            panel_html: &panel,
        };

        match composer::rewrite_document(input, &chrome) {
            Some(output) => output,
            None => {
                debug!(service = %active_service, "HTML rewrite failed; returning body unmodified");
                input.to_vec()
            }
        }
    }
}
