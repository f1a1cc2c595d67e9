//! Built-in static assets.
//!
//! The two stylesheets the composer links into every page are compiled into
//! the binary; `/static/*` never touches the filesystem at runtime.

/// Global stylesheet (theme variables, layout frame).
pub const GLOBAL_CSS: &str = include_str!("../../assets/css/global.css");

/// Side-panel stylesheet.
pub const SIDE_PANEL_CSS: &str = include_str!("../../assets/css/side-panel.css");

/// Resolve a `/static/<path>` request to `(content_type, body)`.
#[must_use]
pub fn lookup(path: &str) -> Option<(&'static str, &'static str)> {
    match path {
        "css/global.css" => Some(("text/css; charset=utf-8", GLOBAL_CSS)),
        "css/side-panel.css" => Some(("text/css; charset=utf-8", SIDE_PANEL_CSS)),
        _ => None,
    }
}
