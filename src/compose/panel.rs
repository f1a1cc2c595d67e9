//! Navigation side panel markup.

use crate::registry::{PermissionLevel, RegistrySnapshot};

/// Glyph shown next to a service link. Names outside the map get the
/// generic package glyph.
#[must_use]
pub fn glyph(service: &str) -> &'static str {
    match service {
        "helm" => "\u{2693}",         // anchor
        "codex" => "\u{1F5C2}",       // card index dividers
        "ledger" => "\u{1F4D2}",      // ledger book
        "beacon" => "\u{1F4E1}",      // satellite antenna
        "brainhair" => "\u{1F9E0}",   // brain
        "core" => "\u{1F6E1}",        // shield
        "nexus" => "\u{1F578}",       // spider web
        "template" => "\u{1F4C4}",    // page
        "knowledgetree" => "\u{1F333}", // tree
        "resolve" => "\u{2705}",      // check mark
        "architect" => "\u{1F3D7}",   // building construction
        "treasury" => "\u{1F4B3}",    // credit card
        "archive" => "\u{1F5C3}",     // card file box
        _ => "\u{1F4E6}",             // package
    }
}

/// Display label for a service: first letter upper-cased.
#[must_use]
pub fn display_name(service: &str) -> String {
    let mut chars = service.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Build the `<nav>` panel for the given permission level.
///
/// Lists every visible service the caller may reach, in registry order,
/// marking the service currently being viewed.
#[must_use]
pub fn panel_html(
    registry: &RegistrySnapshot,
    level: PermissionLevel,
    active_service: &str,
) -> String {
    let mut html = String::from(
        r#"<nav class="side-panel"><div class="side-panel__header"><h3 class="side-panel__title">HiveMatrix</h3></div><ul class="side-panel__list">"#,
    );

    for entry in registry.visible_for(level) {
        let active = if entry.name == active_service {
            " side-panel__item--active"
        } else {
            ""
        };
        html.push_str(&format!(
            r#"<li class="side-panel__item{active}"><a href="/{name}/" class="side-panel__link"><span class="side-panel__icon">{glyph}</span><span class="side-panel__label">{label}</span></a></li>"#,
            name = entry.name,
            glyph = glyph(&entry.name),
            label = display_name(&entry.name),
        ));
    }

    html.push_str(
        r#"</ul><div class="side-panel__footer"><a href="/logout" class="side-panel__link"><span class="side-panel__icon">&#x1F6AA;</span><span class="side-panel__label">Logout</span></a></div></nav>"#,
    );
    html
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"{
        "helm":   {"url": "http://localhost:5004", "visible": true},
        "codex":  {"url": "http://localhost:5010", "visible": true},
        "ledger": {"url": "http://localhost:5030", "visible": true, "billing_or_admin_only": true}
    }"#;

    #[test]
    fn panel_links_respect_permission_level() {
        let registry = RegistrySnapshot::parse(DOC).unwrap();

        let user = panel_html(&registry, PermissionLevel::User, "helm");
        assert!(user.contains(r#"href="/helm/""#));
        assert!(user.contains(r#"href="/codex/""#));
        assert!(!user.contains(r#"href="/ledger/""#));

        let billing = panel_html(&registry, PermissionLevel::Billing, "helm");
        assert!(billing.contains(r#"href="/ledger/""#));
    }

    #[test]
    fn active_service_is_marked() {
        let registry = RegistrySnapshot::parse(DOC).unwrap();
        let html = panel_html(&registry, PermissionLevel::User, "codex");
        let active_item = html
            .split("<li")
            .find(|chunk| chunk.contains(r#"href="/codex/""#))
            .unwrap();
        assert!(active_item.contains("side-panel__item--active"));
    }

    #[test]
    fn unknown_service_gets_generic_glyph() {
        assert_eq!(glyph("no-such-service"), "\u{1F4E6}");
        assert_ne!(glyph("helm"), glyph("codex"));
    }

    #[test]
    fn display_name_capitalizes() {
        assert_eq!(display_name("codex"), "Codex");
        assert_eq!(display_name(""), "");
    }

    #[test]
    fn panel_always_offers_logout() {
        let registry = RegistrySnapshot::parse("{}").unwrap();
        let html = panel_html(&registry, PermissionLevel::User, "");
        assert!(html.contains(r#"href="/logout""#));
    }
}
