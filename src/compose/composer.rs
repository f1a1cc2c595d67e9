//! Streaming HTML rewriting.
//!
//! Built on a tokenizer-level rewriter rather than a full DOM: the composer
//! only needs to find `<html>`, `<head>`, and `<body>` and insert nodes.
//! Rewriting runs in two passes over the buffer. The first pass only
//! observes — which anchor elements exist and which parts of the chrome are
//! already present — so the second pass can mutate unconditionally. That
//! split is what makes composition idempotent: chrome that is already there
//! is detected, not re-inserted.

use std::cell::Cell;

use lol_html::html_content::ContentType;
use lol_html::{element, HtmlRewriter, Settings};

/// Stylesheet links injected into `<head>`, in order, ahead of any
/// stylesheet the backend shipped.
const STYLESHEET_LINKS: &str = concat!(
    r#"<link rel="stylesheet" href="/static/css/global.css">"#,
    r#"<link rel="stylesheet" href="/static/css/side-panel.css">"#,
);

/// Chrome to weave into a document.
#[derive(Debug)]
pub struct ChromeSpec<'a> {
    /// `light` or `dark`
    pub theme: &'a str,
    /// Accent palette
    pub color_theme: &'a str,
    /// Pre-rendered navigation panel markup
    pub panel_html: &'a str,
}

/// What the scan pass learned about a document.
#[derive(Debug, Clone, Copy, Default)]
struct DocumentFacts {
    has_html: bool,
    has_head: bool,
    has_body: bool,
    has_stylesheets: bool,
    has_wrapper: bool,
}

impl DocumentFacts {
    /// A document with none of the anchor elements is not worth touching.
    fn is_composable(self) -> bool {
        self.has_html || self.has_head || self.has_body
    }
}

/// Rewrite a document with the gateway chrome.
///
/// Returns `None` when the input cannot be parsed or rewritten; the caller
/// passes the original bytes through in that case.
#[must_use]
pub fn rewrite_document(input: &[u8], chrome: &ChromeSpec) -> Option<Vec<u8>> {
    let facts = scan(input)?;
    if !facts.is_composable() {
        return None;
    }

    let head_block = format!("<head>{STYLESHEET_LINKS}</head>");
    let wrapper_open = format!(
        r#"<div class="nexus-layout">{}<div class="nexus-content">"#,
        chrome.panel_html
    );

    let mut handlers = Vec::new();

    if facts.has_html {
        let theme = chrome.theme.to_string();
        let color = chrome.color_theme.to_string();
        let inject_head = !facts.has_head;
        let head_block = head_block.clone();
        handlers.push(element!("html", move |el| {
            el.set_attribute("data-theme", &theme)?;
            el.set_attribute("data-color-theme", &color)?;
            if inject_head {
                el.prepend(&head_block, ContentType::Html);
            }
            Ok(())
        }));
    }

    if facts.has_head && !facts.has_stylesheets {
        handlers.push(element!("head", move |el| {
            el.prepend(STYLESHEET_LINKS, ContentType::Html);
            Ok(())
        }));
    }

    if facts.has_body && !facts.has_wrapper {
        let wrapper_open = wrapper_open.clone();
        handlers.push(element!("body", move |el| {
            el.prepend(&wrapper_open, ContentType::Html);
            el.append("</div></div>", ContentType::Html);
            Ok(())
        }));
    }

    let mut output = Vec::with_capacity(input.len() + wrapper_open.len() + 256);
    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: handlers,
            ..Settings::new()
        },
        |chunk: &[u8]| output.extend_from_slice(chunk),
    );

    rewriter.write(input).ok()?;
    rewriter.end().ok()?;
    Some(output)
}

/// Observe the document without modifying it.
fn scan(input: &[u8]) -> Option<DocumentFacts> {
    let has_html = Cell::new(false);
    let has_head = Cell::new(false);
    let has_body = Cell::new(false);
    let has_stylesheets = Cell::new(false);
    let has_wrapper = Cell::new(false);

    {
        let mut scanner = HtmlRewriter::new(
            Settings {
                element_content_handlers: vec![
                    element!("html", |_el| {
                        has_html.set(true);
                        Ok(())
                    }),
                    element!("head", |_el| {
                        has_head.set(true);
                        Ok(())
                    }),
                    element!("body", |_el| {
                        has_body.set(true);
                        Ok(())
                    }),
                    element!(r#"link[href="/static/css/global.css"]"#, |_el| {
                        has_stylesheets.set(true);
                        Ok(())
                    }),
                    element!("div.nexus-layout", |_el| {
                        has_wrapper.set(true);
                        Ok(())
                    }),
                ],
                ..Settings::new()
            },
            |_: &[u8]| {},
        );

        scanner.write(input).ok()?;
        scanner.end().ok()?;
    }

    Some(DocumentFacts {
        has_html: has_html.get(),
        has_head: has_head.get(),
        has_body: has_body.get(),
        has_stylesheets: has_stylesheets.get(),
        has_wrapper: has_wrapper.get(),
    })
}
