//! Sanitize captured single-page-application snapshots for static serving.
//!
//! A snapshot is the serialized document of a fully rendered route. Before it is served to
//! crawlers, metadata the framework injected at runtime (structured data, titles, canonical
//! links, SEO `<meta>` tags) is stripped so the route can supply its own through the
//! `<truthseo-snapshot-ready>` element, a version marker is added, and optionally a small
//! validator script is appended so a stale snapshot can send visitors back to the live origin.
//!
//! ```
//! use snapshot_sanitizer::{sanitize, TransformOptions};
//!
//! let html = r#"<html><head><title>Old</title></head><body></body></html>"#;
//! let options = TransformOptions { inject_validator: false, ..TransformOptions::default() };
//! let sanitized = sanitize(html, &options).unwrap();
//! assert!(!sanitized.contains("<title>"));
//! assert!(sanitized.starts_with("<!DOCTYPE html>\n"));
//! ```

use lol_html::errors::RewritingError;
use lol_html::html_content::ContentType;
use lol_html::{comments, element, HtmlRewriter, Settings};
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

mod outline;
mod validator;

pub use validator::{
    validator_element, FORCE_ORIGIN_ATTRIBUTE, VALIDATOR_SCRIPT_ID, VERSION_ATTRIBUTE,
};

/// Element an application renders to hand head markup to the snapshot.
pub const SNAPSHOT_READY_TAG: &str = "truthseo-snapshot-ready";
/// `name` of the version marker `<meta>` written into every sanitized head.
pub const VERSION_META_NAME: &str = "truthseo:snapshot-version";
/// Version marker used when the caller does not pick one.
pub const DEFAULT_SNAPSHOT_VERSION: u32 = 9;

const INJECTED_OPEN: &str = "TruthSEO-Snapshot";
const INJECTED_CLOSE: &str = "TruthSEO-Snapshot-Done";
const DOCTYPE: &str = "<!DOCTYPE html>\n";

/// Knobs for a sanitize pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformOptions {
    /// Integer written to the version marker and the validator's `data-version`.
    pub snapshot_version: u32,
    /// Append the freshness validator script to the body.
    pub inject_validator: bool,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            snapshot_version: DEFAULT_SNAPSHOT_VERSION,
            inject_validator: true,
        }
    }
}

/// Errors surfaced while sanitizing a snapshot.
#[derive(Debug)]
pub enum TransformError {
    /// The markup has no `<head>` element to rewrite.
    MissingHead,
    /// The markup has no `<body>` element.
    MissingBody,
    /// The HTML rewriter rejected the markup.
    Rewrite(RewritingError),
}

impl fmt::Display for TransformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingHead => write!(f, "document has no <head> element"),
            Self::MissingBody => write!(f, "document has no <body> element"),
            Self::Rewrite(err) => write!(f, "html rewrite error: {err}"),
        }
    }
}

impl Error for TransformError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Rewrite(err) => Some(err),
            Self::MissingHead | Self::MissingBody => None,
        }
    }
}

/// Rewrites a captured document for static serving.
///
/// Applied in order: drop head JSON-LD scripts, titles and canonical links; drop every head
/// `<meta>` except charset, `http-equiv` and viewport; insert the version marker before the
/// first head `<base>` (or as the first head child); move the snapshot-ready element's content
/// into the head between marker comments; append the validator script when enabled.
///
/// Content already sitting between the marker comments is left alone, and an existing version
/// marker or validator is replaced, so sanitizing twice gives the same output as once.
pub fn sanitize(html: &str, options: &TransformOptions) -> Result<String, TransformError> {
    let source = strip_doctype(html);
    let outline = outline::scan(source).map_err(TransformError::Rewrite)?;
    if !outline.has_head {
        return Err(TransformError::MissingHead);
    }
    if !outline.has_body {
        return Err(TransformError::MissingBody);
    }

    let state = Arc::new(Mutex::new(RewriteState::default()));
    let comment_state = Arc::clone(&state);
    let json_ld_state = Arc::clone(&state);
    let title_state = Arc::clone(&state);
    let canonical_state = Arc::clone(&state);
    let meta_state = Arc::clone(&state);
    let marker_state = Arc::clone(&state);
    let ready_state = Arc::clone(&state);

    let mut handlers = vec![
        comments!("head", move |comment| {
            match comment.text().trim() {
                INJECTED_OPEN => lock(&comment_state).in_injected = true,
                INJECTED_CLOSE => lock(&comment_state).in_injected = false,
                _ => {}
            }
            Ok(())
        }),
        element!("head script[type]", move |el| {
            let json_ld = attribute_is(el.get_attribute("type"), "application/ld+json");
            if json_ld && !lock(&json_ld_state).in_injected {
                el.remove();
            }
            Ok(())
        }),
        element!("head title", move |el| {
            if !lock(&title_state).in_injected {
                el.remove();
            }
            Ok(())
        }),
        element!("head link[rel]", move |el| {
            let canonical = attribute_is(el.get_attribute("rel"), "canonical");
            if canonical && !lock(&canonical_state).in_injected {
                el.remove();
            }
            Ok(())
        }),
        element!("head meta", move |el| {
            if lock(&meta_state).in_injected {
                return Ok(());
            }
            let allowed = is_allowed_meta(
                el.get_attribute("charset"),
                el.get_attribute("http-equiv"),
                el.get_attribute("name"),
            );
            if !allowed {
                el.remove();
            }
            Ok(())
        }),
    ];

    let marker = version_marker(options.snapshot_version);
    if outline.has_base {
        handlers.push(element!("head base", move |el| {
            let mut state = lock(&marker_state);
            if !state.marker_written {
                state.marker_written = true;
                el.before(&marker, ContentType::Html);
            }
            Ok(())
        }));
    } else {
        handlers.push(element!("head", move |el| {
            let mut state = lock(&marker_state);
            if !state.marker_written {
                state.marker_written = true;
                el.prepend(&marker, ContentType::Html);
            }
            Ok(())
        }));
    }

    if let Some(content) = outline.ready_content.as_deref() {
        let block = injected_block(content);
        let inject_state = Arc::clone(&state);
        handlers.push(element!("head", move |el| {
            let mut state = lock(&inject_state);
            if !state.content_injected {
                state.content_injected = true;
                el.append(&block, ContentType::Html);
            }
            Ok(())
        }));
    }

    handlers.push(element!(SNAPSHOT_READY_TAG, move |el| {
        let mut state = lock(&ready_state);
        if !state.ready_removed {
            state.ready_removed = true;
            el.remove();
        }
        Ok(())
    }));

    if options.inject_validator {
        let script = validator_element(options.snapshot_version);
        let body_state = Arc::clone(&state);
        handlers.push(element!("body script#truthorigin-snapshot", |el| {
            el.remove();
            Ok(())
        }));
        handlers.push(element!("body", move |el| {
            let mut state = lock(&body_state);
            if !state.validator_written {
                state.validator_written = true;
                el.append(&script, ContentType::Html);
            }
            Ok(())
        }));
    }

    let mut output = Vec::with_capacity(source.len() + 2048);
    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: handlers,
            ..Settings::default()
        },
        |chunk: &[u8]| output.extend_from_slice(chunk),
    );
    rewriter
        .write(source.as_bytes())
        .map_err(TransformError::Rewrite)?;
    rewriter.end().map_err(TransformError::Rewrite)?;

    let rewritten = String::from_utf8_lossy(&output);
    debug!(
        input_len = html.len(),
        output_len = rewritten.len(),
        "snapshot sanitized"
    );
    Ok(format!("{DOCTYPE}{rewritten}"))
}

/// Sanitizes `html`, falling back to the untouched input when the markup cannot be rewritten.
pub fn sanitize_or_passthrough(html: &str, options: &TransformOptions) -> String {
    match sanitize(html, options) {
        Ok(sanitized) => sanitized,
        Err(err) => {
            warn!(error = %err, "failed to sanitize snapshot, keeping original markup");
            html.to_string()
        }
    }
}

/// Markup of the version marker `<meta>` for `version`.
pub fn version_marker(version: u32) -> String {
    format!("<meta name=\"{VERSION_META_NAME}\" content=\"{version}\">")
}

#[derive(Default)]
struct RewriteState {
    in_injected: bool,
    marker_written: bool,
    content_injected: bool,
    ready_removed: bool,
    validator_written: bool,
}

fn lock(state: &Mutex<RewriteState>) -> MutexGuard<'_, RewriteState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn is_allowed_meta(
    charset: Option<String>,
    http_equiv: Option<String>,
    name: Option<String>,
) -> bool {
    let non_empty = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.is_empty());
    non_empty(&charset)
        || non_empty(&http_equiv)
        || name.is_some_and(|name| name.eq_ignore_ascii_case("viewport"))
}

// `type` and `rel` values compare ASCII case-insensitively in HTML documents.
fn attribute_is(value: Option<String>, expected: &str) -> bool {
    value.is_some_and(|value| value.eq_ignore_ascii_case(expected))
}

fn injected_block(content: &str) -> String {
    format!("\n<!-- {INJECTED_OPEN} -->\n{content}\n<!-- {INJECTED_CLOSE} -->\n")
}

fn strip_doctype(html: &str) -> &str {
    let html = html.trim_start_matches('\u{feff}');
    let trimmed = html.trim_start();
    let is_doctype = trimmed
        .get(..9)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("<!doctype"));
    if !is_doctype {
        return html;
    }
    match trimmed.find('>') {
        Some(end) => trimmed[end + 1..].trim_start(),
        None => html,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn without_validator() -> TransformOptions {
        TransformOptions {
            inject_validator: false,
            ..TransformOptions::default()
        }
    }

    #[test]
    fn keeps_charset_and_viewport_drops_description_and_title() {
        let html = concat!(
            r#"<html><head><meta charset="utf-8"><meta name="description" content="d">"#,
            r#"<meta name="viewport" content="width=device-width"><title>X</title></head>"#,
            r#"<body><p>hi</p></body></html>"#
        );

        let sanitized = sanitize(html, &without_validator()).expect("sanitize");

        assert_eq!(
            sanitized,
            concat!(
                "<!DOCTYPE html>\n",
                r#"<html><head><meta name="truthseo:snapshot-version" content="9">"#,
                r#"<meta charset="utf-8"><meta name="viewport" content="width=device-width">"#,
                r#"</head><body><p>hi</p></body></html>"#
            )
        );
    }

    #[test]
    fn strips_structured_data_and_canonical_links() {
        let html = concat!(
            r#"<html><head><script type="application/ld+json">{"@type":"Thing"}</script>"#,
            r#"<link rel="canonical" href="https://old.example/"><link rel="stylesheet" href="/a.css">"#,
            r#"<meta http-equiv="X-UA-Compatible" content="IE=edge"><meta property="og:title" content="t">"#,
            r#"</head><body><script type="application/ld+json">{}</script></body></html>"#
        );

        let sanitized = sanitize(html, &without_validator()).expect("sanitize");

        assert!(!sanitized.contains(r#"{"@type":"Thing"}"#));
        assert!(!sanitized.contains("canonical"));
        assert!(!sanitized.contains("og:title"));
        assert!(sanitized.contains(r#"<link rel="stylesheet" href="/a.css">"#));
        assert!(sanitized.contains(r#"http-equiv="X-UA-Compatible""#));
        // only head structured data is stripped
        assert!(sanitized.contains(r#"<body><script type="application/ld+json">{}</script>"#));
    }

    #[test]
    fn empty_charset_does_not_protect_a_meta() {
        let html = r#"<html><head><meta charset="" name="robots" content="noindex"></head><body></body></html>"#;
        let sanitized = sanitize(html, &without_validator()).expect("sanitize");
        assert!(!sanitized.contains("robots"));
    }

    #[test]
    fn marker_goes_before_base_when_present() {
        let html = r#"<html><head><meta charset="utf-8"><base href="/app/"></head><body></body></html>"#;
        let sanitized = sanitize(html, &without_validator()).expect("sanitize");
        assert!(sanitized.contains(concat!(
            r#"<meta charset="utf-8"><meta name="truthseo:snapshot-version" content="9">"#,
            r#"<base href="/app/">"#
        )));
    }

    #[test]
    fn moves_ready_content_into_head() {
        let html = concat!(
            r#"<html><head><title>Framework</title></head><body><div id="app">x</div>"#,
            r#"<truthseo-snapshot-ready><title>About</title>"#,
            r#"<meta name="description" content="About us"></truthseo-snapshot-ready></body></html>"#
        );

        let sanitized = sanitize(html, &without_validator()).expect("sanitize");

        assert!(!sanitized.contains("Framework"));
        assert!(!sanitized.contains("<truthseo-snapshot-ready>"));
        assert!(sanitized.contains(concat!(
            "\n<!-- TruthSEO-Snapshot -->\n",
            r#"<title>About</title><meta name="description" content="About us">"#,
            "\n<!-- TruthSEO-Snapshot-Done -->\n</head>"
        )));
        assert!(sanitized.contains(r#"<body><div id="app">x</div></body>"#));
    }

    #[test]
    fn empty_ready_element_is_removed_without_markers() {
        let html = "<html><head></head><body><truthseo-snapshot-ready> </truthseo-snapshot-ready></body></html>";
        let sanitized = sanitize(html, &without_validator()).expect("sanitize");
        assert!(!sanitized.contains("truthseo-snapshot-ready"));
        assert!(!sanitized.contains("TruthSEO-Snapshot"));
    }

    #[test]
    fn appends_validator_with_matching_version() {
        let options = TransformOptions {
            snapshot_version: 12,
            inject_validator: true,
        };
        let html = "<html><head></head><body><p>x</p></body></html>";
        let sanitized = sanitize(html, &options).expect("sanitize");

        assert!(sanitized.contains(r#"<meta name="truthseo:snapshot-version" content="12">"#));
        assert!(sanitized.contains(r#"<script id="truthorigin-snapshot" data-version="12">"#));
        assert!(sanitized.ends_with("</script></body></html>"));
    }

    #[test]
    fn sanitizing_twice_changes_nothing() {
        let html = concat!(
            r#"<!doctype html><html><head><meta charset="utf-8"><title>T</title>"#,
            r#"<meta name="description" content="stale"><base href="/"></head><body>"#,
            r#"<truthseo-snapshot-ready><title>Fresh</title>"#,
            r#"<meta name="description" content="fresh"></truthseo-snapshot-ready>"#,
            r#"<main>content</main></body></html>"#
        );
        let options = TransformOptions::default();

        let once = sanitize(html, &options).expect("first pass");
        let twice = sanitize(&once, &options).expect("second pass");

        assert_eq!(once, twice);
        assert_eq!(once.matches("<!DOCTYPE html>").count(), 1);
        assert_eq!(once.matches(VERSION_META_NAME).count(), 1);
        assert_eq!(once.matches(r#"id="truthorigin-snapshot""#).count(), 1);
        assert!(once.contains(r#"content="fresh""#));
        assert!(!once.contains("stale"));
    }

    #[test]
    fn fragment_is_rejected_and_passed_through() {
        let fragment = "<div><p>unclosed <span>";
        assert!(matches!(
            sanitize(fragment, &TransformOptions::default()),
            Err(TransformError::MissingHead)
        ));
        assert_eq!(
            sanitize_or_passthrough(fragment, &TransformOptions::default()),
            fragment
        );
    }

    #[test]
    fn head_without_body_is_rejected() {
        let html = "<html><head><title>x</title></head></html>";
        assert!(matches!(
            sanitize(html, &TransformOptions::default()),
            Err(TransformError::MissingBody)
        ));
    }

    #[test]
    fn meta_allowlist() {
        let some = |v: &str| Some(v.to_string());
        assert!(is_allowed_meta(some("utf-8"), None, None));
        assert!(is_allowed_meta(None, some("refresh"), None));
        assert!(is_allowed_meta(None, None, some("Viewport")));
        assert!(!is_allowed_meta(None, None, some("description")));
        assert!(!is_allowed_meta(some(""), some(""), None));
    }

    #[test]
    fn strips_leading_doctype_only() {
        assert_eq!(strip_doctype("  <!DOCTYPE html>\n<html>"), "<html>");
        assert_eq!(strip_doctype("<html>"), "<html>");
        assert_eq!(strip_doctype("<!-- c --><html>"), "<!-- c --><html>");
        assert_eq!(strip_doctype("\u{feff}<!DOCTYPE html>\n<html>"), "<html>");
    }

    #[test]
    fn byte_order_mark_does_not_duplicate_doctype() {
        let html = "\u{feff}<!DOCTYPE html>\n<html><head></head><body></body></html>";
        let sanitized = sanitize(html, &without_validator()).expect("sanitize");
        assert_eq!(sanitized.matches("<!DOCTYPE").count(), 1);
        assert!(sanitized.starts_with("<!DOCTYPE html>\n<html>"));
    }

    #[test]
    fn structured_data_and_canonical_match_case_insensitively() {
        let html = concat!(
            r#"<html><head><script type="Application/LD+JSON">{"@type":"Thing"}</script>"#,
            r#"<script type="module" src="/app.js"></script>"#,
            r#"<link rel="Canonical" href="https://old.example/"><link rel="icon" href="/f.ico">"#,
            r#"</head><body></body></html>"#
        );

        let sanitized = sanitize(html, &without_validator()).expect("sanitize");

        assert!(!sanitized.contains(r#"{"@type":"Thing"}"#));
        assert!(!sanitized.contains("Canonical"));
        assert!(sanitized.contains(r#"<script type="module" src="/app.js"></script>"#));
        assert!(sanitized.contains(r#"<link rel="icon" href="/f.ico">"#));
    }
}
