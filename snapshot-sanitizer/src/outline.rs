//! Read-only scan of a captured document using `lol_html`.
//!
//! The rewrite pass streams, so anything it needs to know about content that appears later in
//! the document (a `<base>` tag, the snapshot-ready element in the body) is collected here first.

use crate::SNAPSHOT_READY_TAG;
use lol_html::errors::RewritingError;
use lol_html::{element, HtmlRewriter, OutputSink, Settings};
use scraper::{Html, Selector};
use std::sync::{Arc, Mutex, PoisonError};

/// Structural facts about a document gathered before rewriting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct DocumentOutline {
    pub(crate) has_head: bool,
    pub(crate) has_body: bool,
    pub(crate) has_base: bool,
    /// Trimmed inner markup of the first snapshot-ready element, when it has any.
    pub(crate) ready_content: Option<String>,
}

pub(crate) fn scan(html: &str) -> Result<DocumentOutline, RewritingError> {
    let state = Arc::new(Mutex::new(DocumentOutline::default()));
    let head_state = Arc::clone(&state);
    let body_state = Arc::clone(&state);
    let base_state = Arc::clone(&state);

    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: vec![
                element!("head", move |_el| {
                    lock(&head_state).has_head = true;
                    Ok(())
                }),
                element!("body", move |_el| {
                    lock(&body_state).has_body = true;
                    Ok(())
                }),
                element!("head base", move |_el| {
                    lock(&base_state).has_base = true;
                    Ok(())
                }),
            ],
            ..Settings::default()
        },
        NoopSink,
    );
    rewriter.write(html.as_bytes())?;
    rewriter.end()?;

    let mut outline = lock(&state).clone();
    outline.ready_content = ready_content(html);
    Ok(outline)
}

// Inner markup is re-serialized from a parsed tree; the streaming rewriter cannot hand back the
// children of an element as a string.
fn ready_content(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse(SNAPSHOT_READY_TAG).ok()?;
    let element = document.select(&selector).next()?;
    let inner = element.inner_html();
    let trimmed = inner.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn lock(state: &Mutex<DocumentOutline>) -> std::sync::MutexGuard<'_, DocumentOutline> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

struct NoopSink;

impl OutputSink for NoopSink {
    fn handle_chunk(&mut self, _chunk: &[u8]) {}
}
