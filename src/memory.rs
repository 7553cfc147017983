//! Headless in-memory page host.
//!
//! The document lives as serialized markup: queries parse it with `scraper`, edits stream it
//! through `lol_html`. A [`ParentFrame`] handle plays the embedding frame, collecting what the
//! page posts and feeding it navigate requests.

use crate::messages::{FrameMessage, TargetOrigin};
use crate::observer::{MutationObserver, MutationRecord, ObserveOptions, ObserverRegistry};
use crate::page::{InboundMessages, PageError, PageHost, ReadyState};
use lol_html::html_content::ContentType;
use lol_html::{element, HtmlRewriter, Settings};
use scraper::{Html, Selector};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::debug;
use url::Url;

const POPSTATE_CAPACITY: usize = 16;

/// A message the page handed to its parent.
#[derive(Debug, Clone, PartialEq)]
pub struct PostedMessage {
    /// Structured payload as the parent receives it.
    pub payload: Value,
    /// Origin restriction the page posted with.
    pub target_origin: TargetOrigin,
}

impl PostedMessage {
    /// Snapshot markup, when this is a snapshot message.
    pub fn snapshot_html(&self) -> Option<String> {
        match serde_json::from_value::<FrameMessage>(self.payload.clone()) {
            Ok(FrameMessage::Snapshot { html }) => Some(html),
            _ => None,
        }
    }
}

struct DocumentState {
    html: String,
    location: Url,
    history: Vec<Url>,
    popstates: Vec<Url>,
}

struct ParentLink {
    origin: String,
    sender: mpsc::UnboundedSender<PostedMessage>,
    refuse_delivery: AtomicBool,
}

/// In-memory [`PageHost`].
pub struct MemoryPage {
    document: Mutex<DocumentState>,
    observers: Arc<ObserverRegistry>,
    ready: watch::Sender<ReadyState>,
    inbound: Mutex<Option<InboundMessages>>,
    parent: ParentLink,
    popstate: broadcast::Sender<Url>,
}

impl MemoryPage {
    /// Loads `html` at `url`, embedded in a parent on the same origin.
    ///
    /// The page starts out [`ReadyState::Complete`].
    pub fn new(url: &str, html: impl Into<String>) -> Result<(Arc<Self>, ParentFrame), PageError> {
        let location = parse_url(url)?;
        let parent_origin = location.origin().ascii_serialization();
        Self::build(location, html.into(), parent_origin)
    }

    /// Loads `html` at `url`, embedded in a parent served from `parent_origin`.
    pub fn with_parent_origin(
        url: &str,
        html: impl Into<String>,
        parent_origin: &str,
    ) -> Result<(Arc<Self>, ParentFrame), PageError> {
        let location = parse_url(url)?;
        let parent_origin = parse_url(parent_origin)?.origin().ascii_serialization();
        Self::build(location, html.into(), parent_origin)
    }

    fn build(
        location: Url,
        html: String,
        parent_origin: String,
    ) -> Result<(Arc<Self>, ParentFrame), PageError> {
        let (posted_tx, posted_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (ready, _) = watch::channel(ReadyState::Complete);
        let (popstate, _) = broadcast::channel(POPSTATE_CAPACITY);

        let page = Arc::new(Self {
            document: Mutex::new(DocumentState {
                html,
                history: vec![location.clone()],
                location,
                popstates: Vec::new(),
            }),
            observers: ObserverRegistry::new(),
            ready,
            inbound: Mutex::new(Some(inbound_rx)),
            parent: ParentLink {
                origin: parent_origin.clone(),
                sender: posted_tx,
                refuse_delivery: AtomicBool::new(false),
            },
            popstate,
        });
        let parent = ParentFrame {
            origin: parent_origin,
            posted: posted_rx,
            inbound: inbound_tx,
        };
        Ok((page, parent))
    }

    /// Appends `markup` as the last children of the first element matching `parent_selector`.
    pub fn insert_html(&self, parent_selector: &str, markup: &str) -> Result<bool, PageError> {
        let report = self.edit(parent_selector, Edit::Append(markup.to_string()))?;
        if let Some(tag) = report.first_tag {
            self.observers.notify(&MutationRecord::ChildList {
                nested: tag != "html",
            });
        }
        Ok(report.matched > 0)
    }

    /// Removes every element matching `selector`, returning how many were removed.
    pub fn remove_elements(&self, selector: &str) -> Result<usize, PageError> {
        let report = self.edit(selector, Edit::Remove)?;
        if report.matched > 0 {
            self.observers
                .notify(&MutationRecord::ChildList { nested: true });
        }
        Ok(report.matched)
    }

    /// Moves the document to another loading phase.
    pub fn set_ready_state(&self, state: ReadyState) {
        self.ready.send_replace(state);
    }

    /// Session history entries, oldest first.
    pub fn history(&self) -> Vec<Url> {
        self.document().history.clone()
    }

    /// Locations at which `popstate` fired, oldest first.
    pub fn popstates(&self) -> Vec<Url> {
        self.document().popstates.clone()
    }

    /// Live feed of `popstate` notifications, the hook a client-side router listens on.
    pub fn subscribe_popstate(&self) -> broadcast::Receiver<Url> {
        self.popstate.subscribe()
    }

    /// Mutation observers still connected.
    pub fn active_observers(&self) -> usize {
        self.observers.active()
    }

    /// Makes every following `post_to_parent` fail, as a detached parent would.
    pub fn refuse_delivery(&self, refuse: bool) {
        self.parent.refuse_delivery.store(refuse, Ordering::Release);
    }

    fn document(&self) -> MutexGuard<'_, DocumentState> {
        self.document.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn edit(&self, selector: &str, edit: Edit) -> Result<EditReport, PageError> {
        validate_rewrite_selector(selector)?;
        let mut document = self.document();
        let (html, report) = apply_edit(&document.html, selector, edit)?;
        document.html = html;
        Ok(report)
    }

    fn resolve_same_origin(&self, location: &Url, url: &str) -> Result<Url, PageError> {
        let resolved = location.join(url).map_err(|source| PageError::InvalidUrl {
            input: url.to_string(),
            source,
        })?;
        if resolved.origin() != location.origin() {
            return Err(PageError::CrossOrigin {
                url: resolved.to_string(),
            });
        }
        Ok(resolved)
    }
}

impl PageHost for MemoryPage {
    fn location(&self) -> Url {
        self.document().location.clone()
    }

    fn document_html(&self) -> String {
        self.document().html.clone()
    }

    fn query_exists(&self, selector: &str) -> Result<bool, PageError> {
        let parsed = Selector::parse(selector).map_err(|err| PageError::InvalidSelector {
            selector: selector.to_string(),
            reason: format!("{err:?}"),
        })?;
        let html = self.document_html();
        let document = Html::parse_document(&html);
        let found = document.select(&parsed).next().is_some();
        Ok(found)
    }

    fn set_attribute(&self, selector: &str, name: &str, value: &str) -> Result<bool, PageError> {
        let report = self.edit(
            selector,
            Edit::SetAttribute {
                name: name.to_string(),
                value: value.to_string(),
            },
        )?;
        if let Some(tag) = report.first_tag {
            self.observers.notify(&MutationRecord::Attributes {
                name: name.to_string(),
                nested: tag != "html",
            });
        }
        Ok(report.matched > 0)
    }

    fn append_comment(&self, text: &str) -> Result<(), PageError> {
        self.edit("html", Edit::Append(format!("<!--{text}-->")))?;
        self.observers
            .notify(&MutationRecord::ChildList { nested: false });
        Ok(())
    }

    fn observe(&self, options: ObserveOptions) -> MutationObserver {
        self.observers.register(options)
    }

    fn push_state(&self, url: &str) -> Result<(), PageError> {
        let mut document = self.document();
        let resolved = self.resolve_same_origin(&document.location, url)?;
        debug!(url = %resolved, "history push");
        document.history.push(resolved.clone());
        document.location = resolved;
        Ok(())
    }

    fn replace_state(&self, url: &str) -> Result<(), PageError> {
        let mut document = self.document();
        let resolved = self.resolve_same_origin(&document.location, url)?;
        debug!(url = %resolved, "history replace");
        if let Some(current) = document.history.last_mut() {
            *current = resolved.clone();
        }
        document.location = resolved;
        Ok(())
    }

    fn dispatch_popstate(&self) {
        let location = {
            let mut document = self.document();
            let location = document.location.clone();
            document.popstates.push(location.clone());
            location
        };
        // no router listening is fine
        let _ = self.popstate.send(location);
    }

    fn ready_state(&self) -> watch::Receiver<ReadyState> {
        self.ready.subscribe()
    }

    fn post_to_parent(
        &self,
        message: &FrameMessage,
        target_origin: &TargetOrigin,
    ) -> Result<(), PageError> {
        let payload = serde_json::to_value(message).map_err(PageError::Serialize)?;
        if self.parent.refuse_delivery.load(Ordering::Acquire) {
            return Err(PageError::ParentUnavailable);
        }
        if !target_origin.admits(&self.parent.origin) {
            debug!(
                target = %target_origin,
                parent = %self.parent.origin,
                "parent origin not admitted, message dropped"
            );
            return Ok(());
        }
        self.parent
            .sender
            .send(PostedMessage {
                payload,
                target_origin: target_origin.clone(),
            })
            .map_err(|_| PageError::ParentUnavailable)
    }

    fn take_inbound_messages(&self) -> Option<InboundMessages> {
        self.inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// The embedding frame's end of a [`MemoryPage`].
pub struct ParentFrame {
    origin: String,
    posted: mpsc::UnboundedReceiver<PostedMessage>,
    inbound: mpsc::UnboundedSender<Value>,
}

impl ParentFrame {
    /// Serialized origin of the parent.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Posts an arbitrary payload into the page.
    pub fn post(&self, payload: Value) -> Result<(), PageError> {
        self.inbound.send(payload).map_err(|_| PageError::Closed)
    }

    /// Asks the page to show `target_path`.
    pub fn navigate(&self, target_path: &str) -> Result<(), PageError> {
        let message = FrameMessage::Navigate {
            target_path: target_path.to_string(),
        };
        self.post(serde_json::to_value(&message).map_err(PageError::Serialize)?)
    }

    /// Waits for the page's next message; `None` once the page is gone.
    pub async fn next_message(&mut self) -> Option<PostedMessage> {
        self.posted.recv().await
    }

    /// Returns a message already delivered, without waiting.
    pub fn try_next_message(&mut self) -> Option<PostedMessage> {
        self.posted.try_recv().ok()
    }

    /// Waits for the next snapshot, skipping other messages.
    pub async fn next_snapshot(&mut self) -> Option<String> {
        while let Some(message) = self.next_message().await {
            if let Some(html) = message.snapshot_html() {
                return Some(html);
            }
        }
        None
    }
}

enum Edit {
    Append(String),
    SetAttribute { name: String, value: String },
    Remove,
}

#[derive(Default)]
struct EditReport {
    matched: usize,
    first_tag: Option<String>,
}

fn apply_edit(html: &str, selector: &str, edit: Edit) -> Result<(String, EditReport), PageError> {
    let report = Arc::new(Mutex::new(EditReport::default()));
    let handler_report = Arc::clone(&report);

    let mut output = Vec::with_capacity(html.len() + 64);
    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: vec![element!(selector, move |el| {
                let mut report = handler_report
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                let first = report.matched == 0;
                report.matched += 1;
                if first {
                    report.first_tag = Some(el.tag_name());
                }
                match &edit {
                    Edit::Append(markup) if first => el.append(markup, ContentType::Html),
                    Edit::SetAttribute { name, value } if first => el.set_attribute(name, value)?,
                    Edit::Remove => el.remove(),
                    _ => {}
                }
                Ok(())
            })],
            ..Settings::default()
        },
        |chunk: &[u8]| output.extend_from_slice(chunk),
    );
    rewriter.write(html.as_bytes()).map_err(PageError::Rewrite)?;
    rewriter.end().map_err(PageError::Rewrite)?;

    let report = std::mem::take(&mut *report.lock().unwrap_or_else(PoisonError::into_inner));
    Ok((String::from_utf8_lossy(&output).into_owned(), report))
}

// The rewriter supports a narrower selector grammar than `scraper`; reject what it cannot parse
// before building handlers from it.
fn validate_rewrite_selector(selector: &str) -> Result<(), PageError> {
    selector
        .parse::<lol_html::Selector>()
        .map(|_| ())
        .map_err(|err| PageError::InvalidSelector {
            selector: selector.to_string(),
            reason: err.to_string(),
        })
}

fn parse_url(url: &str) -> Result<Url, PageError> {
    Url::parse(url).map_err(|source| PageError::InvalidUrl {
        input: url.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const DOC: &str = "<html><head></head><body><div id=\"app\"></div></body></html>";

    #[test]
    fn queries_and_inserts() {
        let (page, _parent) = MemoryPage::new("https://site.test/", DOC).unwrap();
        assert!(!page.query_exists("#app p").unwrap());

        assert!(page.insert_html("#app", "<p>rendered</p>").unwrap());
        assert!(page.query_exists("#app p").unwrap());
        assert_eq!(
            page.document_html(),
            "<html><head></head><body><div id=\"app\"><p>rendered</p></div></body></html>"
        );
        assert!(!page.insert_html("#missing", "<p>x</p>").unwrap());
    }

    #[test]
    fn sets_attribute_on_first_match_only() {
        let (page, _parent) = MemoryPage::new(
            "https://site.test/",
            "<html><body><i class=\"a\"></i><i class=\"a\"></i></body></html>",
        )
        .unwrap();
        assert!(page.set_attribute("i.a", "data-x", "1").unwrap());
        assert_eq!(
            page.document_html(),
            "<html><body><i class=\"a\" data-x=\"1\"></i><i class=\"a\"></i></body></html>"
        );
    }

    #[test]
    fn removes_all_matches() {
        let (page, _parent) = MemoryPage::new(
            "https://site.test/",
            "<html><body><b>1</b><b>2</b><i>3</i></body></html>",
        )
        .unwrap();
        assert_eq!(page.remove_elements("b").unwrap(), 2);
        assert_eq!(page.document_html(), "<html><body><i>3</i></body></html>");
    }

    #[test]
    fn invalid_selectors_are_errors() {
        let (page, _parent) = MemoryPage::new("https://site.test/", DOC).unwrap();
        assert!(matches!(
            page.query_exists("div[").unwrap_err(),
            PageError::InvalidSelector { .. }
        ));
        assert!(matches!(
            page.insert_html("div[", "<p></p>").unwrap_err(),
            PageError::InvalidSelector { .. }
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn mutations_reach_observers() {
        let (page, _parent) = MemoryPage::new("https://site.test/", DOC).unwrap();
        let mut observer = page.observe(ObserveOptions::child_list_subtree());
        page.insert_html("#app", "<span></span>").unwrap();
        assert_eq!(
            observer.next_record().await,
            Some(MutationRecord::ChildList { nested: true })
        );
        assert_eq!(page.active_observers(), 1);
        drop(observer);
        assert_eq!(page.active_observers(), 0);
    }

    #[test]
    fn comment_lands_at_end_of_document_element() {
        let (page, _parent) = MemoryPage::new("https://site.test/", DOC).unwrap();
        page.append_comment("marker: 1").unwrap();
        assert!(page.document_html().ends_with("</body><!--marker: 1--></html>"));
    }

    #[test]
    fn history_stays_on_origin() {
        let (page, _parent) = MemoryPage::new("https://site.test/home", DOC).unwrap();
        page.push_state("/about?x=1").unwrap();
        assert_eq!(page.location().as_str(), "https://site.test/about?x=1");
        page.replace_state("/team#top").unwrap();
        assert_eq!(
            page.history()
                .iter()
                .map(Url::as_str)
                .collect::<Vec<_>>(),
            vec!["https://site.test/home", "https://site.test/team#top"]
        );
        assert!(matches!(
            page.push_state("https://elsewhere.test/").unwrap_err(),
            PageError::CrossOrigin { .. }
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn parent_receives_admitted_posts_only() {
        let (page, mut parent) =
            MemoryPage::with_parent_origin("https://site.test/", DOC, "https://parent.test")
                .unwrap();
        let message = FrameMessage::Snapshot { html: "<html></html>".into() };

        page.post_to_parent(&message, &TargetOrigin::Exact("https://other.test".into()))
            .unwrap();
        assert!(parent.try_next_message().is_none());

        page.post_to_parent(&message, &TargetOrigin::Any).unwrap();
        assert_eq!(parent.next_snapshot().await.as_deref(), Some("<html></html>"));
    }

    #[test]
    fn refused_delivery_is_an_error() {
        let (page, _parent) = MemoryPage::new("https://site.test/", DOC).unwrap();
        page.refuse_delivery(true);
        let message = FrameMessage::Snapshot { html: String::new() };
        assert!(matches!(
            page.post_to_parent(&message, &TargetOrigin::Any).unwrap_err(),
            PageError::ParentUnavailable
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn inbound_stream_is_handed_out_once() {
        let (page, parent) = MemoryPage::new("https://site.test/", DOC).unwrap();
        let mut inbound = page.take_inbound_messages().expect("first take");
        assert!(page.take_inbound_messages().is_none());

        parent.navigate("/about").unwrap();
        assert_eq!(
            inbound.recv().await,
            Some(json!({"type": "truthseo:navigate", "targetPath": "/about"}))
        );
    }
}
