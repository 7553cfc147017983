//! The seam between the agent and the page it runs inside.

use crate::messages::{FrameMessage, TargetOrigin};
use crate::observer::{MutationObserver, ObserveOptions};
use serde_json::Value;
use std::error::Error;
use std::fmt;
use tokio::sync::{mpsc, watch};
use url::Url;

/// Document loading phase, mirroring `document.readyState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Still parsing.
    Loading,
    /// Parsed, subresources pending.
    Interactive,
    /// Load finished.
    Complete,
}

/// Stream of raw message payloads posted to the page by other frames.
pub type InboundMessages = mpsc::UnboundedReceiver<Value>;

/// Everything the agent needs from its hosting page.
///
/// Selectors are CSS selectors. Mutating methods act on the first element that matches and
/// report changes to the host's mutation observers.
pub trait PageHost: Send + Sync {
    /// Current location, including query and fragment.
    fn location(&self) -> Url;

    /// Serialized document element (`outerHTML`).
    fn document_html(&self) -> String;

    /// Whether any element matches `selector`.
    fn query_exists(&self, selector: &str) -> Result<bool, PageError>;

    /// Sets an attribute on the first element matching `selector`; `false` when nothing matched.
    fn set_attribute(&self, selector: &str, name: &str, value: &str) -> Result<bool, PageError>;

    /// Appends an HTML comment as the last child of the document element.
    fn append_comment(&self, text: &str) -> Result<(), PageError>;

    /// Starts observing mutations of the document.
    fn observe(&self, options: ObserveOptions) -> MutationObserver;

    /// Pushes a same-origin URL onto the session history without reloading.
    fn push_state(&self, url: &str) -> Result<(), PageError>;

    /// Replaces the current history entry without reloading.
    fn replace_state(&self, url: &str) -> Result<(), PageError>;

    /// Fires a `popstate` notification so the client-side router re-reads the location.
    fn dispatch_popstate(&self);

    /// Watches the document's ready state.
    fn ready_state(&self) -> watch::Receiver<ReadyState>;

    /// Posts `message` to the parent frame.
    ///
    /// A parent whose origin `target_origin` does not admit silently never receives it; only
    /// failures to serialize or hand off the message are errors.
    fn post_to_parent(
        &self,
        message: &FrameMessage,
        target_origin: &TargetOrigin,
    ) -> Result<(), PageError>;

    /// Hands out the inbound message stream. Only the first caller gets it.
    fn take_inbound_messages(&self) -> Option<InboundMessages>;
}

/// Errors surfaced by page hosts.
#[derive(Debug)]
pub enum PageError {
    /// The selector could not be parsed.
    InvalidSelector {
        /// Offending selector.
        selector: String,
        /// Parser diagnostic.
        reason: String,
    },
    /// A URL could not be resolved against the current location.
    InvalidUrl {
        /// URL as given.
        input: String,
        /// Parse failure.
        source: url::ParseError,
    },
    /// History entries must stay on the page's origin.
    CrossOrigin {
        /// Resolved URL that left the origin.
        url: String,
    },
    /// The document rewriter failed.
    Rewrite(lol_html::errors::RewritingError),
    /// The message could not be serialized.
    Serialize(serde_json::Error),
    /// The parent frame is no longer reachable.
    ParentUnavailable,
    /// The page was torn down.
    Closed,
}

impl fmt::Display for PageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSelector { selector, reason } => {
                write!(f, "invalid selector `{selector}`: {reason}")
            }
            Self::InvalidUrl { input, source } => write!(f, "invalid url `{input}`: {source}"),
            Self::CrossOrigin { url } => write!(f, "history url {url} is not same-origin"),
            Self::Rewrite(err) => write!(f, "document rewrite error: {err}"),
            Self::Serialize(err) => write!(f, "message serialization error: {err}"),
            Self::ParentUnavailable => write!(f, "parent frame unavailable"),
            Self::Closed => write!(f, "page closed"),
        }
    }
}

impl Error for PageError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidUrl { source, .. } => Some(source),
            Self::Rewrite(err) => Some(err),
            Self::Serialize(err) => Some(err),
            Self::InvalidSelector { .. }
            | Self::CrossOrigin { .. }
            | Self::ParentUnavailable
            | Self::Closed => None,
        }
    }
}

/// `pathname + search` of a location, the form routers compare against.
pub fn path_and_query(url: &Url) -> String {
    match url.query() {
        Some(query) if !query.is_empty() => format!("{}?{query}", url.path()),
        _ => url.path().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_and_query_drops_origin_and_fragment() {
        let url = Url::parse("https://example.com/docs/intro?tab=2#setup").unwrap();
        assert_eq!(path_and_query(&url), "/docs/intro?tab=2");
        let bare = Url::parse("https://example.com").unwrap();
        assert_eq!(path_and_query(&bare), "/");
        let empty_query = Url::parse("https://example.com/a?").unwrap();
        assert_eq!(path_and_query(&empty_query), "/a");
    }
}
