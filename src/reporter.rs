//! Serializes the document and hands it to the embedding frame.

use crate::messages::{FrameMessage, TargetOrigin};
use crate::page::PageHost;
use snapshot_sanitizer::{sanitize_or_passthrough, TransformOptions};
use tracing::{error, info, warn};

/// Delivers snapshot payloads to the parent frame.
#[derive(Debug, Clone, Default)]
pub struct SnapshotReporter {
    target_origin: TargetOrigin,
    transform: Option<TransformOptions>,
}

impl SnapshotReporter {
    /// Reporter posting to `target_origin`, sanitizing first when `transform` is set.
    pub fn new(target_origin: TargetOrigin, transform: Option<TransformOptions>) -> Self {
        Self {
            target_origin,
            transform,
        }
    }

    /// Origin restriction used for every post.
    pub fn target_origin(&self) -> &TargetOrigin {
        &self.target_origin
    }

    /// Markup as it will be posted.
    pub fn prepare(&self, raw: String) -> String {
        match &self.transform {
            Some(options) => sanitize_or_passthrough(&raw, options),
            None => raw,
        }
    }

    /// Posts `html` to the parent. Failures are logged and reported as `false`, never retried.
    pub fn deliver(&self, page: &dyn PageHost, html: String) -> bool {
        if self.target_origin.is_wildcard() {
            warn!("posting snapshot with wildcard target origin");
        }
        let length = html.len();
        let message = FrameMessage::Snapshot { html };
        match page.post_to_parent(&message, &self.target_origin) {
            Ok(()) => {
                info!(bytes = length, target = %self.target_origin, "snapshot delivered");
                true
            }
            Err(err) => {
                error!(error = %err, "failed to deliver snapshot");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryPage;
    use pretty_assertions::assert_eq;

    const DOC: &str = "<html><head><title>T</title></head><body></body></html>";

    #[test]
    fn passthrough_without_transform() {
        let reporter = SnapshotReporter::default();
        assert_eq!(reporter.prepare(DOC.to_string()), DOC);
    }

    #[test]
    fn sanitizes_when_configured() {
        let reporter = SnapshotReporter::new(
            TargetOrigin::Any,
            Some(TransformOptions {
                snapshot_version: 3,
                inject_validator: false,
            }),
        );
        let prepared = reporter.prepare(DOC.to_string());
        assert!(prepared.starts_with("<!DOCTYPE html>\n"));
        assert!(!prepared.contains("<title>"));
        assert!(prepared.contains("<meta name=\"truthseo:snapshot-version\" content=\"3\">"));
    }

    #[test]
    fn transform_failure_passes_input_through() {
        let reporter = SnapshotReporter::new(TargetOrigin::Any, Some(TransformOptions::default()));
        assert_eq!(reporter.prepare("<p>bare</p>".to_string()), "<p>bare</p>");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn delivers_snapshot_message() {
        let (page, mut parent) = MemoryPage::new("https://app.test/", DOC).unwrap();
        let reporter = SnapshotReporter::default();
        assert!(reporter.deliver(page.as_ref(), "<html></html>".into()));
        assert_eq!(parent.next_snapshot().await.as_deref(), Some("<html></html>"));
    }

    #[test]
    fn delivery_failure_is_swallowed() {
        let (page, _parent) = MemoryPage::new("https://app.test/", DOC).unwrap();
        page.refuse_delivery(true);
        assert!(!SnapshotReporter::default().deliver(page.as_ref(), "<html></html>".into()));
    }
}
