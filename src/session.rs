//! One snapshot check: wait for readiness, capture, deliver.

use crate::controls::SnapshotControls;
use crate::page::PageHost;
use crate::readiness::{wait_for_signal, WaitError, PROCESSED_ATTRIBUTE};
use crate::reporter::SnapshotReporter;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

/// Query parameter whose presence asks the page for a snapshot.
pub const SNAPSHOT_QUERY_KEY: &str = "truthseo-snapshot";

/// Whether `url` carries the snapshot query flag.
pub fn snapshot_requested(url: &Url) -> bool {
    url.query_pairs().any(|(key, _)| key == SNAPSHOT_QUERY_KEY)
}

/// How a snapshot check ended.
#[derive(Debug)]
pub enum CheckOutcome {
    /// The page was not loaded for a snapshot.
    NotRequested,
    /// The snapshot reached the parent.
    Delivered,
    /// The snapshot was captured but the parent could not take it.
    DeliveryFailed,
    /// No snapshot was captured.
    Aborted(WaitError),
}

impl CheckOutcome {
    /// True when a snapshot was posted.
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

/// Everything a snapshot check needs, cheap to clone into spawned tasks.
#[derive(Clone)]
pub struct SnapshotSession {
    page: Arc<dyn PageHost>,
    controls: Arc<SnapshotControls>,
    reporter: SnapshotReporter,
}

impl SnapshotSession {
    /// Session over `page` configured by `controls`.
    pub fn new(page: Arc<dyn PageHost>, controls: SnapshotControls) -> Self {
        let reporter =
            SnapshotReporter::new(controls.target_origin().clone(), controls.transform());
        Self {
            page,
            controls: Arc::new(controls),
            reporter,
        }
    }

    /// Page the session runs against.
    pub fn page(&self) -> &Arc<dyn PageHost> {
        &self.page
    }

    /// Runs a check if the current location asks for a snapshot.
    pub async fn run_check(&self) -> CheckOutcome {
        let location = self.page.location();
        if !snapshot_requested(&location) {
            debug!(url = %location, "snapshot not requested");
            return CheckOutcome::NotRequested;
        }

        let signal = self.controls.signal();
        let page = self.page.as_ref();
        let source = match wait_for_signal(page, &signal, self.controls.wait_timing()).await {
            Ok(source) => source,
            Err(err) => {
                warn!(error = %err, path = location.path(), "no snapshot taken");
                return CheckOutcome::Aborted(err);
            }
        };
        debug!(?source, %signal, "route ready");

        let raw = page.document_html();
        if signal.tracks_processed() {
            self.mark_processed(&signal.selector());
        }
        let html = self.reporter.prepare(raw);
        if self.reporter.deliver(page, html) {
            CheckOutcome::Delivered
        } else {
            CheckOutcome::DeliveryFailed
        }
    }

    // Hide first: once the attribute is set the selector stops matching.
    fn mark_processed(&self, selector: &str) {
        let marked = self
            .page
            .set_attribute(selector, "style", "display: none")
            .and_then(|_| self.page.set_attribute(selector, PROCESSED_ATTRIBUTE, "true"));
        if let Err(err) = marked {
            warn!(error = %err, selector, "failed to mark readiness signal processed");
        }
    }
}
