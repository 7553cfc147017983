//! Inbound message handling: parent-driven navigation and follow-up snapshot checks.

use crate::messages::NavigateRequest;
use crate::page::{path_and_query, PageError, PageHost};
use crate::session::SnapshotSession;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Drives the in-page router to the requested path.
///
/// Returns `true` when history changed. Non-string targets and the path already shown are
/// ignored.
pub fn apply_navigation(page: &dyn PageHost, request: &NavigateRequest) -> Result<bool, PageError> {
    let Some(target) = request.target_path.as_deref() else {
        debug!("navigate request without a string target");
        return Ok(false);
    };
    let current = path_and_query(&page.location());
    if target == current {
        debug!(path = target, "already on requested path");
        return Ok(false);
    }
    page.push_state(target)?;
    page.dispatch_popstate();
    info!(from = %current, to = target, "navigated");
    Ok(true)
}

/// Routes every inbound message of a page.
pub struct MessageDispatcher;

impl MessageDispatcher {
    /// Starts consuming the page's inbound stream.
    ///
    /// `None` when another dispatcher already owns the stream.
    pub fn register(session: SnapshotSession, recheck_delay: Duration) -> Option<DispatcherHandle> {
        let Some(mut inbound) = session.page().take_inbound_messages() else {
            warn!("inbound messages already claimed, dispatcher not registered");
            return None;
        };
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut rechecks = JoinSet::new();
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    message = inbound.recv() => {
                        let Some(payload) = message else {
                            debug!("inbound stream closed");
                            break;
                        };
                        let Some(request) = NavigateRequest::from_value(&payload) else {
                            continue;
                        };
                        if let Err(err) = apply_navigation(session.page().as_ref(), &request) {
                            warn!(error = %err, "navigate request rejected");
                        }
                        let session = session.clone();
                        rechecks.spawn(async move {
                            tokio::time::sleep(recheck_delay).await;
                            session.run_check().await
                        });
                    }
                    Some(done) = rechecks.join_next() => {
                        if let Err(err) = done {
                            warn!(error = %err, "snapshot recheck task failed");
                        }
                    }
                }
            }
            rechecks.shutdown().await;
        });

        Some(DispatcherHandle {
            shutdown: Some(shutdown_tx),
            task,
        })
    }
}

/// Owner of a running dispatcher.
pub struct DispatcherHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Stops the dispatcher, cancelling pending rechecks, and waits for it to exit.
    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            // the loop may already have ended on its own
            let _ = shutdown.send(());
        }
        if let Err(err) = (&mut self.task).await {
            warn!(error = %err, "dispatcher task failed");
        }
    }

    /// Whether the dispatcher loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controls::SnapshotControls;
    use crate::memory::MemoryPage;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::time::{sleep, Instant};
    use tokio::sync::broadcast::error::TryRecvError;

    const READY: &str = "<html><head><meta name=\"truthseo-snapshot-ready\"></head>\
                         <body></body></html>";

    #[test]
    fn navigates_once_to_new_path() {
        let (page, _parent) = MemoryPage::new("https://app.test/home", READY).unwrap();
        let request = NavigateRequest {
            target_path: Some("/about".into()),
        };
        assert!(apply_navigation(page.as_ref(), &request).unwrap());
        assert_eq!(page.location().path(), "/about");
        assert_eq!(page.popstates().len(), 1);
    }

    #[test]
    fn same_path_or_missing_target_is_ignored() {
        let (page, _parent) = MemoryPage::new("https://app.test/home?tab=1#x", READY).unwrap();
        let same = NavigateRequest {
            target_path: Some("/home?tab=1".into()),
        };
        assert!(!apply_navigation(page.as_ref(), &same).unwrap());
        assert!(!apply_navigation(page.as_ref(), &NavigateRequest { target_path: None }).unwrap());
        assert!(page.popstates().is_empty());
        assert_eq!(page.history().len(), 1);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn navigate_message_triggers_delayed_recheck() {
        let (page, mut parent) =
            MemoryPage::new("https://app.test/home?truthseo-snapshot", READY).unwrap();
        let session = SnapshotSession::new(page.clone(), SnapshotControls::default());
        let handle = MessageDispatcher::register(session, Duration::from_millis(50)).unwrap();

        let started = Instant::now();
        parent.navigate("/about?truthseo-snapshot").unwrap();
        let html = parent.next_snapshot().await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_millis(50));
        assert_eq!(html, READY);
        assert_eq!(page.location().path(), "/about");
        assert_eq!(page.popstates().len(), 1);

        handle.shutdown().await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn non_string_target_still_rechecks() {
        let (page, mut parent) =
            MemoryPage::new("https://app.test/home?truthseo-snapshot", READY).unwrap();
        let session = SnapshotSession::new(page.clone(), SnapshotControls::default());
        let handle = MessageDispatcher::register(session, Duration::from_millis(50)).unwrap();

        parent.post(json!({"type": "truthseo:navigate", "targetPath": 42})).unwrap();
        parent.post(json!({"type": "unrelated"})).unwrap();
        assert!(parent.next_snapshot().await.is_some());
        assert!(page.popstates().is_empty());

        sleep(Duration::from_millis(200)).await;
        assert!(parent.try_next_message().is_none());
        handle.shutdown().await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn router_hears_one_popstate_per_navigation() {
        let (page, parent) = MemoryPage::new("https://app.test/home", READY).unwrap();
        let mut router = page.subscribe_popstate();
        let session = SnapshotSession::new(page.clone(), SnapshotControls::default());
        let handle = MessageDispatcher::register(session, Duration::from_millis(50)).unwrap();

        parent.navigate("/about").unwrap();
        let location = router.recv().await.unwrap();
        assert_eq!(location.as_str(), "https://app.test/about");

        // re-sending the current path leaves the router alone
        parent.navigate("/about").unwrap();
        sleep(Duration::from_millis(100)).await;
        assert!(matches!(router.try_recv(), Err(TryRecvError::Empty)));

        handle.shutdown().await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn dispatcher_stops_when_parent_goes_away() {
        let (page, parent) = MemoryPage::new("https://app.test/", READY).unwrap();
        let session = SnapshotSession::new(page, SnapshotControls::default());
        let handle = MessageDispatcher::register(session, Duration::from_millis(50)).unwrap();
        assert!(!handle.is_finished());

        drop(parent);
        sleep(Duration::from_millis(1)).await;
        assert!(handle.is_finished());
        handle.shutdown().await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn registers_once_per_page() {
        let (page, _parent) = MemoryPage::new("https://app.test/", READY).unwrap();
        let session = SnapshotSession::new(page, SnapshotControls::default());
        let first = MessageDispatcher::register(session.clone(), Duration::ZERO).unwrap();
        assert!(MessageDispatcher::register(session, Duration::ZERO).is_none());
        first.shutdown().await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn shutdown_cancels_pending_recheck() {
        let (page, mut parent) =
            MemoryPage::new("https://app.test/?truthseo-snapshot", READY).unwrap();
        let session = SnapshotSession::new(page, SnapshotControls::default());
        let handle = MessageDispatcher::register(session, Duration::from_millis(50)).unwrap();

        parent.navigate("/next?truthseo-snapshot").unwrap();
        sleep(Duration::from_millis(10)).await;
        handle.shutdown().await;
        sleep(Duration::from_millis(100)).await;
        assert!(parent.try_next_message().is_none());
    }
}
