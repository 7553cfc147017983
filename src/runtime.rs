//! Agent bootstrap: wiring the snapshot check, message dispatcher and route restorer to a page.

use crate::bridge::{DispatcherHandle, MessageDispatcher};
use crate::controls::{Cli, SnapshotControls};
use crate::page::{PageError, PageHost};
use crate::restore::restore_route;
use crate::session::{CheckOutcome, SnapshotSession};
use futures_util::future::join_all;
use std::sync::Arc;
use tokio::runtime::Builder;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type DynError = Box<dyn std::error::Error + Send + Sync>;

/// Prefix of the comment the agent leaves in the document element.
pub const SCRIPT_VERSION_COMMENT: &str = "truthseo-snapshot-script-version";

/// A running agent attached to one page.
pub struct SnapshotAgent {
    session: SnapshotSession,
    initial_check: Option<JoinHandle<CheckOutcome>>,
    dispatcher: Option<DispatcherHandle>,
    restorer: Option<JoinHandle<Result<Option<String>, PageError>>>,
}

impl SnapshotAgent {
    /// Attaches to `page`. Must be called from within a tokio runtime.
    ///
    /// In order: starts the snapshot check, registers the message dispatcher, leaves the
    /// script-version comment and starts the route restorer.
    pub fn start(page: Arc<dyn PageHost>, controls: SnapshotControls) -> Self {
        let recheck_delay = controls.recheck_delay();
        let restore_delay = controls.restore_delay();
        let script_version = controls.script_version();
        let session = SnapshotSession::new(page, controls);

        let initial_check = {
            let session = session.clone();
            tokio::spawn(async move { session.run_check().await })
        };
        let dispatcher = MessageDispatcher::register(session.clone(), recheck_delay);

        let comment = format!("{SCRIPT_VERSION_COMMENT}: {script_version}");
        if let Err(err) = session.page().append_comment(&comment) {
            warn!(error = %err, "failed to append script version comment");
        }

        let restorer = {
            let page = Arc::clone(session.page());
            tokio::spawn(async move { restore_route(page.as_ref(), restore_delay).await })
        };
        info!(version = script_version, "snapshot agent started");

        Self {
            session,
            initial_check: Some(initial_check),
            dispatcher,
            restorer: Some(restorer),
        }
    }

    /// Session shared by every check this agent runs.
    pub fn session(&self) -> &SnapshotSession {
        &self.session
    }

    /// Waits for the check started at load. `None` once taken or if the task died.
    pub async fn initial_check(&mut self) -> Option<CheckOutcome> {
        let handle = self.initial_check.take()?;
        match handle.await {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                warn!(error = %err, "initial snapshot check failed");
                None
            }
        }
    }

    /// Waits for the route restorer. `None` when nothing was restored.
    pub async fn restored_route(&mut self) -> Option<String> {
        let handle = self.restorer.take()?;
        match handle.await {
            Ok(Ok(route)) => route,
            Ok(Err(err)) => {
                warn!(error = %err, "route restore failed");
                None
            }
            Err(err) => {
                warn!(error = %err, "route restore task failed");
                None
            }
        }
    }

    /// Stops the dispatcher and cancels whatever is still pending.
    pub async fn shutdown(mut self) {
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.shutdown().await;
        }
        let pending: Vec<JoinHandle<()>> = [
            self.initial_check.take().map(abort_and_forget),
            self.restorer.take().map(abort_and_forget),
        ]
        .into_iter()
        .flatten()
        .collect();
        join_all(pending).await;
        debug!("snapshot agent stopped");
    }
}

fn abort_and_forget<T: Send + 'static>(handle: JoinHandle<T>) -> JoinHandle<()> {
    handle.abort();
    tokio::spawn(async move {
        // cancelled tasks report a JoinError
        let _ = handle.await;
    })
}

/// Runs the agent on `page` until the load-time snapshot check finishes, on a current-thread
/// runtime.
pub fn run(cli: &Cli, page: Arc<dyn PageHost>) -> Result<CheckOutcome, DynError> {
    let controls = cli.build_controls()?;
    let rt = Builder::new_current_thread().enable_all().build()?;
    let outcome = rt.block_on(async move {
        let mut agent = SnapshotAgent::start(page, controls);
        let outcome = agent.initial_check().await;
        agent.restored_route().await;
        agent.shutdown().await;
        outcome
    });
    outcome.ok_or_else(|| "initial snapshot check did not complete".into())
}
