#![warn(missing_docs)]
//! Core library for the TruthSEO snapshot agent.
//!
//! The agent waits for a single-page application to signal that a route is rendered, captures
//! the document, optionally sanitizes it, and posts it to the embedding frame. It also lets the
//! parent drive client-side navigation and unwraps disguised deep links on load.

pub mod bridge;
pub mod controls;
pub mod freshness;
pub mod manifest;
pub mod memory;
pub mod messages;
pub mod observer;
pub mod page;
pub mod readiness;
pub mod reporter;
pub mod restore;
pub mod runtime;
pub mod session;

pub use bridge::{apply_navigation, DispatcherHandle, MessageDispatcher};
pub use controls::{Cli, Profile, SnapshotControls, SCRIPT_VERSION};
pub use freshness::{check_freshness, FreshnessError, FreshnessVerdict};
pub use manifest::SnapshotRecord;
pub use memory::{MemoryPage, ParentFrame, PostedMessage};
pub use messages::{FrameMessage, NavigateRequest, TargetOrigin};
pub use page::{PageError, PageHost, ReadyState};
pub use readiness::{wait_for_signal, ReadinessSignal, SignalSource, WaitError, WaitTiming};
pub use reporter::SnapshotReporter;
pub use restore::{disguised_route, restore_route, ROUTE_QUERY_KEY};
pub use runtime::{run as run_agent, SnapshotAgent};
pub use session::{CheckOutcome, SnapshotSession, SNAPSHOT_QUERY_KEY};
pub use snapshot_sanitizer::{sanitize, sanitize_or_passthrough, TransformError, TransformOptions};

/// Installs the stderr `tracing` subscriber used by the binaries.
///
/// `RUST_LOG` overrides `default_directive`.
pub fn init_tracing(default_directive: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    // a subscriber installed earlier (tests, embedding hosts) stays in place
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
