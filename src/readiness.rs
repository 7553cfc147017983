//! Waiting for the application to declare a route fully rendered.
//!
//! The wait checks once up front, then races a child-list mutation observer, a fixed poll and a
//! deadline. The first branch to settle wins; the guard tears the observer down exactly once
//! whichever way the race ends.

use crate::observer::{MutationObserver, MutationRecord, ObserveOptions};
use crate::page::{PageError, PageHost};
use std::error::Error;
use std::fmt;
use std::time::Duration;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::debug;

/// Give up on the signal after this long.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);
/// Period of the fallback poll.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Attribute set on an element signal once a snapshot was taken for it.
pub const PROCESSED_ATTRIBUTE: &str = "data-truthseo-processed";

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// The DOM node whose presence means "rendered".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessSignal {
    /// A custom element, only counted until it is marked processed.
    Element {
        /// Element tag name.
        tag: String,
    },
    /// A `<meta name=..>` tag.
    Meta {
        /// Value of the `name` attribute.
        name: String,
    },
}

impl ReadinessSignal {
    /// CSS selector matching an unconsumed signal.
    pub fn selector(&self) -> String {
        match self {
            Self::Element { tag } => format!("{tag}:not([{PROCESSED_ATTRIBUTE}=\"true\"])"),
            Self::Meta { name } => format!("meta[name=\"{name}\"]"),
        }
    }

    /// Whether the signal gets marked processed after a capture.
    pub fn tracks_processed(&self) -> bool {
        matches!(self, Self::Element { .. })
    }
}

impl fmt::Display for ReadinessSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Element { tag } => write!(f, "<{tag}>"),
            Self::Meta { name } => write!(f, "<meta name=\"{name}\">"),
        }
    }
}

/// Deadline and poll period of a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTiming {
    /// Total time allowed.
    pub timeout: Duration,
    /// Poll period; clamped to at least one millisecond.
    pub poll_interval: Duration,
}

impl Default for WaitTiming {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Which branch of the race found the signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalSource {
    /// Already present when the wait started.
    Immediate,
    /// Seen right after a child-list mutation.
    Observer,
    /// Seen by the fallback poll.
    Poll,
}

/// Why a wait ended without a signal.
#[derive(Debug)]
pub enum WaitError {
    /// Nothing matched before the deadline.
    TimedOut {
        /// Selector that never matched.
        selector: String,
        /// Time spent waiting.
        waited: Duration,
    },
    /// The page could not evaluate the signal.
    Page(PageError),
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimedOut { selector, waited } => write!(
                f,
                "readiness signal `{selector}` not found within {}ms",
                waited.as_millis()
            ),
            Self::Page(err) => write!(f, "readiness check failed: {err}"),
        }
    }
}

impl Error for WaitError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::TimedOut { .. } => None,
            Self::Page(err) => Some(err),
        }
    }
}

impl From<PageError> for WaitError {
    fn from(err: PageError) -> Self {
        Self::Page(err)
    }
}

/// Owns the observer for the duration of a race.
struct RaceGuard {
    observer: Option<MutationObserver>,
}

impl RaceGuard {
    fn new(observer: MutationObserver) -> Self {
        Self {
            observer: Some(observer),
        }
    }

    async fn next_record(&mut self) -> Option<MutationRecord> {
        match self.observer.as_mut() {
            Some(observer) => observer.next_record().await,
            None => None,
        }
    }

    /// Disconnects the observer. Only the first call does anything.
    fn settle(&mut self) -> bool {
        match self.observer.take() {
            Some(mut observer) => observer.disconnect(),
            None => false,
        }
    }
}

impl Drop for RaceGuard {
    fn drop(&mut self) {
        self.settle();
    }
}

/// Resolves once `signal` matches an element of `page`, or fails at the deadline.
pub async fn wait_for_signal(
    page: &dyn PageHost,
    signal: &ReadinessSignal,
    timing: WaitTiming,
) -> Result<SignalSource, WaitError> {
    let selector = signal.selector();
    if page.query_exists(&selector)? {
        debug!(%selector, "readiness signal already present");
        return Ok(SignalSource::Immediate);
    }

    let started = Instant::now();
    let period = timing.poll_interval.max(MIN_POLL_INTERVAL);
    let deadline = sleep_until(started + timing.timeout);
    tokio::pin!(deadline);
    let mut poll = interval_at(started + period, period);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut race = RaceGuard::new(page.observe(ObserveOptions::child_list_subtree()));

    let outcome = loop {
        tokio::select! {
            biased;
            _ = &mut deadline => {
                break Err(WaitError::TimedOut {
                    selector: selector.clone(),
                    waited: started.elapsed(),
                });
            }
            Some(_) = race.next_record() => {
                if page.query_exists(&selector)? {
                    break Ok(SignalSource::Observer);
                }
            }
            _ = poll.tick() => {
                if page.query_exists(&selector)? {
                    break Ok(SignalSource::Poll);
                }
            }
        }
    };
    race.settle();

    if let Ok(source) = &outcome {
        debug!(%selector, ?source, elapsed_ms = started.elapsed().as_millis() as u64, "readiness signal found");
    }
    outcome
}
