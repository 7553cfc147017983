//! Snapshot agent tunables shared by the library and its binaries.

use crate::messages::TargetOrigin;
use crate::readiness::{ReadinessSignal, WaitTiming, DEFAULT_POLL_INTERVAL, DEFAULT_TIMEOUT};
use clap::{Parser, ValueEnum};
use snapshot_sanitizer::{TransformOptions, DEFAULT_SNAPSHOT_VERSION, SNAPSHOT_READY_TAG};
use std::time::Duration;

/// Version reported in the debug comment appended at startup.
pub const SCRIPT_VERSION: u32 = 1;
/// Delay before re-running the snapshot check after a navigate request.
pub const DEFAULT_RECHECK_DELAY: Duration = Duration::from_millis(50);
/// Delay between the document finishing loading and replaying a restored route.
pub const DEFAULT_RESTORE_DELAY: Duration = Duration::from_millis(100);

/// How the agent detects readiness and treats captured markup.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum Profile {
    /// `<meta name="truthseo-snapshot-ready">` signal, markup posted untouched.
    #[default]
    Latest,
    /// `<truthseo-snapshot-ready>` element signal, marked processed after capture, markup
    /// sanitized and given a freshness validator.
    Sanitizing,
}

impl Profile {
    /// Readiness signal the profile waits for.
    pub fn signal(self) -> ReadinessSignal {
        match self {
            Self::Latest => ReadinessSignal::Meta {
                name: SNAPSHOT_READY_TAG.to_string(),
            },
            Self::Sanitizing => ReadinessSignal::Element {
                tag: SNAPSHOT_READY_TAG.to_string(),
            },
        }
    }
}

/// Tunable knobs of a snapshot agent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotControls {
    profile: Profile,
    wait_timing: WaitTiming,
    recheck_delay: Duration,
    restore_delay: Duration,
    target_origin: TargetOrigin,
    script_version: u32,
    snapshot_version: u32,
}

impl SnapshotControls {
    /// Constructs a new set of snapshot controls.
    pub fn new(
        profile: Profile,
        wait_timing: WaitTiming,
        recheck_delay: Duration,
        restore_delay: Duration,
        target_origin: TargetOrigin,
        script_version: u32,
        snapshot_version: u32,
    ) -> Self {
        Self {
            profile,
            wait_timing,
            recheck_delay,
            restore_delay,
            target_origin,
            script_version,
            snapshot_version,
        }
    }

    /// Controls for `profile` with every other knob at its default.
    pub fn for_profile(profile: Profile) -> Self {
        Self {
            profile,
            ..Self::default()
        }
    }

    /// Selected profile.
    pub fn profile(&self) -> Profile {
        self.profile
    }

    /// Readiness signal to wait for.
    pub fn signal(&self) -> ReadinessSignal {
        self.profile.signal()
    }

    /// Timeout and poll period of each wait.
    pub fn wait_timing(&self) -> WaitTiming {
        self.wait_timing
    }

    /// Delay before re-checking after a navigate request.
    pub fn recheck_delay(&self) -> Duration {
        self.recheck_delay
    }

    /// Delay before replaying a restored route.
    pub fn restore_delay(&self) -> Duration {
        self.restore_delay
    }

    /// Origin restriction for posted snapshots.
    pub fn target_origin(&self) -> &TargetOrigin {
        &self.target_origin
    }

    /// Version written into the debug comment.
    pub fn script_version(&self) -> u32 {
        self.script_version
    }

    /// Sanitizer settings, `None` when the profile posts raw markup.
    pub fn transform(&self) -> Option<TransformOptions> {
        match self.profile {
            Profile::Latest => None,
            Profile::Sanitizing => Some(TransformOptions {
                snapshot_version: self.snapshot_version,
                inject_validator: true,
            }),
        }
    }
}

impl Default for SnapshotControls {
    fn default() -> Self {
        Self {
            profile: Profile::default(),
            wait_timing: WaitTiming::default(),
            recheck_delay: DEFAULT_RECHECK_DELAY,
            restore_delay: DEFAULT_RESTORE_DELAY,
            target_origin: TargetOrigin::Any,
            script_version: SCRIPT_VERSION,
            snapshot_version: DEFAULT_SNAPSHOT_VERSION,
        }
    }
}

/// Command-line interface shared by binaries that run the agent.
#[derive(Parser, Debug, Clone)]
#[command(name = "truthseo", about = "Snapshot agent controls")]
pub struct Cli {
    /// Readiness and transform profile
    #[arg(long, env = "TRUTHSEO_PROFILE", value_enum, default_value_t = Profile::Latest)]
    pub profile: Profile,

    /// Milliseconds to wait for the readiness signal
    #[arg(long, env = "TRUTHSEO_TIMEOUT_MS", default_value_t = DEFAULT_TIMEOUT.as_millis() as u64)]
    pub timeout_ms: u64,

    /// Milliseconds between readiness polls
    #[arg(long, env = "TRUTHSEO_POLL_MS", default_value_t = DEFAULT_POLL_INTERVAL.as_millis() as u64)]
    pub poll_ms: u64,

    /// Milliseconds before re-checking after a navigate request
    #[arg(long, env = "TRUTHSEO_RECHECK_MS", default_value_t = DEFAULT_RECHECK_DELAY.as_millis() as u64)]
    pub recheck_ms: u64,

    /// Milliseconds before replaying a restored route
    #[arg(long, env = "TRUTHSEO_RESTORE_MS", default_value_t = DEFAULT_RESTORE_DELAY.as_millis() as u64)]
    pub restore_ms: u64,

    /// Origin allowed to receive snapshots, `*` for any
    #[arg(long, env = "TRUTHSEO_TARGET_ORIGIN", default_value = "*")]
    pub target_origin: String,

    /// Version reported in the startup debug comment
    #[arg(long, env = "TRUTHSEO_SCRIPT_VERSION", default_value_t = SCRIPT_VERSION)]
    pub script_version: u32,

    /// Version stamped into sanitized snapshots
    #[arg(long, env = "TRUTHSEO_SNAPSHOT_VERSION", default_value_t = DEFAULT_SNAPSHOT_VERSION)]
    pub snapshot_version: u32,
}

impl Cli {
    /// Converts the parsed CLI into `SnapshotControls`.
    pub fn build_controls(&self) -> Result<SnapshotControls, url::ParseError> {
        Ok(SnapshotControls::new(
            self.profile,
            WaitTiming {
                timeout: Duration::from_millis(self.timeout_ms),
                poll_interval: Duration::from_millis(self.poll_ms),
            },
            Duration::from_millis(self.recheck_ms),
            Duration::from_millis(self.restore_ms),
            self.target_origin.parse()?,
            self.script_version,
            self.snapshot_version,
        ))
    }
}
