//! Manifest records appended by the capture tool, one JSON object per line.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Digest entry describing one captured snapshot of a route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Route URL the snapshot was taken at.
    pub url: String,
    /// Snapshot body checksum (CRC32).
    pub checksum: u32,
    /// Snapshot length in bytes.
    pub length: usize,
    /// Epoch milliseconds of the capture.
    pub captured_at_epoch_ms: u64,
    /// Whether the checksum differs from the prior capture of the same URL.
    pub changed: bool,
}

impl SnapshotRecord {
    /// Record for `html` captured at `url` just now, assumed changed.
    pub fn from_html(url: &str, html: &str) -> Self {
        Self {
            url: url.to_string(),
            checksum: crc32fast::hash(html.as_bytes()),
            length: html.len(),
            captured_at_epoch_ms: now_epoch_ms(),
            changed: true,
        }
    }

    /// Sets `changed` by comparing against the previous record of the same URL.
    pub fn compared_to(mut self, previous: Option<&SnapshotRecord>) -> Self {
        self.changed = previous.map_or(true, |prior| prior.checksum != self.checksum);
        self
    }
}

fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
