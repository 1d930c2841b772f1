//! Telemetry history
//!
//! Append-only ordered sequence of snapshots with a fixed retention window.
//! Retained snapshots are strictly increasing in timestamp with no
//! duplicates; readers take cheap copy-on-read views so background
//! computations never observe mid-append state.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::Snapshot;

/// Default retention window: five minutes of history
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(300);

/// The retained snapshot sequence
#[derive(Debug)]
pub struct TelemetryHistory {
    entries: VecDeque<Arc<Snapshot>>,
    retention: Duration,
}

impl TelemetryHistory {
    /// Create a history with the given retention window
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            retention,
        }
    }

    /// Append a snapshot.
    ///
    /// A snapshot whose timestamp does not advance past the newest retained
    /// entry is dropped (returns `false`); accepting it would break the
    /// ordering invariant every consumer relies on.
    pub fn append(&mut self, snapshot: Arc<Snapshot>) -> bool {
        if let Some(last) = self.entries.back() {
            if snapshot.timestamp <= last.timestamp {
                warn!(
                    ts = ?snapshot.timestamp,
                    last = ?last.timestamp,
                    "dropping non-monotonic snapshot"
                );
                return false;
            }
        }
        self.entries.push_back(snapshot);
        self.evict();
        true
    }

    fn evict(&mut self) {
        let Some(newest) = self.entries.back().map(|s| s.timestamp) else {
            return;
        };
        let cutoff = newest.saturating_sub(self.retention);
        while let Some(front) = self.entries.front() {
            if front.timestamp < cutoff {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Copy-on-read view of the retained snapshots, oldest first
    pub fn view(&self) -> Vec<Arc<Snapshot>> {
        self.entries.iter().cloned().collect()
    }

    /// View restricted to a timestamp range (inclusive)
    pub fn range(&self, start: Duration, end: Duration) -> Vec<Arc<Snapshot>> {
        self.entries
            .iter()
            .filter(|s| s.timestamp >= start && s.timestamp <= end)
            .cloned()
            .collect()
    }

    /// Most recent snapshot, if any
    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        self.entries.back().cloned()
    }

    /// Number of retained snapshots
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the history is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configured retention window
    pub fn retention(&self) -> Duration {
        self.retention
    }
}

impl Default for TelemetryHistory {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}
