//! History export
//!
//! Lazy, restartable view of the snapshot history as flat records for the
//! external CSV exporter. Missing parameters are omitted from a record;
//! stale values are included (the exporter sees what the dashboard saw).

use std::sync::Arc;
use std::time::Duration;

use super::Snapshot;

/// One exported record: timestamp plus the parameters that carried values
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// Snapshot timestamp (since sampler epoch)
    pub timestamp: Duration,
    /// (parameter name, engineering value) pairs, name-ordered
    pub values: Vec<(String, f64)>,
}

/// Restartable iterator over a history view
pub struct HistoryExport {
    snapshots: Vec<Arc<Snapshot>>,
    position: usize,
}

impl HistoryExport {
    /// Build an export over a copy-on-read history view
    pub fn new(snapshots: Vec<Arc<Snapshot>>) -> Self {
        Self {
            snapshots,
            position: 0,
        }
    }

    /// Rewind to the first record
    pub fn restart(&mut self) {
        self.position = 0;
    }

    /// Total record count
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Whether there are no records
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

impl Iterator for HistoryExport {
    type Item = LogRecord;

    fn next(&mut self) -> Option<LogRecord> {
        let snapshot = self.snapshots.get(self.position)?;
        self.position += 1;

        let values = snapshot
            .values
            .iter()
            .filter_map(|(name, sampled)| sampled.value.map(|v| (name.clone(), v)))
            .collect();

        Some(LogRecord {
            timestamp: snapshot.timestamp,
            values,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::SampledValue;
    use std::collections::BTreeMap;

    fn snap(seq: u64, ms: u64, with_missing: bool) -> Arc<Snapshot> {
        let mut values = BTreeMap::new();
        values.insert("rpm".to_string(), SampledValue::fresh(3000.0 + seq as f64));
        if with_missing {
            values.insert("afr".to_string(), SampledValue::missing());
        } else {
            values.insert("afr".to_string(), SampledValue::fresh(12.0));
        }
        Arc::new(Snapshot {
            seq,
            timestamp: Duration::from_millis(ms),
            values,
        })
    }

    #[test]
    fn test_export_is_restartable() {
        let mut export = HistoryExport::new(vec![snap(0, 100, false), snap(1, 200, false)]);
        let first_pass: Vec<_> = export.by_ref().collect();
        assert_eq!(first_pass.len(), 2);

        export.restart();
        let second_pass: Vec<_> = export.collect();
        assert_eq!(first_pass, second_pass);
    }

    #[test]
    fn test_missing_values_omitted() {
        let mut export = HistoryExport::new(vec![snap(0, 100, true)]);
        let record = export.next().unwrap();
        assert_eq!(record.values.len(), 1);
        assert_eq!(record.values[0].0, "rpm");
    }
}
