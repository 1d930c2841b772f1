//! Telemetry
//!
//! Live snapshot stream from the ECU: the periodic sampler, the retained
//! history, and the lazy export view consumed by the CSV exporter.

mod export;
mod history;
mod sampler;

pub use export::{HistoryExport, LogRecord};
pub use history::TelemetryHistory;
pub use sampler::{ParameterReader, Sampler, SamplerConfig};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Freshness of one parameter within a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Validity {
    /// Read successfully this cycle
    Fresh,
    /// Carried from an earlier cycle, still within the staleness threshold
    Stale,
    /// No usable value this cycle
    Missing,
}

/// One parameter's value within a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampledValue {
    /// Engineering-unit value; `None` when missing
    pub value: Option<f64>,
    /// Freshness flag
    pub validity: Validity,
}

impl SampledValue {
    /// A value read this cycle
    pub fn fresh(value: f64) -> Self {
        Self {
            value: Some(value),
            validity: Validity::Fresh,
        }
    }

    /// A carried value flagged stale
    pub fn stale(value: f64) -> Self {
        Self {
            value: Some(value),
            validity: Validity::Stale,
        }
    }

    /// No usable value
    pub fn missing() -> Self {
        Self {
            value: None,
            validity: Validity::Missing,
        }
    }
}

/// An immutable, timestamped set of parameter values from one sampling cycle.
///
/// All values in a snapshot share the cycle timestamp from a single
/// monotonic clock, so cross-parameter relationships (an RPM/load pair
/// feeding a map lookup) are internally consistent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Cycle sequence number
    pub seq: u64,
    /// Time since the sampler epoch (monotonic, strictly increasing)
    pub timestamp: Duration,
    /// Parameter name to sampled value
    pub values: BTreeMap<String, SampledValue>,
}

impl Snapshot {
    /// Look up one parameter's sample
    pub fn get(&self, name: &str) -> Option<&SampledValue> {
        self.values.get(name)
    }

    /// Value of a parameter read fresh this cycle, if any
    pub fn fresh_value(&self, name: &str) -> Option<f64> {
        self.get(name)
            .filter(|s| s.validity == Validity::Fresh)
            .and_then(|s| s.value)
    }

    /// Value of a parameter whether fresh or stale
    pub fn value(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(|s| s.value)
    }

    /// Whether every named parameter is fresh in this snapshot
    pub fn all_fresh(&self, names: &[&str]) -> bool {
        names
            .iter()
            .all(|n| matches!(self.get(n), Some(s) if s.validity == Validity::Fresh))
    }

    /// Whether any parameter in this snapshot is flagged missing
    pub fn has_missing(&self) -> bool {
        self.values
            .values()
            .any(|s| s.validity == Validity::Missing)
    }
}
