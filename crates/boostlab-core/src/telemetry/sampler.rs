//! Telemetry sampler
//!
//! Polls the configured parameter set through the serialized ECU channel at
//! a target rate and assembles the results into immutable snapshots. A
//! failed parameter read never blocks the cycle: the snapshot is emitted
//! partial with that parameter flagged, and values older than their
//! staleness threshold are flagged stale instead of silently frozen.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use super::history::TelemetryHistory;
use super::{SampledValue, Snapshot};
use crate::cancel::CancelToken;
use crate::params::{ParameterTable, Pid};
use crate::protocol::{EcuHandle, Message, Priority, ProtocolError, Request};

/// Capacity of the snapshot broadcast; slow readers lag, the writer never blocks
const BROADCAST_CAPACITY: usize = 256;

/// Seam between the sampler and the serialized ECU channel
pub trait ParameterReader: Send {
    /// Read one parameter in engineering units
    fn read(&self, pid: Pid) -> Result<f64, ProtocolError>;
}

impl ParameterReader for EcuHandle {
    fn read(&self, pid: Pid) -> Result<f64, ProtocolError> {
        match self.execute(Request::ReadParameter(pid), Priority::Poll)? {
            Message::Reading { value, .. } => Ok(value),
            other => Err(ProtocolError::Decode(format!(
                "expected Reading for {pid}, got {other:?}"
            ))),
        }
    }
}

/// Sampler configuration
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Target cycle rate in Hz
    pub sample_rate_hz: f64,
    /// Parameter names to poll; empty means every table entry
    pub parameters: Vec<String>,
    /// History retention window
    pub retention: Duration,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 10.0,
            parameters: Vec::new(),
            retention: super::history::DEFAULT_RETENTION,
        }
    }
}

struct LastGood {
    at: Duration,
    value: f64,
}

/// The telemetry sampler: sole producer of live snapshots
pub struct Sampler {
    reader: Box<dyn ParameterReader>,
    table: Arc<ParameterTable>,
    config: SamplerConfig,
    history: Arc<Mutex<TelemetryHistory>>,
    publisher: broadcast::Sender<Arc<Snapshot>>,
    epoch: Instant,
    last_ts: Duration,
    last_good: HashMap<String, LastGood>,
    seq: u64,
}

impl Sampler {
    /// Create a sampler over a parameter reader (usually an [`EcuHandle`])
    pub fn new(
        reader: Box<dyn ParameterReader>,
        table: Arc<ParameterTable>,
        config: SamplerConfig,
    ) -> Self {
        let (publisher, _) = broadcast::channel(BROADCAST_CAPACITY);
        let history = Arc::new(Mutex::new(TelemetryHistory::new(config.retention)));
        Self {
            reader,
            table,
            config,
            history,
            publisher,
            epoch: Instant::now(),
            last_ts: Duration::ZERO,
            last_good: HashMap::new(),
            seq: 0,
        }
    }

    /// Subscribe to the live snapshot broadcast
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Snapshot>> {
        self.publisher.subscribe()
    }

    /// Shared handle to the retained history
    pub fn history(&self) -> Arc<Mutex<TelemetryHistory>> {
        Arc::clone(&self.history)
    }

    /// Copy-on-read view of the retained history
    pub fn history_view(&self) -> Vec<Arc<Snapshot>> {
        self.history
            .lock()
            .map(|h| h.view())
            .unwrap_or_default()
    }

    fn parameter_names(&self) -> Vec<String> {
        if self.config.parameters.is_empty() {
            self.table.iter().map(|d| d.name.clone()).collect()
        } else {
            self.config.parameters.clone()
        }
    }

    /// Run one sampling cycle: poll every configured parameter, assemble a
    /// snapshot, append it to history, and publish it.
    pub fn cycle(&mut self) -> Arc<Snapshot> {
        // One timestamp per cycle so cross-parameter relationships hold
        let mut timestamp = self.epoch.elapsed();
        if timestamp <= self.last_ts {
            timestamp = self.last_ts + Duration::from_micros(1);
        }
        self.last_ts = timestamp;

        let mut values = std::collections::BTreeMap::new();
        for name in self.parameter_names() {
            let Some(def) = self.table.by_name(&name) else {
                warn!(name, "configured parameter not in table, flagging missing");
                values.insert(name, SampledValue::missing());
                continue;
            };

            let sampled = match self.reader.read(def.pid) {
                Ok(value) => {
                    self.last_good
                        .insert(name.clone(), LastGood { at: timestamp, value });
                    SampledValue::fresh(value)
                }
                Err(e) => {
                    trace!(name, error = %e, "parameter read failed");
                    self.degrade(&name, timestamp, def.staleness_ms)
                }
            };
            values.insert(name, sampled);
        }

        self.seq += 1;
        let snapshot = Arc::new(Snapshot {
            seq: self.seq,
            timestamp,
            values,
        });

        if let Ok(mut history) = self.history.lock() {
            history.append(Arc::clone(&snapshot));
        }
        // Publishing to zero subscribers is fine
        let _ = self.publisher.send(Arc::clone(&snapshot));
        snapshot
    }

    /// On a failed read: carry the last good value flagged stale while it is
    /// within its staleness threshold, otherwise flag the parameter missing.
    fn degrade(&self, name: &str, now: Duration, staleness_ms: u64) -> SampledValue {
        match self.last_good.get(name) {
            Some(lg) if now.saturating_sub(lg.at) <= Duration::from_millis(staleness_ms) => {
                SampledValue::stale(lg.value)
            }
            _ => SampledValue::missing(),
        }
    }

    /// Run cycles at the configured rate until cancelled
    pub fn run(&mut self, cancel: &CancelToken) {
        let interval = Duration::from_secs_f64(1.0 / self.config.sample_rate_hz.max(0.1));
        debug!(rate_hz = self.config.sample_rate_hz, "sampler started");

        while !cancel.is_cancelled() {
            let started = Instant::now();
            self.cycle();
            let elapsed = started.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        debug!("sampler stopped");
    }
}
