//! Tuning Maps
//!
//! Versioned 2D lookup tables (RPM x load) with bilinear interpolated reads,
//! safety-envelope-gated transactional writes, and JSON persistence.

pub mod envelope;
pub mod file;
pub mod store;

pub use envelope::{validate, EnvelopeRule, SafetyEnvelope, Violation};
pub use file::{load_map, save_map, MapFile};
pub use store::{MapStore, MapWriter, SyncState, WriteTransaction};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors from map construction, persistence, and write transactions
#[derive(Error, Debug)]
pub enum MapError {
    /// Grid or breakpoint structure is invalid
    #[error("bad grid: {0}")]
    BadGrid(String),

    /// No map registered under this id
    #[error("unknown map {0}")]
    UnknownMap(MapId),

    /// A concurrent commit landed first; retry against the new version
    #[error("version conflict: transaction based on v{base}, store is at v{current}")]
    VersionConflict {
        /// Version the transaction was opened against
        base: u64,
        /// Version currently live in the store
        current: u64,
    },

    /// The proposed grid violates the safety envelope.
    ///
    /// Carries every violated cell and rule so the caller can correct and
    /// retry in one pass. The prior version stays live.
    #[error("validation rejected: {} violation(s)", .0.len())]
    ValidationRejected(Vec<Violation>),

    /// Cell index outside the grid
    #[error("cell index ({rpm_idx}, {load_idx}) out of bounds for {rows}x{cols} grid")]
    CellOutOfBounds {
        /// RPM axis index
        rpm_idx: usize,
        /// Load axis index
        load_idx: usize,
        /// Grid row count
        rows: usize,
        /// Grid column count
        cols: usize,
    },

    /// File I/O failure while loading or saving a map
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Malformed persisted map file
    #[error("map file error: {0}")]
    FileError(#[from] serde_json::Error),
}

/// Identifier of a tuning map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapId {
    /// Boost target map (kPa absolute)
    BoostTarget,
    /// Ignition timing advance map (degrees BTDC)
    IgnitionTiming,
}

impl MapId {
    /// Byte used to identify this map on the wire
    pub fn wire_byte(self) -> u8 {
        match self {
            MapId::BoostTarget => 0x01,
            MapId::IgnitionTiming => 0x02,
        }
    }

    /// Decode a wire byte into a map id
    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(MapId::BoostTarget),
            0x02 => Some(MapId::IgnitionTiming),
            _ => None,
        }
    }

    /// Resolution of one raw step in cell-value transfers (engineering units)
    pub fn value_scale(self) -> f64 {
        0.1
    }

    /// Engineering unit of the map's cell values
    pub fn unit(self) -> &'static str {
        match self {
            MapId::BoostTarget => "kPa",
            MapId::IgnitionTiming => "deg",
        }
    }
}

impl fmt::Display for MapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapId::BoostTarget => write!(f, "boost_target"),
            MapId::IgnitionTiming => write!(f, "ignition_timing"),
        }
    }
}

/// A named 2D grid over (RPM breakpoints, load breakpoints).
///
/// Invariants, enforced at construction: breakpoints strictly increasing,
/// grid fully populated, version monotonically increasing under the store.
/// Never mutated in place; the store replaces whole versions.
#[derive(Debug, Clone, PartialEq)]
pub struct TuningMap {
    /// Map identity
    pub id: MapId,
    /// Display name
    pub name: String,
    /// RPM axis breakpoints, strictly increasing
    pub rpm_bins: Vec<f64>,
    /// Load axis breakpoints, strictly increasing
    pub load_bins: Vec<f64>,
    /// Cell values, indexed `values[rpm_idx][load_idx]`
    pub values: Vec<Vec<f64>>,
    /// Version counter, bumped by every committed write
    pub version: u64,
}

impl TuningMap {
    /// Build a map, validating the grid invariants
    pub fn new(
        id: MapId,
        name: impl Into<String>,
        rpm_bins: Vec<f64>,
        load_bins: Vec<f64>,
        values: Vec<Vec<f64>>,
    ) -> Result<Self, MapError> {
        check_bins(&rpm_bins, "rpm")?;
        check_bins(&load_bins, "load")?;

        if values.len() != rpm_bins.len() {
            return Err(MapError::BadGrid(format!(
                "expected {} rows, got {}",
                rpm_bins.len(),
                values.len()
            )));
        }
        for (i, row) in values.iter().enumerate() {
            if row.len() != load_bins.len() {
                return Err(MapError::BadGrid(format!(
                    "row {i} has {} cells, expected {}",
                    row.len(),
                    load_bins.len()
                )));
            }
            if row.iter().any(|v| !v.is_finite()) {
                return Err(MapError::BadGrid(format!("row {i} contains a non-finite value")));
            }
        }

        Ok(Self {
            id,
            name: name.into(),
            rpm_bins,
            load_bins,
            values,
            version: 1,
        })
    }

    /// Grid dimensions (rpm rows, load columns)
    pub fn dims(&self) -> (usize, usize) {
        (self.rpm_bins.len(), self.load_bins.len())
    }

    /// Value of a single cell
    pub fn cell(&self, rpm_idx: usize, load_idx: usize) -> Result<f64, MapError> {
        self.values
            .get(rpm_idx)
            .and_then(|row| row.get(load_idx))
            .copied()
            .ok_or(MapError::CellOutOfBounds {
                rpm_idx,
                load_idx,
                rows: self.rpm_bins.len(),
                cols: self.load_bins.len(),
            })
    }

    /// Interpolated read at an arbitrary operating point.
    ///
    /// Bilinear across the four nearest breakpoints; inputs beyond the grid
    /// edges clamp to the nearest edge cell. Extrapolating a boost or timing
    /// table risks unsafe values, so it is never done.
    pub fn value_at(&self, rpm: f64, load: f64) -> f64 {
        let (r0, r1, tr) = surrounding_indices(rpm, &self.rpm_bins);
        let (l0, l1, tl) = surrounding_indices(load, &self.load_bins);

        let v00 = self.values[r0][l0];
        let v01 = self.values[r0][l1];
        let v10 = self.values[r1][l0];
        let v11 = self.values[r1][l1];

        let low = v00 + (v01 - v00) * tl;
        let high = v10 + (v11 - v10) * tl;
        low + (high - low) * tr
    }

    /// Index of the breakpoint nearest to a value on the RPM axis
    pub fn nearest_rpm_idx(&self, rpm: f64) -> usize {
        nearest_bin(rpm, &self.rpm_bins)
    }

    /// Index of the breakpoint nearest to a value on the load axis
    pub fn nearest_load_idx(&self, load: f64) -> usize {
        nearest_bin(load, &self.load_bins)
    }
}

fn check_bins(bins: &[f64], axis: &str) -> Result<(), MapError> {
    if bins.len() < 2 {
        return Err(MapError::BadGrid(format!(
            "{axis} axis needs at least 2 breakpoints, got {}",
            bins.len()
        )));
    }
    if bins.iter().any(|b| !b.is_finite()) {
        return Err(MapError::BadGrid(format!("{axis} axis contains a non-finite breakpoint")));
    }
    for pair in bins.windows(2) {
        if pair[1] <= pair[0] {
            return Err(MapError::BadGrid(format!(
                "{axis} breakpoints not strictly increasing: {} then {}",
                pair[0], pair[1]
            )));
        }
    }
    Ok(())
}

/// Find surrounding breakpoint indices and interpolation ratio, clamped to
/// the grid edges.
fn surrounding_indices(value: f64, bins: &[f64]) -> (usize, usize, f64) {
    let last = bins.len() - 1;
    if value <= bins[0] {
        return (0, 0, 0.0);
    }
    if value >= bins[last] {
        return (last, last, 0.0);
    }

    for (i, pair) in bins.windows(2).enumerate() {
        if value >= pair[0] && value <= pair[1] {
            let span = pair[1] - pair[0];
            let ratio = if span.abs() < f64::EPSILON {
                0.0
            } else {
                (value - pair[0]) / span
            };
            return (i, i + 1, ratio);
        }
    }

    (last, last, 0.0)
}

fn nearest_bin(value: f64, bins: &[f64]) -> usize {
    let mut best = 0;
    let mut best_dist = f64::INFINITY;
    for (i, b) in bins.iter().enumerate() {
        let dist = (value - b).abs();
        if dist < best_dist {
            best = i;
            best_dist = dist;
        }
    }
    best
}

/// Default boost target map for a K04-turbo 2.3L DI engine (kPa absolute)
pub fn default_boost_map() -> TuningMap {
    let rpm_bins = vec![1500.0, 2000.0, 2500.0, 3000.0, 3500.0, 4000.0, 4500.0, 5000.0, 5500.0, 6000.0, 6500.0];
    let load_bins = vec![20.0, 40.0, 60.0, 80.0, 100.0];
    let values = vec![
        vec![100.0, 105.0, 110.0, 115.0, 120.0],
        vec![100.0, 110.0, 120.0, 130.0, 140.0],
        vec![100.0, 115.0, 130.0, 145.0, 155.0],
        vec![100.0, 118.0, 136.0, 152.0, 165.0],
        vec![100.0, 120.0, 140.0, 158.0, 172.0],
        vec![100.0, 120.0, 142.0, 160.0, 175.0],
        vec![100.0, 120.0, 142.0, 160.0, 175.0],
        vec![100.0, 118.0, 138.0, 156.0, 170.0],
        vec![100.0, 116.0, 134.0, 150.0, 164.0],
        vec![100.0, 112.0, 128.0, 142.0, 155.0],
        vec![100.0, 108.0, 122.0, 134.0, 146.0],
    ];
    TuningMap::new(MapId::BoostTarget, "Boost Target", rpm_bins, load_bins, values)
        .unwrap_or_else(|_| unreachable!("default boost map is well-formed"))
}

/// Default ignition timing map (degrees BTDC)
pub fn default_timing_map() -> TuningMap {
    let rpm_bins = vec![1500.0, 2000.0, 2500.0, 3000.0, 3500.0, 4000.0, 4500.0, 5000.0, 5500.0, 6000.0, 6500.0];
    let load_bins = vec![20.0, 40.0, 60.0, 80.0, 100.0];
    let values = vec![
        vec![22.0, 18.0, 14.0, 10.0, 7.0],
        vec![24.0, 20.0, 15.0, 11.0, 8.0],
        vec![26.0, 21.0, 16.0, 12.0, 9.0],
        vec![28.0, 22.0, 17.0, 13.0, 10.0],
        vec![28.0, 23.0, 18.0, 14.0, 11.0],
        vec![28.0, 24.0, 19.0, 15.0, 12.0],
        vec![28.0, 24.0, 20.0, 16.0, 13.0],
        vec![28.0, 25.0, 21.0, 17.0, 14.0],
        vec![28.0, 25.0, 21.0, 17.0, 14.0],
        vec![28.0, 25.0, 22.0, 18.0, 15.0],
        vec![28.0, 25.0, 22.0, 18.0, 15.0],
    ];
    TuningMap::new(MapId::IgnitionTiming, "Ignition Timing", rpm_bins, load_bins, values)
        .unwrap_or_else(|_| unreachable!("default timing map is well-formed"))
}
