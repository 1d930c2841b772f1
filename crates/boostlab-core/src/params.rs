//! Parameter table
//!
//! Static configuration mapping each PID to its name, unit, raw-to-engineering
//! conversion, staleness threshold, and safe display range. Loaded once at
//! process start and read-only thereafter; every unit conversion in the codec
//! is driven by this table rather than hardcoded per call site.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use crate::protocol::ProtocolError;

/// Parameter identifier as requested from the ECU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pid(pub u8);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// Definition of a single telemetry parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterDef {
    /// PID byte used on the wire
    pub pid: Pid,
    /// Channel name (e.g. "rpm", "map_kpa")
    pub name: String,
    /// Engineering unit label
    pub unit: String,
    /// Multiplier applied to the raw wire value
    pub scale: f64,
    /// Offset added after scaling
    pub offset: f64,
    /// Age after which the last good reading is flagged stale (ms)
    pub staleness_ms: u64,
    /// Safe display range (low, high); readings outside it warrant attention
    pub safe_range: Option<(f64, f64)>,
}

impl ParameterDef {
    /// Convert a raw wire value to engineering units
    pub fn to_engineering(&self, raw: u16) -> f64 {
        raw as f64 * self.scale + self.offset
    }

    /// Convert an engineering value back to the raw wire representation
    pub fn to_raw(&self, value: f64) -> u16 {
        if self.scale == 0.0 {
            return 0;
        }
        let raw = (value - self.offset) / self.scale;
        raw.round().clamp(0.0, u16::MAX as f64) as u16
    }

    /// Whether a value falls outside the configured safe range
    pub fn out_of_safe_range(&self, value: f64) -> bool {
        match self.safe_range {
            Some((lo, hi)) => value < lo || value > hi,
            None => false,
        }
    }
}

/// The full PID table, keyed by PID with a stable iteration order.
///
/// The JSON form is a plain list of [`ParameterDef`]; the lookup indexes are
/// rebuilt on load.
#[derive(Debug, Clone)]
pub struct ParameterTable {
    parameters: Vec<ParameterDef>,
    by_pid: HashMap<u8, usize>,
    by_name: HashMap<String, usize>,
}

impl ParameterTable {
    /// Build a table from a list of definitions.
    ///
    /// Duplicate PIDs or names are rejected; silent shadowing of a
    /// conversion entry would corrupt every downstream reading.
    pub fn new(parameters: Vec<ParameterDef>) -> Result<Self, ProtocolError> {
        let mut table = Self {
            parameters,
            by_pid: HashMap::new(),
            by_name: HashMap::new(),
        };
        table.rebuild_index()?;
        Ok(table)
    }

    fn rebuild_index(&mut self) -> Result<(), ProtocolError> {
        self.by_pid.clear();
        self.by_name.clear();
        for (idx, def) in self.parameters.iter().enumerate() {
            if self.by_pid.insert(def.pid.0, idx).is_some() {
                return Err(ProtocolError::Decode(format!(
                    "duplicate PID {} in parameter table",
                    def.pid
                )));
            }
            if self.by_name.insert(def.name.clone(), idx).is_some() {
                return Err(ProtocolError::Decode(format!(
                    "duplicate parameter name '{}' in parameter table",
                    def.name
                )));
            }
        }
        Ok(())
    }

    /// Load a table from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ProtocolError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Parse a table from JSON text
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let parameters: Vec<ParameterDef> = serde_json::from_str(text)
            .map_err(|e| ProtocolError::Decode(format!("parameter table: {e}")))?;
        Self::new(parameters)
    }

    /// Serialize the table to JSON text
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(&self.parameters).unwrap_or_default()
    }

    /// Look up a parameter by PID
    pub fn get(&self, pid: Pid) -> Option<&ParameterDef> {
        self.by_pid.get(&pid.0).map(|&i| &self.parameters[i])
    }

    /// Look up a parameter by channel name
    pub fn by_name(&self, name: &str) -> Option<&ParameterDef> {
        self.by_name.get(name).map(|&i| &self.parameters[i])
    }

    /// Iterate over all definitions in declaration order
    pub fn iter(&self) -> impl Iterator<Item = &ParameterDef> {
        self.parameters.iter()
    }

    /// Number of parameters
    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Built-in table for the turbocharged DI engine this tool targets.
    ///
    /// Conversions follow the standard OBD-II scalings for the common PIDs;
    /// knock retard is a vendor channel reported in 0.25 degree steps.
    pub fn builtin() -> Self {
        let def = |pid: u8,
                   name: &str,
                   unit: &str,
                   scale: f64,
                   offset: f64,
                   staleness_ms: u64,
                   safe_range: Option<(f64, f64)>| ParameterDef {
            pid: Pid(pid),
            name: name.to_string(),
            unit: unit.to_string(),
            scale,
            offset,
            staleness_ms,
            safe_range,
        };

        let parameters = vec![
            def(0x0C, "rpm", "rpm", 0.25, 0.0, 500, Some((0.0, 6800.0))),
            def(0x04, "engine_load", "%", 100.0 / 255.0, 0.0, 500, Some((0.0, 100.0))),
            def(0x0B, "map_kpa", "kPa", 1.0, 0.0, 500, Some((10.0, 185.0))),
            def(0x0D, "speed", "km/h", 1.0, 0.0, 1000, None),
            def(0x0E, "timing_adv", "deg", 0.5, -64.0, 500, Some((-10.0, 45.0))),
            def(0x05, "clt", "degC", 1.0, -40.0, 2000, Some((-20.0, 110.0))),
            def(0x0F, "iat", "degC", 1.0, -40.0, 2000, Some((-20.0, 50.0))),
            def(0x10, "maf", "g/s", 0.01, 0.0, 500, Some((0.0, 250.0))),
            def(0x11, "tps", "%", 100.0 / 255.0, 0.0, 500, Some((0.0, 100.0))),
            def(0x34, "afr", ":1", 0.001, 0.0, 500, Some((10.0, 18.0))),
            def(0xA0, "knock_retard", "deg", 0.25, 0.0, 500, Some((0.0, 3.0))),
            def(0xA1, "boost_target", "kPa", 1.0, 0.0, 500, Some((80.0, 185.0))),
        ];

        // Static data, cannot contain duplicates
        Self::new(parameters).unwrap_or_else(|_| unreachable!("builtin table is well-formed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lookups() {
        let table = ParameterTable::builtin();
        let rpm = table.get(Pid(0x0C)).expect("rpm present");
        assert_eq!(rpm.name, "rpm");
        assert_eq!(table.by_name("map_kpa").map(|d| d.pid), Some(Pid(0x0B)));
    }

    #[test]
    fn test_rpm_conversion() {
        let table = ParameterTable::builtin();
        let rpm = table.get(Pid(0x0C)).unwrap();
        // 3000 rpm on the wire is 12000 raw (quarter-rpm steps)
        assert_eq!(rpm.to_engineering(12000), 3000.0);
        assert_eq!(rpm.to_raw(3000.0), 12000);
    }

    #[test]
    fn test_clt_offset_conversion() {
        let table = ParameterTable::builtin();
        let clt = table.get(Pid(0x05)).unwrap();
        assert_eq!(clt.to_engineering(130), 90.0);
        assert_eq!(clt.to_raw(90.0), 130);
    }

    #[test]
    fn test_safe_range() {
        let table = ParameterTable::builtin();
        let map = table.by_name("map_kpa").unwrap();
        assert!(!map.out_of_safe_range(150.0));
        assert!(map.out_of_safe_range(200.0));
    }

    #[test]
    fn test_json_roundtrip() {
        let table = ParameterTable::builtin();
        let json = table.to_json();
        let restored = ParameterTable::from_json(&json).expect("should parse");

        assert_eq!(restored.len(), table.len());
        let a = table.by_name("afr").unwrap();
        let b = restored.by_name("afr").unwrap();
        assert_eq!(a.scale, b.scale);
        assert_eq!(a.staleness_ms, b.staleness_ms);
    }

    #[test]
    fn test_duplicate_pid_rejected() {
        let mut defs: Vec<ParameterDef> = ParameterTable::builtin().iter().cloned().collect();
        let mut dup = defs[0].clone();
        dup.name = "other".to_string();
        defs.push(dup);

        assert!(ParameterTable::new(defs).is_err());
    }
}
