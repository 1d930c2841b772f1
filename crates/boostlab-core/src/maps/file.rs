//! Map persistence
//!
//! JSON save/load of a single map. Breakpoints, cell values, and version
//! round-trip exactly; `saved_at` records the wall-clock save time for
//! the session browser.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

use super::{MapError, MapId, TuningMap};

/// On-disk form of one map
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapFile {
    /// Map identity
    pub id: MapId,
    /// Display name
    pub name: String,
    /// RPM axis breakpoints
    pub rpm_bins: Vec<f64>,
    /// Load axis breakpoints
    pub load_bins: Vec<f64>,
    /// Cell values, `values[rpm_idx][load_idx]`
    pub values: Vec<Vec<f64>>,
    /// Version at save time
    pub version: u64,
    /// Wall-clock save time
    pub saved_at: DateTime<Utc>,
}

impl MapFile {
    /// Snapshot a live map for saving
    pub fn from_map(map: &TuningMap) -> Self {
        Self {
            id: map.id,
            name: map.name.clone(),
            rpm_bins: map.rpm_bins.clone(),
            load_bins: map.load_bins.clone(),
            values: map.values.clone(),
            version: map.version,
            saved_at: Utc::now(),
        }
    }

    /// Rebuild a map, revalidating the grid invariants
    pub fn into_map(self) -> Result<TuningMap, MapError> {
        let mut map = TuningMap::new(self.id, self.name, self.rpm_bins, self.load_bins, self.values)?;
        map.version = self.version;
        Ok(map)
    }
}

/// Save a map as pretty-printed JSON
pub fn save_map(map: &TuningMap, path: &Path) -> Result<(), MapError> {
    let file = MapFile::from_map(map);
    let json = serde_json::to_string_pretty(&file)?;
    fs::write(path, json)?;
    info!(map = %map.id, version = map.version, path = %path.display(), "map saved");
    Ok(())
}

/// Load a map, revalidating the grid invariants
pub fn load_map(path: &Path) -> Result<TuningMap, MapError> {
    let json = fs::read_to_string(path)?;
    let file: MapFile = serde_json::from_str(&json)?;
    file.into_map()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maps::default_boost_map;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_save_load_roundtrip_exact() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("boost.json");

        let mut map = default_boost_map();
        map.version = 7;
        save_map(&map, &path).unwrap();

        let loaded = load_map(&path).unwrap();
        assert_eq!(loaded, map);
    }

    #[test]
    fn test_corrupt_file_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_map(&path), Err(MapError::FileError(_))));
    }

    #[test]
    fn test_tampered_grid_rejected_on_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ragged.json");

        let mut file = MapFile::from_map(&default_boost_map());
        file.values[3].pop();
        fs::write(&path, serde_json::to_string(&file).unwrap()).unwrap();

        assert!(matches!(load_map(&path), Err(MapError::BadGrid(_))));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        assert!(matches!(
            load_map(Path::new("/nonexistent/boost.json")),
            Err(MapError::IoError(_))
        ));
    }
}
