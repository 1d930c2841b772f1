//! Map store
//!
//! Authoritative holder of the live tuning maps. Writes go through
//! transactions: stage cell edits against a base version, then commit,
//! which validates the whole proposed grid against the safety envelope and
//! either replaces the live map atomically or rejects with the full
//! violation list. A successful commit pushes the changed cells straight to
//! the ECU when a writer is supplied; cells whose push fails stay pending
//! so `retry_sync` can finish the job.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::envelope::{validate, SafetyEnvelope};
use super::{MapError, MapId, TuningMap};
use crate::protocol::{EcuHandle, Message, Priority, ProtocolError, Request};

/// Seam between the store and the serialized ECU channel
pub trait MapWriter {
    /// Push one cell to the ECU; `Ok(true)` means the ECU acknowledged it
    fn write_cell(
        &self,
        map: MapId,
        rpm_idx: usize,
        load_idx: usize,
        value: f64,
    ) -> Result<bool, ProtocolError>;
}

impl MapWriter for EcuHandle {
    fn write_cell(
        &self,
        map: MapId,
        rpm_idx: usize,
        load_idx: usize,
        value: f64,
    ) -> Result<bool, ProtocolError> {
        let request = Request::WriteMapCell {
            map,
            rpm_idx: rpm_idx as u8,
            load_idx: load_idx as u8,
            value,
        };
        match self.execute(request, Priority::Write)? {
            Message::MapAck { ok, .. } => Ok(ok),
            other => Err(ProtocolError::Decode(format!(
                "expected MapAck for {map}, got {other:?}"
            ))),
        }
    }
}

/// ECU-side freshness of a map
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    /// Every committed cell has been acknowledged by the ECU
    Synced,
    /// Some committed cells have not reached the ECU yet
    Pending {
        /// The cells awaiting acknowledgement
        cells: Vec<(usize, usize)>,
    },
}

/// Staged cell edits against one base version of one map.
///
/// Transactions hold no locks; conflicts surface at commit as
/// [`MapError::VersionConflict`].
#[derive(Debug, Clone)]
pub struct WriteTransaction {
    /// Transaction identity, for logging
    pub id: Uuid,
    /// Map being edited
    pub map_id: MapId,
    /// Version the edits are based on
    pub base_version: u64,
    deltas: BTreeMap<(usize, usize), f64>,
}

impl WriteTransaction {
    /// Stage one cell edit, replacing any earlier edit of the same cell
    pub fn set_cell(&mut self, rpm_idx: usize, load_idx: usize, value: f64) {
        self.deltas.insert((rpm_idx, load_idx), value);
    }

    /// Number of distinct cells staged
    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    /// Whether no edits are staged
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }
}

/// The live tuning maps, their envelopes, and the ECU sync queue
pub struct MapStore {
    maps: HashMap<MapId, Arc<TuningMap>>,
    envelopes: HashMap<MapId, SafetyEnvelope>,
    pending: HashMap<MapId, BTreeSet<(usize, usize)>>,
}

impl MapStore {
    /// Empty store
    pub fn new() -> Self {
        Self {
            maps: HashMap::new(),
            envelopes: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    /// Store seeded with the stock maps and their default envelopes
    pub fn with_defaults() -> Self {
        let mut store = Self::new();
        store.insert(super::default_boost_map(), SafetyEnvelope::default_for(MapId::BoostTarget));
        store.insert(
            super::default_timing_map(),
            SafetyEnvelope::default_for(MapId::IgnitionTiming),
        );
        store
    }

    /// Register a map and its envelope, replacing any prior entry
    pub fn insert(&mut self, map: TuningMap, envelope: SafetyEnvelope) {
        self.pending.remove(&map.id);
        self.envelopes.insert(map.id, envelope);
        self.maps.insert(map.id, Arc::new(map));
    }

    /// Live version of a map; the `Arc` stays valid across later commits
    pub fn get(&self, id: MapId) -> Result<Arc<TuningMap>, MapError> {
        self.maps.get(&id).cloned().ok_or(MapError::UnknownMap(id))
    }

    /// Envelope gating writes to a map
    pub fn envelope(&self, id: MapId) -> Result<&SafetyEnvelope, MapError> {
        self.envelopes.get(&id).ok_or(MapError::UnknownMap(id))
    }

    /// Registered map ids
    pub fn ids(&self) -> Vec<MapId> {
        let mut ids: Vec<_> = self.maps.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Open a transaction against the current version of a map
    pub fn begin_write(&self, id: MapId) -> Result<WriteTransaction, MapError> {
        let live = self.get(id)?;
        Ok(WriteTransaction {
            id: Uuid::new_v4(),
            map_id: id,
            base_version: live.version,
            deltas: BTreeMap::new(),
        })
    }

    /// Commit a transaction.
    ///
    /// The full proposed grid is validated against the envelope; the commit
    /// is all-or-nothing. On success the live map is replaced with the next
    /// version and the changed cells are pushed to the ECU through `writer`.
    /// Cells whose push fails (or all changed cells, when no writer is
    /// supplied) stay pending for [`MapStore::retry_sync`]; the commit
    /// itself still succeeds. On rejection the prior version stays live,
    /// untouched.
    pub fn commit(
        &mut self,
        txn: WriteTransaction,
        writer: Option<&dyn MapWriter>,
    ) -> Result<u64, MapError> {
        let live = self.get(txn.map_id)?;
        if live.version != txn.base_version {
            return Err(MapError::VersionConflict {
                base: txn.base_version,
                current: live.version,
            });
        }

        let (rows, cols) = live.dims();
        let mut values = live.values.clone();
        for (&(r, l), &value) in &txn.deltas {
            if r >= rows || l >= cols {
                return Err(MapError::CellOutOfBounds {
                    rpm_idx: r,
                    load_idx: l,
                    rows,
                    cols,
                });
            }
            values[r][l] = value;
        }

        let mut proposed = TuningMap::new(
            txn.map_id,
            live.name.clone(),
            live.rpm_bins.clone(),
            live.load_bins.clone(),
            values,
        )?;
        proposed.version = live.version + 1;

        let envelope = self.envelope(txn.map_id)?;
        let violations = validate(Some(&live), &proposed, envelope);
        if !violations.is_empty() {
            warn!(
                txn = %txn.id,
                map = %txn.map_id,
                count = violations.len(),
                "commit rejected by safety envelope"
            );
            return Err(MapError::ValidationRejected(violations));
        }

        let version = proposed.version;
        info!(
            txn = %txn.id,
            map = %txn.map_id,
            version,
            cells = txn.deltas.len(),
            "map commit"
        );
        self.maps.insert(txn.map_id, Arc::new(proposed));
        self.pending
            .entry(txn.map_id)
            .or_default()
            .extend(txn.deltas.keys().copied());
        if let Some(writer) = writer {
            let remaining = self.push_pending(txn.map_id, writer)?;
            if remaining > 0 {
                warn!(map = %txn.map_id, remaining, "commit left cells unsynced");
            }
        }
        Ok(version)
    }

    /// ECU-side sync state of a map
    pub fn sync_state(&self, id: MapId) -> SyncState {
        match self.pending.get(&id) {
            Some(cells) if !cells.is_empty() => SyncState::Pending {
                cells: cells.iter().copied().collect(),
            },
            _ => SyncState::Synced,
        }
    }

    /// Push pending cells of a map to the ECU.
    ///
    /// Each acknowledged cell leaves the pending set immediately, so a push
    /// that dies partway resumes where it stopped. Returns the number of
    /// cells still pending afterwards.
    pub fn retry_sync(&mut self, id: MapId, writer: &dyn MapWriter) -> Result<usize, MapError> {
        self.push_pending(id, writer)
    }

    fn push_pending(&mut self, id: MapId, writer: &dyn MapWriter) -> Result<usize, MapError> {
        let live = self.get(id)?;
        let cells: Vec<_> = self
            .pending
            .get(&id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();

        for (r, l) in cells {
            let value = live.cell(r, l)?;
            match writer.write_cell(id, r, l, value) {
                Ok(true) => {
                    if let Some(set) = self.pending.get_mut(&id) {
                        set.remove(&(r, l));
                    }
                    debug!(map = %id, rpm_idx = r, load_idx = l, value, "cell synced");
                }
                Ok(false) => {
                    warn!(map = %id, rpm_idx = r, load_idx = l, "ECU refused cell write");
                }
                Err(e) => {
                    warn!(map = %id, rpm_idx = r, load_idx = l, error = %e, "cell push failed");
                }
            }
        }

        Ok(self
            .pending
            .get(&id)
            .map(|s| s.len())
            .unwrap_or(0))
    }
}

impl Default for MapStore {
    fn default() -> Self {
        Self::with_defaults()
    }
}
