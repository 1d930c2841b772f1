//! Recommendation engine
//!
//! Turns retained telemetry into a reviewable set of map edits. History is
//! binned onto the target map's breakpoints, each bin is scored by a
//! pluggable [`Scorer`], and the surviving deltas are clamped to the safety
//! envelope before they are offered. The engine proposes; it never commits.

use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::maps::{
    validate, EnvelopeRule, MapError, MapId, MapStore, SafetyEnvelope, TuningMap, Violation,
    WriteTransaction,
};
use crate::telemetry::Snapshot;

/// Errors from candidate generation
#[derive(Error, Debug)]
pub enum RecommendError {
    /// The run was cancelled; no partial candidate is produced
    #[error("recommendation cancelled")]
    Cancelled,

    /// Store lookup failed
    #[error(transparent)]
    Map(#[from] MapError),
}

/// Aggregate telemetry for one map cell
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BinStats {
    /// Snapshots that landed in this bin
    pub hits: usize,
    /// Worst knock retard seen (degrees)
    pub knock_max: f64,
    /// Mean knock retard (degrees)
    pub knock_mean: f64,
    /// Mean AFR across hits that carried a fresh AFR
    pub afr_mean: f64,
    /// Mean manifold pressure (kPa absolute)
    pub map_kpa_mean: f64,
}

/// Why a delta was proposed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RationaleTag {
    /// Knock retard observed in this bin
    KnockObserved,
    /// AFR leaner than the safe WOT window while under boost
    LeanUnderBoost,
    /// Bin ran clean across enough hits to creep toward more authority
    CleanCell,
}

/// One scored adjustment for a bin, before confidence weighting
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredDelta {
    /// Proposed change in engineering units (signed)
    pub delta: f64,
    /// Why
    pub rationale: RationaleTag,
}

/// Scoring strategy: bin statistics in, proposed deltas out
pub trait Scorer {
    /// Score one bin; an empty vec means leave the cell alone
    fn score(&self, map_id: MapId, stats: &BinStats) -> Vec<ScoredDelta>;
}

/// How bin hit counts translate into confidence
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidencePolicy {
    /// Hits at which confidence saturates at 1.0
    pub full_confidence_at_hits: usize,
    /// Bins below this confidence are dropped entirely
    pub min_confidence: f64,
    /// Whether the proposed delta is scaled down by confidence
    pub scale_delta_by_confidence: bool,
}

impl Default for ConfidencePolicy {
    fn default() -> Self {
        Self {
            full_confidence_at_hits: 20,
            min_confidence: 0.25,
            scale_delta_by_confidence: true,
        }
    }
}

impl ConfidencePolicy {
    /// Confidence in [0, 1] for a bin with the given hit count
    pub fn confidence(&self, hits: usize) -> f64 {
        if self.full_confidence_at_hits == 0 {
            return 1.0;
        }
        (hits as f64 / self.full_confidence_at_hits as f64).min(1.0)
    }
}

/// One proposed cell edit within a candidate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellDelta {
    /// RPM axis index
    pub rpm_idx: usize,
    /// Load axis index
    pub load_idx: usize,
    /// Live cell value
    pub current: f64,
    /// Proposed cell value, already clamped to the envelope
    pub proposed: f64,
    /// Confidence in [min_confidence, 1]
    pub confidence: f64,
    /// Why
    pub rationale: RationaleTag,
}

/// A reviewable set of edits against one version of one map
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Target map
    pub map_id: MapId,
    /// Map version the deltas were computed against
    pub base_version: u64,
    /// Proposed edits, cell-ordered
    pub cells: Vec<CellDelta>,
}

impl Candidate {
    /// Whether the candidate proposes any change
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Stage this candidate into a store transaction for review-then-commit
    pub fn to_transaction(&self, store: &MapStore) -> Result<WriteTransaction, MapError> {
        let mut txn = store.begin_write(self.map_id)?;
        for cell in &self.cells {
            txn.set_cell(cell.rpm_idx, cell.load_idx, cell.proposed);
        }
        Ok(txn)
    }
}

/// Knock-biased scorer for a stock-turbo DI engine.
///
/// Knock always wins: any knock retard in a bin pulls timing (or boost)
/// down regardless of how the bin looks otherwise. Lean AFR under boost
/// trims boost. A bin that ran clean earns a small creep toward more
/// authority.
#[derive(Debug, Clone, Copy)]
pub struct KnockBiasScorer {
    /// Knock retard above this is treated as real knock (degrees)
    pub knock_threshold: f64,
    /// AFR leaner than this under boost is unsafe at WOT
    pub lean_afr_limit: f64,
    /// Manifold pressure above this counts as "under boost" (kPa absolute)
    pub boost_floor_kpa: f64,
}

impl Default for KnockBiasScorer {
    fn default() -> Self {
        Self {
            knock_threshold: 0.5,
            lean_afr_limit: 11.8,
            boost_floor_kpa: 120.0,
        }
    }
}

impl Scorer for KnockBiasScorer {
    fn score(&self, map_id: MapId, stats: &BinStats) -> Vec<ScoredDelta> {
        let mut out = Vec::new();
        let knocking = stats.knock_max > self.knock_threshold;
        let lean_under_boost = stats.map_kpa_mean > self.boost_floor_kpa
            && stats.afr_mean > self.lean_afr_limit
            && stats.afr_mean > 0.0;

        match map_id {
            MapId::IgnitionTiming => {
                if knocking {
                    out.push(ScoredDelta {
                        delta: -stats.knock_max.min(2.0),
                        rationale: RationaleTag::KnockObserved,
                    });
                } else {
                    out.push(ScoredDelta {
                        delta: 0.25,
                        rationale: RationaleTag::CleanCell,
                    });
                }
            }
            MapId::BoostTarget => {
                if knocking {
                    out.push(ScoredDelta {
                        delta: -5.0,
                        rationale: RationaleTag::KnockObserved,
                    });
                }
                if lean_under_boost {
                    out.push(ScoredDelta {
                        delta: -3.0,
                        rationale: RationaleTag::LeanUnderBoost,
                    });
                }
                if !knocking && !lean_under_boost {
                    out.push(ScoredDelta {
                        delta: 2.0,
                        rationale: RationaleTag::CleanCell,
                    });
                }
            }
        }
        out
    }
}

struct BinAccum {
    hits: usize,
    knock_sum: f64,
    knock_max: f64,
    afr_sum: f64,
    afr_hits: usize,
    map_sum: f64,
    map_hits: usize,
}

impl BinAccum {
    fn new() -> Self {
        Self {
            hits: 0,
            knock_sum: 0.0,
            knock_max: 0.0,
            afr_sum: 0.0,
            afr_hits: 0,
            map_sum: 0.0,
            map_hits: 0,
        }
    }

    fn stats(&self) -> BinStats {
        BinStats {
            hits: self.hits,
            knock_max: self.knock_max,
            knock_mean: if self.hits > 0 {
                self.knock_sum / self.hits as f64
            } else {
                0.0
            },
            afr_mean: if self.afr_hits > 0 {
                self.afr_sum / self.afr_hits as f64
            } else {
                0.0
            },
            map_kpa_mean: if self.map_hits > 0 {
                self.map_sum / self.map_hits as f64
            } else {
                0.0
            },
        }
    }
}

/// The candidate generator
pub struct RecommendationEngine {
    policy: ConfidencePolicy,
}

impl RecommendationEngine {
    /// Engine with the given confidence policy
    pub fn new(policy: ConfidencePolicy) -> Self {
        Self { policy }
    }

    /// Bin a history view onto a map's breakpoints.
    ///
    /// A snapshot only lands in a bin when its RPM and load are both fresh
    /// in the same snapshot; a stale axis would attribute data to the wrong
    /// cell. Knock, AFR, and manifold pressure contribute when fresh.
    pub fn bin_history(
        &self,
        history: &[Arc<Snapshot>],
        map: &TuningMap,
        cancel: &CancelToken,
    ) -> Result<BTreeMap<(usize, usize), BinStats>, RecommendError> {
        let mut bins: BTreeMap<(usize, usize), BinAccum> = BTreeMap::new();

        for snapshot in history {
            if cancel.is_cancelled() {
                return Err(RecommendError::Cancelled);
            }
            let (Some(rpm), Some(load)) = (
                snapshot.fresh_value("rpm"),
                snapshot.fresh_value("engine_load"),
            ) else {
                continue;
            };

            let key = (map.nearest_rpm_idx(rpm), map.nearest_load_idx(load));
            let accum = bins.entry(key).or_insert_with(BinAccum::new);
            accum.hits += 1;

            if let Some(knock) = snapshot.fresh_value("knock_retard") {
                accum.knock_sum += knock;
                accum.knock_max = accum.knock_max.max(knock);
            }
            if let Some(afr) = snapshot.fresh_value("afr") {
                accum.afr_sum += afr;
                accum.afr_hits += 1;
            }
            if let Some(kpa) = snapshot.fresh_value("map_kpa") {
                accum.map_sum += kpa;
                accum.map_hits += 1;
            }
        }

        Ok(bins.iter().map(|(k, a)| (*k, a.stats())).collect())
    }

    /// Generate a candidate for one map.
    ///
    /// The assembled candidate is validated as a whole grid against the
    /// safety envelope before it is returned; deltas that would trip a
    /// gradient rule against their neighbors are withdrawn, so an offered
    /// candidate always commits cleanly against its base version.
    ///
    /// All-or-nothing under cancellation: a cancelled run returns
    /// [`RecommendError::Cancelled`] and never a partial candidate.
    pub fn suggest(
        &self,
        history: &[Arc<Snapshot>],
        store: &MapStore,
        map_id: MapId,
        scorer: &dyn Scorer,
        cancel: &CancelToken,
    ) -> Result<Candidate, RecommendError> {
        let map = store.get(map_id)?;
        let envelope = store.envelope(map_id)?;
        let bins = self.bin_history(history, &map, cancel)?;

        let mut cells = Vec::new();
        for ((rpm_idx, load_idx), stats) in &bins {
            if cancel.is_cancelled() {
                return Err(RecommendError::Cancelled);
            }
            let confidence = self.policy.confidence(stats.hits);
            if confidence < self.policy.min_confidence {
                debug!(
                    rpm_idx, load_idx, hits = stats.hits,
                    "bin below confidence floor, skipped"
                );
                continue;
            }

            let Some(best) = resolve(scorer.score(map_id, stats)) else {
                continue;
            };

            let scaled = if self.policy.scale_delta_by_confidence {
                best.delta * confidence
            } else {
                best.delta
            };

            let current = map.cell(*rpm_idx, *load_idx)?;
            let proposed = clamp_to_envelope(current, current + scaled, envelope);
            if (proposed - current).abs() < 1e-9 {
                continue;
            }

            cells.push(CellDelta {
                rpm_idx: *rpm_idx,
                load_idx: *load_idx,
                current,
                proposed,
                confidence,
                rationale: best.rationale,
            });
        }

        let cells = prune_to_envelope(&map, envelope, cells);

        info!(map = %map_id, bins = bins.len(), proposals = cells.len(), "candidate generated");
        Ok(Candidate {
            map_id,
            base_version: map.version,
            cells,
        })
    }

    /// Generate candidates for every map in the store.
    ///
    /// Empty candidates are dropped. Cancellation aborts the whole batch.
    pub fn suggest_all(
        &self,
        history: &[Arc<Snapshot>],
        store: &MapStore,
        scorer: &dyn Scorer,
        cancel: &CancelToken,
    ) -> Result<Vec<Candidate>, RecommendError> {
        let mut candidates = Vec::new();
        for map_id in store.ids() {
            let candidate = self.suggest(history, store, map_id, scorer, cancel)?;
            if !candidate.is_empty() {
                candidates.push(candidate);
            }
        }
        Ok(candidates)
    }
}

impl Default for RecommendationEngine {
    fn default() -> Self {
        Self::new(ConfidencePolicy::default())
    }
}

/// Pick one delta for a cell when several rationales fire.
///
/// Competing deltas for a cell come from the same bin and so share its
/// confidence; the tie-break is conservative, keeping the smallest change.
fn resolve(scored: Vec<ScoredDelta>) -> Option<ScoredDelta> {
    scored.into_iter().min_by(|a, b| {
        a.delta
            .abs()
            .partial_cmp(&b.delta.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    })
}

/// Clamp a proposed value to the per-cell envelope rules
fn clamp_to_envelope(current: f64, proposed: f64, envelope: &SafetyEnvelope) -> f64 {
    let lo = (current - envelope.max_delta_per_version).max(envelope.min_value);
    let hi = (current + envelope.max_delta_per_version).min(envelope.max_value);
    proposed.clamp(lo, hi)
}

/// Withdraw proposed cells until the assembled grid clears the envelope.
///
/// Per-cell clamping already handles the bounds and the delta limit, but
/// the gradient rules couple neighboring cells and can only be checked on
/// the full grid. Every proposed cell touching a violated step is dropped
/// and the grid re-validated; each round strictly shrinks the set, so this
/// terminates.
fn prune_to_envelope(
    live: &TuningMap,
    envelope: &SafetyEnvelope,
    mut cells: Vec<CellDelta>,
) -> Vec<CellDelta> {
    while !cells.is_empty() {
        let mut values = live.values.clone();
        for cell in &cells {
            values[cell.rpm_idx][cell.load_idx] = cell.proposed;
        }
        let proposed = match TuningMap::new(
            live.id,
            live.name.clone(),
            live.rpm_bins.clone(),
            live.load_bins.clone(),
            values,
        ) {
            Ok(map) => map,
            Err(_) => return Vec::new(),
        };

        let violations = validate(Some(live), &proposed, envelope);
        if violations.is_empty() {
            break;
        }
        let before = cells.len();
        cells.retain(|cell| !violations.iter().any(|v| implicates(v, cell)));
        if cells.len() == before {
            // The live grid itself fails the envelope; nothing to offer
            debug!(map = %live.id, "live map violates envelope, candidate withdrawn");
            return Vec::new();
        }
    }
    cells
}

/// Whether a proposed cell is an endpoint of the violated rule
fn implicates(violation: &Violation, cell: &CellDelta) -> bool {
    let at = (cell.rpm_idx, cell.load_idx);
    let (r, l) = (violation.rpm_idx, violation.load_idx);
    match violation.rule {
        EnvelopeRule::RpmGradient => at == (r, l) || at == (r + 1, l),
        EnvelopeRule::LoadGradient => at == (r, l) || at == (r, l + 1),
        _ => at == (r, l),
    }
}
