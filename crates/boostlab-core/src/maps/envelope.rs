//! Safety envelope
//!
//! Pure validation of a proposed map grid against hard hardware limits.
//! The validator reports every violated cell in one pass so a rejected
//! write can be corrected without a guess-and-retry loop. Envelopes gate
//! writes only; reads of an already-live map are never blocked.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{MapId, TuningMap};

/// Which limit a cell violated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeRule {
    /// Below the absolute floor for this map
    BelowMinimum,
    /// Above the absolute ceiling for this map
    AboveMaximum,
    /// Changed too much from the currently live version in one commit
    DeltaTooLarge,
    /// Too steep a step between adjacent RPM rows
    RpmGradient,
    /// Too steep a step between adjacent load columns
    LoadGradient,
}

impl fmt::Display for EnvelopeRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvelopeRule::BelowMinimum => write!(f, "below minimum"),
            EnvelopeRule::AboveMaximum => write!(f, "above maximum"),
            EnvelopeRule::DeltaTooLarge => write!(f, "delta too large"),
            EnvelopeRule::RpmGradient => write!(f, "rpm gradient too steep"),
            EnvelopeRule::LoadGradient => write!(f, "load gradient too steep"),
        }
    }
}

/// One violated cell, with the value seen and the limit it broke
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    /// RPM axis index of the offending cell
    pub rpm_idx: usize,
    /// Load axis index of the offending cell
    pub load_idx: usize,
    /// Which rule failed
    pub rule: EnvelopeRule,
    /// The offending value (for gradients and deltas, the magnitude)
    pub value: f64,
    /// The limit that applied
    pub limit: f64,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cell ({}, {}): {} ({} vs limit {})",
            self.rpm_idx, self.load_idx, self.rule, self.value, self.limit
        )
    }
}

/// Hard limits applied to every proposed version of one map.
///
/// Scalar bounds apply uniformly; the optional per-cell grids tighten them
/// where fitted (e.g. pulling boost down at high RPM where the K04 runs out
/// of compressor map).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyEnvelope {
    /// Absolute floor for any cell
    pub min_value: f64,
    /// Absolute ceiling for any cell
    pub max_value: f64,
    /// Largest change any single cell may make relative to the live version
    pub max_delta_per_version: f64,
    /// Largest step between adjacent cells along the RPM axis
    pub max_rpm_gradient: f64,
    /// Largest step between adjacent cells along the load axis
    pub max_load_gradient: f64,
    /// Optional per-cell floors, same shape as the map grid
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell_min: Option<Vec<Vec<f64>>>,
    /// Optional per-cell ceilings, same shape as the map grid
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell_max: Option<Vec<Vec<f64>>>,
}

impl SafetyEnvelope {
    /// Stock-hardware envelope for a map
    pub fn default_for(id: MapId) -> Self {
        match id {
            // 185 kPa absolute is ~12 psi of boost, the K04's safe ceiling
            MapId::BoostTarget => Self {
                min_value: 80.0,
                max_value: 185.0,
                max_delta_per_version: 10.0,
                max_rpm_gradient: 30.0,
                max_load_gradient: 30.0,
                cell_min: None,
                cell_max: None,
            },
            MapId::IgnitionTiming => Self {
                min_value: -5.0,
                max_value: 35.0,
                max_delta_per_version: 2.0,
                max_rpm_gradient: 5.0,
                max_load_gradient: 5.0,
                cell_min: None,
                cell_max: None,
            },
        }
    }

    fn floor_at(&self, r: usize, l: usize) -> f64 {
        self.cell_min
            .as_ref()
            .and_then(|g| g.get(r).and_then(|row| row.get(l)).copied())
            .map_or(self.min_value, |cell| cell.max(self.min_value))
    }

    fn ceiling_at(&self, r: usize, l: usize) -> f64 {
        self.cell_max
            .as_ref()
            .and_then(|g| g.get(r).and_then(|row| row.get(l)).copied())
            .map_or(self.max_value, |cell| cell.min(self.max_value))
    }
}

/// Validate a proposed map against the envelope.
///
/// `current` is the live version the delta rule measures against; pass
/// `None` when seeding a store, which skips the delta rule. Returns every
/// violation found; an empty vec means the proposal is acceptable.
pub fn validate(
    current: Option<&TuningMap>,
    proposed: &TuningMap,
    envelope: &SafetyEnvelope,
) -> Vec<Violation> {
    let mut violations = Vec::new();
    let (rows, cols) = proposed.dims();

    for r in 0..rows {
        for l in 0..cols {
            let v = proposed.values[r][l];

            let floor = envelope.floor_at(r, l);
            if v < floor {
                violations.push(Violation {
                    rpm_idx: r,
                    load_idx: l,
                    rule: EnvelopeRule::BelowMinimum,
                    value: v,
                    limit: floor,
                });
            }
            let ceiling = envelope.ceiling_at(r, l);
            if v > ceiling {
                violations.push(Violation {
                    rpm_idx: r,
                    load_idx: l,
                    rule: EnvelopeRule::AboveMaximum,
                    value: v,
                    limit: ceiling,
                });
            }

            if let Some(live) = current {
                if let (Ok(old), true) = (live.cell(r, l), live.dims() == proposed.dims()) {
                    let delta = (v - old).abs();
                    if delta > envelope.max_delta_per_version {
                        violations.push(Violation {
                            rpm_idx: r,
                            load_idx: l,
                            rule: EnvelopeRule::DeltaTooLarge,
                            value: delta,
                            limit: envelope.max_delta_per_version,
                        });
                    }
                }
            }

            if r + 1 < rows {
                let step = (proposed.values[r + 1][l] - v).abs();
                if step > envelope.max_rpm_gradient {
                    violations.push(Violation {
                        rpm_idx: r,
                        load_idx: l,
                        rule: EnvelopeRule::RpmGradient,
                        value: step,
                        limit: envelope.max_rpm_gradient,
                    });
                }
            }
            if l + 1 < cols {
                let step = (proposed.values[r][l + 1] - v).abs();
                if step > envelope.max_load_gradient {
                    violations.push(Violation {
                        rpm_idx: r,
                        load_idx: l,
                        rule: EnvelopeRule::LoadGradient,
                        value: step,
                        limit: envelope.max_load_gradient,
                    });
                }
            }
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maps::MapId;

    fn flat_map(value: f64) -> TuningMap {
        TuningMap::new(
            MapId::BoostTarget,
            "test",
            vec![2000.0, 4000.0, 6000.0],
            vec![50.0, 100.0],
            vec![vec![value; 2]; 3],
        )
        .expect("valid map")
    }

    fn envelope() -> SafetyEnvelope {
        SafetyEnvelope::default_for(MapId::BoostTarget)
    }

    #[test]
    fn test_clean_proposal_passes() {
        let live = flat_map(100.0);
        let mut proposed = flat_map(100.0);
        proposed.values[1][1] = 108.0;
        assert!(validate(Some(&live), &proposed, &envelope()).is_empty());
    }

    #[test]
    fn test_delta_limit_enforced() {
        // Live cell at 100, proposal at 115 with a 10-unit delta limit
        let live = flat_map(100.0);
        let mut proposed = flat_map(100.0);
        proposed.values[0][0] = 115.0;

        let violations = validate(Some(&live), &proposed, &envelope());
        assert!(violations
            .iter()
            .any(|v| v.rule == EnvelopeRule::DeltaTooLarge && v.rpm_idx == 0 && v.load_idx == 0));
    }

    #[test]
    fn test_absolute_bounds_enforced() {
        let mut proposed = flat_map(100.0);
        proposed.values[0][0] = 190.0;
        proposed.values[2][1] = 70.0;

        let violations = validate(None, &proposed, &envelope());
        assert!(violations.iter().any(|v| v.rule == EnvelopeRule::AboveMaximum));
        assert!(violations.iter().any(|v| v.rule == EnvelopeRule::BelowMinimum));
    }

    #[test]
    fn test_gradient_enforced() {
        let mut proposed = flat_map(100.0);
        proposed.values[1][0] = 140.0;

        let violations = validate(None, &proposed, &envelope());
        assert!(violations.iter().any(|v| v.rule == EnvelopeRule::RpmGradient));
        assert!(violations.iter().any(|v| v.rule == EnvelopeRule::LoadGradient));
    }

    #[test]
    fn test_all_violations_reported_in_one_pass() {
        let live = flat_map(100.0);
        let mut proposed = flat_map(100.0);
        proposed.values[0][0] = 115.0;
        proposed.values[2][1] = 190.0;

        let violations = validate(Some(&live), &proposed, &envelope());
        let cells: Vec<_> = violations.iter().map(|v| (v.rpm_idx, v.load_idx)).collect();
        assert!(cells.contains(&(0, 0)));
        assert!(cells.contains(&(2, 1)));
    }

    #[test]
    fn test_per_cell_ceiling_tightens_scalar() {
        let mut env = envelope();
        env.cell_max = Some(vec![
            vec![185.0, 185.0],
            vec![185.0, 185.0],
            vec![185.0, 150.0],
        ]);

        let mut proposed = flat_map(140.0);
        proposed.values[2][1] = 160.0;

        let violations = validate(None, &proposed, &env);
        assert!(violations
            .iter()
            .any(|v| v.rule == EnvelopeRule::AboveMaximum && v.limit == 150.0));
    }

    #[test]
    fn test_seed_skips_delta_rule() {
        let proposed = flat_map(150.0);
        assert!(validate(None, &proposed, &envelope()).is_empty());
    }
}
