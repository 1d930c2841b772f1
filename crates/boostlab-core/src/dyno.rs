//! Virtual dyno
//!
//! Estimates an engine torque curve from a logged wide-open pull and runs a
//! deterministic fixed-step longitudinal simulation over it: peak torque,
//! peak wheel horsepower, 0-60, and quarter mile. Pure function of the run
//! and the vehicle parameters; the same inputs always produce the same
//! numbers.

use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::telemetry::Snapshot;

/// Integration step (10 ms)
const TIME_STEP_S: f64 = 0.01;
/// Air density at sea level, kg/m^3
const AIR_DENSITY: f64 = 1.225;
/// Standing quarter mile in meters
const QUARTER_MILE_M: f64 = 402.336;
/// 60 mph in m/s
const SIXTY_MPH_MPS: f64 = 26.8224;
/// Gravity, m/s^2
const GRAVITY: f64 = 9.80665;
/// Longest gap tolerated between run snapshots
const MAX_GAP_MS: u64 = 150;
/// Manifold pressure the reference torque curve was fitted at (kPa absolute)
const REFERENCE_MAP_KPA: f64 = 180.0;
/// Give up if neither milestone is reached within this sim time
const SIM_LIMIT_S: f64 = 60.0;

/// Reference full-load torque curve (N*m at [`REFERENCE_MAP_KPA`])
const REFERENCE_CURVE: [(f64, f64); 6] = [
    (2000.0, 280.0),
    (3000.0, 380.0),
    (4000.0, 410.0),
    (5000.0, 380.0),
    (6000.0, 320.0),
    (6500.0, 280.0),
];

/// Errors from dyno runs
#[derive(Error, Debug)]
pub enum DynoError {
    /// The log slice cannot support an estimate
    #[error("insufficient data: {0}")]
    InsufficientData(String),
}

/// Vehicle parameters for the longitudinal model
#[derive(Debug, Clone, PartialEq)]
pub struct VehicleParams {
    /// Curb mass plus driver, kg
    pub mass_kg: f64,
    /// Aerodynamic drag coefficient
    pub drag_coefficient: f64,
    /// Frontal area, m^2
    pub frontal_area_m2: f64,
    /// Driven wheel radius, m
    pub wheel_radius_m: f64,
    /// Final drive ratio
    pub final_drive: f64,
    /// Forward gear ratios, first gear first
    pub gear_ratios: Vec<f64>,
    /// Driveline loss fraction (0.15 = 15% lost between crank and wheels)
    pub driveline_loss: f64,
    /// Rolling resistance coefficient
    pub rolling_resistance: f64,
    /// Engine speed where the simulation upshifts
    pub shift_rpm: f64,
    /// Clutch-slip floor: engine speed never drops below this in gear 1
    pub launch_rpm: f64,
}

impl Default for VehicleParams {
    fn default() -> Self {
        // Stock Mazdaspeed-class hot hatch
        Self {
            mass_kg: 1450.0,
            drag_coefficient: 0.31,
            frontal_area_m2: 2.2,
            wheel_radius_m: 0.33,
            final_drive: 4.11,
            gear_ratios: vec![3.33, 1.99, 1.35, 1.03, 0.81, 0.67],
            driveline_loss: 0.15,
            rolling_resistance: 0.015,
            shift_rpm: 6500.0,
            launch_rpm: 2000.0,
        }
    }
}

/// One point of the estimated torque curve
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurvePoint {
    /// Engine speed
    pub rpm: f64,
    /// Crank torque estimate, N*m
    pub torque_nm: f64,
}

/// A contiguous slice of telemetry identified as a pull
#[derive(Debug, Clone)]
pub struct DynoRun {
    /// Run identity, for the session browser
    pub id: Uuid,
    snapshots: Vec<Arc<Snapshot>>,
}

impl DynoRun {
    /// Validate a history slice as a usable pull.
    ///
    /// Every snapshot must carry a value for RPM and manifold pressure, and
    /// no two consecutive snapshots may be more than 150 ms apart; a torque
    /// estimate across a sampling hole would be fiction.
    pub fn from_history(snapshots: Vec<Arc<Snapshot>>) -> Result<Self, DynoError> {
        if snapshots.len() < 2 {
            return Err(DynoError::InsufficientData(format!(
                "need at least 2 snapshots, got {}",
                snapshots.len()
            )));
        }
        for snapshot in &snapshots {
            if snapshot.value("rpm").is_none() || snapshot.value("map_kpa").is_none() {
                return Err(DynoError::InsufficientData(format!(
                    "snapshot {} is missing rpm or map_kpa",
                    snapshot.seq
                )));
            }
        }
        for pair in snapshots.windows(2) {
            let gap = pair[1].timestamp.saturating_sub(pair[0].timestamp);
            if gap.as_millis() as u64 > MAX_GAP_MS {
                return Err(DynoError::InsufficientData(format!(
                    "{} ms gap between snapshots {} and {}",
                    gap.as_millis(),
                    pair[0].seq,
                    pair[1].seq
                )));
            }
        }
        Ok(Self {
            id: Uuid::new_v4(),
            snapshots,
        })
    }

    /// Number of snapshots in the run
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Whether the run holds no snapshots (never true after construction)
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Estimate the crank torque curve from the logged RPM/boost trace.
    ///
    /// The reference full-load curve is scaled by the observed manifold
    /// pressure at each sample, then the samples are sorted by RPM.
    pub fn torque_curve(&self) -> Vec<CurvePoint> {
        let mut points: Vec<CurvePoint> = self
            .snapshots
            .iter()
            .filter_map(|s| {
                let rpm = s.value("rpm")?;
                let kpa = s.value("map_kpa")?;
                Some(CurvePoint {
                    rpm,
                    torque_nm: reference_torque(rpm) * (kpa / REFERENCE_MAP_KPA),
                })
            })
            .collect();
        points.sort_by(|a, b| a.rpm.partial_cmp(&b.rpm).unwrap_or(std::cmp::Ordering::Equal));
        points
    }
}

/// Simulation output
#[derive(Debug, Clone, PartialEq)]
pub struct DynoResult {
    /// Run this result was computed from
    pub run_id: Uuid,
    /// Estimated crank torque curve, RPM-ordered
    pub torque_curve: Vec<CurvePoint>,
    /// Wheel horsepower curve as (rpm, hp), RPM-ordered
    pub power_curve: Vec<(f64, f64)>,
    /// Peak crank torque, N*m
    pub peak_torque_nm: f64,
    /// Engine speed at peak torque
    pub peak_torque_rpm: f64,
    /// Peak wheel horsepower
    pub peak_wheel_hp: f64,
    /// Engine speed at peak wheel horsepower
    pub peak_hp_rpm: f64,
    /// 0-60 mph time, seconds; `None` if never reached in the sim window
    pub zero_to_sixty_s: Option<f64>,
    /// Standing quarter mile time, seconds; `None` if never reached
    pub quarter_mile_s: Option<f64>,
    /// Speed crossing the quarter mile, m/s
    pub quarter_mile_trap_mps: Option<f64>,
}

/// Run the virtual dyno over a pull
pub fn simulate(run: &DynoRun, params: &VehicleParams) -> Result<DynoResult, DynoError> {
    let curve = run.torque_curve();
    if curve.len() < 2 {
        return Err(DynoError::InsufficientData(
            "torque curve needs at least 2 points".to_string(),
        ));
    }

    let (peak_torque_rpm, peak_torque_nm) = curve
        .iter()
        .map(|p| (p.rpm, p.torque_nm))
        .fold((0.0, f64::MIN), |best, p| if p.1 > best.1 { p } else { best });
    let power_curve: Vec<(f64, f64)> = curve
        .iter()
        .map(|p| (p.rpm, wheel_hp(p.torque_nm, p.rpm, params.driveline_loss)))
        .collect();
    let (peak_hp_rpm, peak_wheel_hp) = power_curve
        .iter()
        .copied()
        .fold((0.0, f64::MIN), |best, p| if p.1 > best.1 { p } else { best });

    let (zero_to_sixty_s, quarter_mile_s, quarter_mile_trap_mps) =
        integrate_acceleration(&curve, params);

    debug!(
        run = %run.id,
        peak_torque_nm,
        peak_wheel_hp,
        "dyno simulation complete"
    );
    Ok(DynoResult {
        run_id: run.id,
        torque_curve: curve,
        power_curve,
        peak_torque_nm,
        peak_torque_rpm,
        peak_wheel_hp,
        peak_hp_rpm,
        zero_to_sixty_s,
        quarter_mile_s,
        quarter_mile_trap_mps,
    })
}

fn integrate_acceleration(
    curve: &[CurvePoint],
    params: &VehicleParams,
) -> (Option<f64>, Option<f64>, Option<f64>) {
    let mut velocity = 0.0_f64;
    let mut distance = 0.0_f64;
    let mut time = 0.0_f64;
    let mut gear = 0_usize;
    let mut zero_to_sixty = None;
    let mut quarter = None;
    let mut trap = None;

    while (zero_to_sixty.is_none() || quarter.is_none()) && time < SIM_LIMIT_S {
        let ratio = params.gear_ratios[gear] * params.final_drive;
        let wheel_rps = velocity / (2.0 * std::f64::consts::PI * params.wheel_radius_m);
        let mut rpm = wheel_rps * 60.0 * ratio;
        if gear == 0 && rpm < params.launch_rpm {
            rpm = params.launch_rpm;
        }
        if rpm >= params.shift_rpm && gear + 1 < params.gear_ratios.len() {
            gear += 1;
            continue;
        }

        let torque = torque_at(curve, rpm);
        let drive_force =
            torque * ratio * (1.0 - params.driveline_loss) / params.wheel_radius_m;
        let drag = 0.5
            * AIR_DENSITY
            * params.drag_coefficient
            * params.frontal_area_m2
            * velocity
            * velocity;
        let rolling = params.rolling_resistance * params.mass_kg * GRAVITY;
        let accel = ((drive_force - drag - rolling) / params.mass_kg).max(0.0);

        let next_velocity = velocity + accel * TIME_STEP_S;
        let next_distance = distance + velocity * TIME_STEP_S + 0.5 * accel * TIME_STEP_S * TIME_STEP_S;
        let next_time = time + TIME_STEP_S;

        if zero_to_sixty.is_none() && next_velocity >= SIXTY_MPH_MPS {
            // Linear sub-step interpolation for the crossing instant
            let frac = (SIXTY_MPH_MPS - velocity) / (next_velocity - velocity);
            zero_to_sixty = Some(time + frac * TIME_STEP_S);
        }
        if quarter.is_none() && next_distance >= QUARTER_MILE_M {
            let frac = (QUARTER_MILE_M - distance) / (next_distance - distance);
            quarter = Some(time + frac * TIME_STEP_S);
            trap = Some(velocity + frac * (next_velocity - velocity));
        }

        // Flat ground, no torque at the wheels: the run is over
        if accel <= 0.0 && velocity > 0.0 {
            break;
        }

        velocity = next_velocity;
        distance = next_distance;
        time = next_time;
    }

    (zero_to_sixty, quarter, trap)
}

fn wheel_hp(crank_torque_nm: f64, rpm: f64, driveline_loss: f64) -> f64 {
    // hp = T[N*m] * rpm / 7127
    crank_torque_nm * (1.0 - driveline_loss) * rpm / 7127.0
}

fn reference_torque(rpm: f64) -> f64 {
    let first = REFERENCE_CURVE[0];
    let last = REFERENCE_CURVE[REFERENCE_CURVE.len() - 1];
    if rpm <= first.0 {
        return first.1;
    }
    if rpm >= last.0 {
        return last.1;
    }
    for pair in REFERENCE_CURVE.windows(2) {
        let (r0, t0) = pair[0];
        let (r1, t1) = pair[1];
        if rpm >= r0 && rpm <= r1 {
            let frac = (rpm - r0) / (r1 - r0);
            return t0 + frac * (t1 - t0);
        }
    }
    last.1
}

/// Interpolated torque at an engine speed, clamped to the curve's ends
fn torque_at(curve: &[CurvePoint], rpm: f64) -> f64 {
    let first = curve[0];
    let last = curve[curve.len() - 1];
    if rpm <= first.rpm {
        return first.torque_nm;
    }
    if rpm >= last.rpm {
        return last.torque_nm;
    }
    for pair in curve.windows(2) {
        if rpm >= pair[0].rpm && rpm <= pair[1].rpm {
            let span = pair[1].rpm - pair[0].rpm;
            if span.abs() < f64::EPSILON {
                return pair[0].torque_nm;
            }
            let frac = (rpm - pair[0].rpm) / span;
            return pair[0].torque_nm + frac * (pair[1].torque_nm - pair[0].torque_nm);
        }
    }
    last.torque_nm
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::SampledValue;
    use std::time::Duration;

    fn snap(seq: u64, ms: u64, rpm: f64, kpa: f64) -> Arc<Snapshot> {
        let mut values = std::collections::BTreeMap::new();
        values.insert("rpm".into(), SampledValue::fresh(rpm));
        values.insert("map_kpa".into(), SampledValue::fresh(kpa));
        Arc::new(Snapshot {
            seq,
            timestamp: Duration::from_millis(ms),
            values,
        })
    }

    /// A clean third-gear pull, 100 ms cadence, full boost
    fn pull() -> Vec<Arc<Snapshot>> {
        (0..40)
            .map(|i| {
                let rpm = 2500.0 + i as f64 * 100.0;
                snap(i, 100 * i as u64, rpm, 175.0)
            })
            .collect()
    }

    #[test]
    fn test_run_accepts_clean_pull() {
        let run = DynoRun::from_history(pull()).unwrap();
        assert_eq!(run.len(), 40);
    }

    #[test]
    fn test_gap_rejected() {
        let mut snapshots = pull();
        // 200 ms hole in the middle
        let mut s = (*snapshots[20]).clone();
        s.timestamp += Duration::from_millis(100);
        snapshots[20] = Arc::new(s);

        match DynoRun::from_history(snapshots) {
            Err(DynoError::InsufficientData(msg)) => assert!(msg.contains("gap")),
            other => panic!("expected gap rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_channel_rejected() {
        let mut snapshots = pull();
        let mut s = (*snapshots[5]).clone();
        s.values.insert("map_kpa".into(), SampledValue::missing());
        snapshots[5] = Arc::new(s);
        assert!(matches!(
            DynoRun::from_history(snapshots),
            Err(DynoError::InsufficientData(_))
        ));
    }

    #[test]
    fn test_simulation_is_deterministic() {
        let run = DynoRun::from_history(pull()).unwrap();
        let params = VehicleParams::default();
        let a = simulate(&run, &params).unwrap();
        let b = simulate(&run, &params).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_peaks_are_plausible() {
        let run = DynoRun::from_history(pull()).unwrap();
        let result = simulate(&run, &VehicleParams::default()).unwrap();

        // 175 kPa trace against a 410 N*m @ 180 kPa reference
        assert!(result.peak_torque_nm > 350.0 && result.peak_torque_nm < 410.0);
        assert!((result.peak_torque_rpm - 4000.0).abs() < 200.0);
        assert!(result.peak_wheel_hp > 200.0 && result.peak_wheel_hp < 300.0);
    }

    #[test]
    fn test_milestones_reached_and_ordered() {
        let run = DynoRun::from_history(pull()).unwrap();
        let result = simulate(&run, &VehicleParams::default()).unwrap();

        let sixty = result.zero_to_sixty_s.expect("should reach 60 mph");
        let quarter = result.quarter_mile_s.expect("should finish the quarter");
        assert!(sixty > 3.0 && sixty < 9.0, "0-60 of {sixty}s is implausible");
        assert!(quarter > sixty, "quarter mile cannot beat 0-60");
        assert!(quarter < 17.0, "quarter of {quarter}s is implausible");
        assert!(result.quarter_mile_trap_mps.unwrap() > SIXTY_MPH_MPS);
    }

    #[test]
    fn test_heavier_car_is_slower() {
        let run = DynoRun::from_history(pull()).unwrap();
        let stock = simulate(&run, &VehicleParams::default()).unwrap();
        let heavy = simulate(
            &run,
            &VehicleParams {
                mass_kg: 1800.0,
                ..VehicleParams::default()
            },
        )
        .unwrap();
        assert!(heavy.zero_to_sixty_s.unwrap() > stock.zero_to_sixty_s.unwrap());
    }

    #[test]
    fn test_two_snapshots_minimum() {
        assert!(matches!(
            DynoRun::from_history(vec![snap(0, 0, 3000.0, 150.0)]),
            Err(DynoError::InsufficientData(_))
        ));
    }
}
