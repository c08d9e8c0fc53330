//! Scenario tests for the schedule optimizer
//!
//! Includes:
//! - Regime classification properties over dense sweeps
//! - Pinned rotor speed and rating invariants per regime
//! - Fallback paths when rating cannot be reached
//! - Serial/parallel equivalence and failure isolation
//! - End-to-end sweep, loads and writers

use std::collections::HashSet;
use std::thread;
use std::time::Duration;

use crate::analytic::AnalyticRotor;
use crate::error::ScheduleError;
use crate::evaluator::{
    Coefficients, DistributedLoads, Evaluator, EvaluatorError, PerformanceOutputs,
};
use crate::io;
use crate::loads::compute_blade_loads;
use crate::numerics::{linspace, Tolerances};
use crate::rotor::RotorLimits;
use crate::schedule::{ControlOptimizer, Execution, OptimizerSettings};
use crate::solvers::Fallback;
use crate::zones::{Mode, Zone};

const TIP_RADIUS: f64 = 60.0;
const MAX_TIP_SPEED: f64 = 95.0;
/// rpm. 2 rpm at 60 m is a 12.6 m/s tip speed, which would put 2 m/s inside
/// the fixed-TSR band; 4 rpm keeps it in the low regime.
const OMEGA_MIN: f64 = 4.0;

fn limits() -> RotorLimits {
    RotorLimits::new(OMEGA_MIN, MAX_TIP_SPEED, TIP_RADIUS, 0.0, 30.0)
}

fn optimizer<E: Evaluator>(
    evaluator: E,
    rated_power: f64,
    execution: Execution,
) -> ControlOptimizer<E> {
    let settings = OptimizerSettings {
        tip_radius: TIP_RADIUS,
        max_tip_speed: MAX_TIP_SPEED,
        rated_power,
        execution,
        ..Default::default()
    };
    ControlOptimizer::new(evaluator, limits(), settings)
}

fn rotor() -> AnalyticRotor {
    AnalyticRotor::new(TIP_RADIUS, 1.5, 3, 1.225)
}

/// Regime order with upper and high sharing a rank
fn rank(zone: Zone) -> u8 {
    match zone {
        Zone::Low => 0,
        Zone::Mid => 1,
        Zone::Upper | Zone::High => 2,
    }
}

// =============================================================================
// Test evaluators
// =============================================================================

/// Same power everywhere, uniform unit loads
struct ConstantPower(f64);

impl Evaluator for ConstantPower {
    fn evaluate(
        &self,
        wind_speeds: &[f64],
        _rotor_speeds: &[f64],
        _pitches: &[f64],
        want_coefficients: bool,
    ) -> Result<PerformanceOutputs, EvaluatorError> {
        let n = wind_speeds.len();
        Ok(PerformanceOutputs {
            power: vec![self.0; n],
            thrust: vec![1.0e5; n],
            blade_moment: vec![1.0e6; n],
            coefficients: want_coefficients.then(|| Coefficients {
                ct: vec![0.8; n],
                cp: vec![0.4; n],
            }),
        })
    }

    fn distributed_loads(
        &self,
        _: f64,
        _: f64,
        _: f64,
        _: f64,
    ) -> Result<DistributedLoads, EvaluatorError> {
        let r = linspace(0.0, TIP_RADIUS, 50);
        Ok(DistributedLoads {
            np: vec![1.0; r.len()],
            tp: vec![1.0; r.len()],
            r,
        })
    }
}

/// Analytic rotor that fails at a few exact wind speeds
struct FailingAt {
    inner: AnalyticRotor,
    bad: Vec<f64>,
    /// Wind speeds whose spanwise loads fail; performance still works
    bad_loads: Vec<f64>,
}

impl Evaluator for FailingAt {
    fn evaluate(
        &self,
        wind_speeds: &[f64],
        rotor_speeds: &[f64],
        pitches: &[f64],
        want_coefficients: bool,
    ) -> Result<PerformanceOutputs, EvaluatorError> {
        if let Some(u) = wind_speeds.iter().find(|u| self.bad.contains(u)) {
            return Err(EvaluatorError::Failed(format!("no convergence at {u} m/s")));
        }
        self.inner.evaluate(wind_speeds, rotor_speeds, pitches, want_coefficients)
    }

    fn distributed_loads(
        &self,
        wind_speed: f64,
        rotor_speed: f64,
        pitch: f64,
        azimuth: f64,
    ) -> Result<DistributedLoads, EvaluatorError> {
        if self.bad_loads.contains(&wind_speed) {
            return Err(EvaluatorError::Failed(format!("no loads at {wind_speed} m/s")));
        }
        self.inner.distributed_loads(wind_speed, rotor_speed, pitch, azimuth)
    }
}

/// Analytic rotor whose final evaluation takes longer at low wind speeds,
/// so parallel workers finish in reverse order.
struct Sluggish(AnalyticRotor);

impl Evaluator for Sluggish {
    fn evaluate(
        &self,
        wind_speeds: &[f64],
        rotor_speeds: &[f64],
        pitches: &[f64],
        want_coefficients: bool,
    ) -> Result<PerformanceOutputs, EvaluatorError> {
        if want_coefficients {
            let u = wind_speeds.first().copied().unwrap_or(0.0);
            thread::sleep(Duration::from_millis((30.0 - u).max(0.0) as u64));
        }
        self.0.evaluate(wind_speeds, rotor_speeds, pitches, want_coefficients)
    }

    fn distributed_loads(
        &self,
        wind_speed: f64,
        rotor_speed: f64,
        pitch: f64,
        azimuth: f64,
    ) -> Result<DistributedLoads, EvaluatorError> {
        self.0.distributed_loads(wind_speed, rotor_speed, pitch, azimuth)
    }
}

struct Broken;

impl Evaluator for Broken {
    fn evaluate(
        &self,
        _: &[f64],
        _: &[f64],
        _: &[f64],
        _: bool,
    ) -> Result<PerformanceOutputs, EvaluatorError> {
        Err(EvaluatorError::Failed("model unavailable".into()))
    }

    fn distributed_loads(
        &self,
        _: f64,
        _: f64,
        _: f64,
        _: f64,
    ) -> Result<DistributedLoads, EvaluatorError> {
        Err(EvaluatorError::Failed("model unavailable".into()))
    }
}

// =============================================================================
// Scenario
// =============================================================================

#[test]
fn test_four_speed_scenario_4rpm_floor() {
    // Rotor speed floor is 4 rpm rather than 2; see OMEGA_MIN
    let sweep = [2.0, 6.0, 12.0, 20.0];
    let mut opt = optimizer(rotor(), 1.0e7, Execution::Serial);
    opt.initialize(&sweep).unwrap();

    let zones: Vec<Mode> = sweep.iter().map(|&u| opt.process(u).unwrap().setpoint.zone).collect();
    assert_eq!(zones[0], Mode::Regime(Zone::Low));
    assert_eq!(zones[1], Mode::Regime(Zone::Mid));
    assert!(matches!(zones[2], Mode::Regime(Zone::Mid | Zone::Upper)));
    assert!(matches!(zones[3], Mode::Regime(Zone::Upper | Zone::High)));

    for &u in &sweep {
        let point = opt.process(u).unwrap();
        let value = serde_json::to_value(point.setpoint).unwrap();
        assert_eq!(value.as_object().unwrap().len(), 10, "setpoint must have ten fields");
        assert_eq!(point.setpoint.uinf, u);
        assert!(point.setpoint.iterations > 0);
    }
}

#[test]
fn test_scenario_boundaries() {
    let mut opt = optimizer(rotor(), 1.0e7, Execution::Serial);
    let cal = *opt.initialize(&[2.0, 6.0, 12.0, 20.0]).unwrap();
    let l = limits();

    // omega_max from 95 m/s at 60 m is ~15.12 rpm
    assert!((l.omega_max - 15.1197).abs() < 1e-3);
    assert!(cal.boundaries.uinf_low < 6.0 && 6.0 < cal.boundaries.uinf_high);
    assert!(cal.boundaries.switch_found);
    assert!(cal.boundaries.uinf_switch > cal.boundaries.uinf_high);
    assert!(cal.boundaries.uinf_switch < 20.0);
    assert!(cal.reference_converged);
}

// =============================================================================
// Classification properties
// =============================================================================

#[test]
fn test_regime_monotonicity() {
    let sweep: Vec<f64> = (4..=60).map(|i| i as f64 * 0.5).collect();
    let mut opt = optimizer(rotor(), 1.0e7, Execution::Serial);
    let b = opt.initialize(&sweep).unwrap().boundaries;

    let mut prev = 0;
    for &u in &sweep {
        let zone = opt.classify(u).unwrap();
        assert!(rank(zone) >= prev, "regime order broken at {u} m/s");
        prev = rank(zone);
        if u < b.uinf_low {
            assert_eq!(zone, Zone::Low);
        }
        if u > b.uinf_high {
            assert!(zone != Zone::Low && zone != Zone::Mid);
        }
    }

    let seen: HashSet<Zone> = sweep.iter().map(|&u| opt.classify(u).unwrap()).collect();
    assert_eq!(seen.len(), 4, "dense sweep should visit every regime");
}

#[test]
fn test_pinned_speed_exact() {
    let sweep: Vec<f64> = vec![2.0, 2.5, 3.0, 6.0, 12.0, 13.0, 18.0, 24.0];
    let mut opt = optimizer(rotor(), 1.0e7, Execution::Serial);
    let outcome = opt.run_sweep(&sweep).unwrap();
    let l = limits();

    for point in outcome.solved() {
        let sp = &point.setpoint;
        match sp.zone {
            Mode::Regime(Zone::Low) => assert_eq!(sp.omega, l.omega_min),
            Mode::Regime(Zone::Upper | Zone::High) => assert_eq!(sp.omega, l.omega_max),
            Mode::Regime(Zone::Mid) => {
                assert!(sp.omega >= l.omega_min && sp.omega <= l.omega_max)
            }
            Mode::Fixed => panic!("sweep produced a fixed point"),
        }
        assert!(sp.pitch >= l.pitch_min && sp.pitch <= l.pitch_max);
    }
}

#[test]
fn test_mid_tracks_optimal_tsr() {
    let sweep = [4.0, 6.0, 8.0, 10.0];
    let mut opt = optimizer(rotor(), 1.0e7, Execution::Serial);
    let outcome = opt.run_sweep(&sweep).unwrap();
    let tsr_opt = outcome.calibration.reference.tsr_opt;

    for point in outcome.solved().filter(|p| p.setpoint.zone == Mode::Regime(Zone::Mid)) {
        let sp = &point.setpoint;
        let tsr = crate::rotor::omega_to_tsr(sp.omega, sp.uinf, TIP_RADIUS);
        assert!((tsr - tsr_opt).abs() / tsr_opt < 0.02, "tsr {tsr} vs {tsr_opt} at {}", sp.uinf);
        assert!(sp.cp > 0.47);
    }
}

#[test]
fn test_high_holds_rated_power() {
    let rated = 1.0e7;
    let mut opt = optimizer(rotor(), rated, Execution::Serial);
    let outcome = opt.run_sweep(&[6.0, 18.0, 22.0, 25.0]).unwrap();

    let high: Vec<_> = outcome
        .solved()
        .filter(|p| p.setpoint.zone == Mode::Regime(Zone::High))
        .collect();
    assert!(!high.is_empty());
    for point in high {
        assert!(point.fallback.is_none());
        assert!((point.setpoint.power - rated).abs() / rated < 1e-3);
        assert!(point.setpoint.pitch > 0.0);
    }
}

// =============================================================================
// Fallbacks
// =============================================================================

#[test]
fn test_switch_fallback_when_rating_unreachable() {
    let sweep = [2.0, 6.0, 12.0, 16.0, 20.0, 24.0];
    let mut opt = optimizer(rotor(), 1.0e12, Execution::Serial);
    let outcome = opt.run_sweep(&sweep).unwrap();

    assert_eq!(outcome.calibration.boundaries.uinf_switch, 24.0);
    assert!(!outcome.calibration.boundaries.switch_found);
    assert!(outcome
        .solved()
        .all(|p| p.setpoint.zone != Mode::Regime(Zone::High)));
    assert_eq!(outcome.failure_count(), 0);
}

#[test]
fn test_high_fallback_flagged() {
    // Twice rating at every pitch: no pitch brings power down to rating
    let rated = 5.0e6;
    let sweep = [6.0, 30.0, 40.0];
    let mut opt = optimizer(ConstantPower(2.0 * rated), rated, Execution::Serial);
    let outcome = opt.run_sweep(&sweep).unwrap();

    assert_eq!(outcome.calibration.boundaries.uinf_switch, 40.0);
    let last = outcome.points[2].as_ref().unwrap();
    assert_eq!(last.setpoint.zone, Mode::Regime(Zone::High));
    assert_eq!(last.fallback, Some(Fallback::PowerLimited));
    assert_eq!(last.setpoint.omega, limits().omega_max);
}

// =============================================================================
// Execution
// =============================================================================

#[test]
fn test_order_preserved_serial_vs_parallel() {
    let sweep = [3.0, 5.0, 7.0, 9.0, 11.0, 14.0, 17.0, 21.0];

    let mut serial = optimizer(Sluggish(rotor()), 1.0e7, Execution::Serial);
    let mut parallel = optimizer(Sluggish(rotor()), 1.0e7, Execution::Parallel { threads: 4 });
    let a = serial.run_sweep(&sweep).unwrap();
    let b = parallel.run_sweep(&sweep).unwrap();

    let order: Vec<f64> = b.solved().map(|p| p.setpoint.uinf).collect();
    assert_eq!(order, sweep.to_vec());
    assert_eq!(a.calibration, b.calibration);
    // Bit-identical setpoints, not merely close
    assert_eq!(a.setpoints(), b.setpoints());
}

#[test]
fn test_failure_isolated_per_wind_speed() {
    let sweep = [4.0, 6.0, 10.0, 14.0, 18.0, 22.0];
    let ev = FailingAt {
        inner: rotor(),
        bad: vec![10.0, 18.0],
        bad_loads: Vec::new(),
    };
    let mut opt = optimizer(ev, 1.0e7, Execution::Parallel { threads: 3 });
    let outcome = opt.run_sweep(&sweep).unwrap();

    assert_eq!(outcome.points.len(), sweep.len());
    assert_eq!(outcome.success_count(), 4);
    let failed: Vec<(usize, f64)> = outcome.failures().map(|f| (f.index, f.uinf)).collect();
    assert_eq!(failed, vec![(2, 10.0), (4, 18.0)]);
    for (point, &u) in outcome.points.iter().zip(&sweep) {
        match point {
            Ok(p) => assert_eq!(p.setpoint.uinf, u),
            Err(f) => assert!(matches!(f.error, EvaluatorError::Failed(_))),
        }
    }
}

#[test]
fn test_iteration_cap_reported() {
    let sweep = [2.0, 6.0, 12.0, 20.0];
    let settings = OptimizerSettings {
        tip_radius: TIP_RADIUS,
        max_tip_speed: MAX_TIP_SPEED,
        rated_power: 1.0e7,
        tolerances: Tolerances {
            max_iter: 2,
            ..Default::default()
        },
        execution: Execution::Serial,
        ..Default::default()
    };
    let mut opt = ControlOptimizer::new(rotor(), limits(), settings);
    let outcome = opt.run_sweep(&sweep).unwrap();

    assert!(!outcome.calibration.reference_converged);
    assert_eq!(outcome.failure_count(), 0);
    for point in outcome.solved() {
        assert!(!point.converged, "{} m/s reported converged", point.setpoint.uinf);
        assert_eq!(point.setpoint.iterations, 2);
    }

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("schedule.csv");
    io::write_schedule_csv(
        &path,
        outcome.solved().map(|p| (&p.setpoint, p.converged)),
        TIP_RADIUS,
    )
    .unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    let rows: Vec<Vec<&str>> = text.lines().skip(1).map(|l| l.split(',').collect()).collect();
    assert_eq!(rows.len(), 4);
    for row in rows {
        assert_eq!(row[9], "2");
        assert_eq!(row[12], "false");
    }
}

#[test]
fn test_initialization_failure_is_fatal() {
    let mut opt = optimizer(Broken, 1.0e7, Execution::Serial);
    let err = opt.run_sweep(&[4.0, 6.0, 8.0]).unwrap_err();
    assert!(matches!(err, ScheduleError::Evaluator(EvaluatorError::Failed(_))));
    assert!(opt.calibration().is_none());
}

#[test]
fn test_repeat_runs_identical() {
    let sweep = [2.0, 6.0, 12.0, 20.0];
    let mut opt = optimizer(rotor(), 1.0e7, Execution::Parallel { threads: 2 });
    let first = opt.run_sweep(&sweep).unwrap();
    let second = opt.run_sweep(&sweep).unwrap();
    assert_eq!(first.calibration, second.calibration);
    assert_eq!(first.setpoints(), second.setpoints());
}

// =============================================================================
// Loads and outputs
// =============================================================================

#[test]
fn test_loads_follow_setpoints() {
    let sweep = [2.0, 6.0, 12.0, 20.0];
    let mut opt = optimizer(rotor().with_span_points(200), 1.0e7, Execution::Serial);
    let outcome = opt.run_sweep(&sweep).unwrap();
    let setpoints = outcome.setpoints();
    let loads = compute_blade_loads(opt.evaluator(), &outcome.indexed_setpoints());

    assert!(loads.failures.is_empty());
    assert_eq!(loads.records.len(), 4);
    for (rec, sp) in loads.records.iter().zip(&setpoints) {
        assert_eq!(rec.uinf, sp.uinf);
        assert!((rec.flapwise_moment - sp.blade_moment).abs() / sp.blade_moment < 1e-3);
        assert!(rec.combined_rms_moment >= rec.flapwise_moment);
        assert!(rec.edgewise_moment > 0.0);
    }
}

#[test]
fn test_load_failures_use_sweep_index() {
    let sweep = [4.0, 6.0, 10.0, 14.0];
    let ev = FailingAt {
        inner: rotor(),
        bad: vec![10.0],
        bad_loads: vec![14.0],
    };
    let mut opt = optimizer(ev, 1.0e7, Execution::Serial);
    let outcome = opt.run_sweep(&sweep).unwrap();
    let loads = compute_blade_loads(opt.evaluator(), &outcome.indexed_setpoints());

    let solve_failures: Vec<(usize, f64)> =
        outcome.failures().map(|f| (f.index, f.uinf)).collect();
    let load_failures: Vec<(usize, f64)> =
        loads.failures.iter().map(|f| (f.index, f.uinf)).collect();
    assert_eq!(solve_failures, vec![(2, 10.0)]);
    assert_eq!(load_failures, vec![(3, 14.0)]);
    for (index, uinf) in solve_failures.iter().chain(&load_failures) {
        assert_eq!(sweep[*index], *uinf);
    }
    assert_eq!(loads.records.len(), 2);
}

#[test]
fn test_constant_unit_loads_moment() {
    let loads = compute_blade_loads(
        &ConstantPower(1.0),
        &[(0, crate::schedule::SetpointResult {
            uinf: 8.0,
            zone: Mode::Fixed,
            omega: 10.0,
            pitch: 0.0,
            power: 1.0,
            thrust: 1.0,
            ct: 0.8,
            cp: 0.4,
            blade_moment: 1.0,
            iterations: 1,
        })],
    );
    let rec = &loads.records[0];
    let half_r2 = TIP_RADIUS * TIP_RADIUS / 2.0;
    assert!((rec.flapwise_moment - half_r2).abs() < 1e-9);
    assert!((rec.edgewise_moment - half_r2).abs() < 1e-9);
    assert!((rec.combined_rms_moment - half_r2 * 2f64.sqrt()).abs() < 1e-9);
}

#[test]
fn test_sweep_outputs_written() {
    let sweep = [2.0, 6.0, 12.0, 20.0];
    let mut opt = optimizer(rotor(), 1.0e7, Execution::Serial);
    let outcome = opt.run_sweep(&sweep).unwrap();
    let loads = compute_blade_loads(opt.evaluator(), &outcome.indexed_setpoints());

    let dir = tempfile::tempdir().unwrap();
    let schedule = dir.path().join("schedule.csv");
    io::write_schedule_csv(
        &schedule,
        outcome.solved().map(|p| (&p.setpoint, p.converged)),
        TIP_RADIUS,
    )
    .unwrap();
    io::write_blade_loads_csv(&dir.path().join("blade_loads.csv"), &loads).unwrap();
    io::write_moments_csv(&dir.path().join("moments.csv"), &loads).unwrap();

    let text = std::fs::read_to_string(&schedule).unwrap();
    let rows: Vec<&str> = text.lines().skip(1).collect();
    assert_eq!(rows.len(), 4);
    assert!(rows[0].starts_with("2.0000,low,"));
    assert!(rows[1].starts_with("6.0000,mid,"));

    let bl = std::fs::read_to_string(dir.path().join("blade_loads.csv")).unwrap();
    assert_eq!(
        bl.lines().next().unwrap(),
        "r,Np_2.0,Tp_2.0,Np_6.0,Tp_6.0,Np_12.0,Tp_12.0,Np_20.0,Tp_20.0"
    );
    assert_eq!(bl.lines().count(), 51);

    let moments = std::fs::read_to_string(dir.path().join("moments.csv")).unwrap();
    assert_eq!(moments.lines().count(), 5);
}
