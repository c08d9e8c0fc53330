//! Regime solvers
//!
//! One bounded search per control regime. Every solver evaluates power
//! through its own [`PowerMemo`], so repeated trial points (clipped simplex
//! vertices, bracket endpoints) cost nothing and no table is shared between
//! concurrent solves. After the search, one coefficient-enabled evaluation
//! captures the reported performance at the chosen setpoint.

use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::evaluator::{Evaluator, EvaluatorError, PointPerformance};
use crate::numerics::{
    find_root, minimize_bounded, nelder_mead_bounded, Minimum, RootError, Tolerances,
};
use crate::rotor::RotorLimits;

/// Documented substitute taken when a rating root search has no bracket
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Fallback {
    /// Rated power not reachable by pitching at maximum rotor speed;
    /// pitch chosen for maximum power instead.
    PowerLimited,
}

/// Power evaluations at one wind speed, memoized by `(omega, pitch)`
pub struct PowerMemo<'a, E: ?Sized> {
    evaluator: &'a E,
    uinf: f64,
    table: HashMap<(u64, u64), f64>,
    calls: usize,
}

impl<'a, E: Evaluator + ?Sized> PowerMemo<'a, E> {
    pub fn new(evaluator: &'a E, uinf: f64) -> Self {
        Self {
            evaluator,
            uinf,
            table: HashMap::new(),
            calls: 0,
        }
    }

    /// Record a value already computed elsewhere
    pub fn seed(&mut self, omega: f64, pitch: f64, power: f64) {
        self.table.insert((omega.to_bits(), pitch.to_bits()), power);
    }

    pub fn power(&mut self, omega: f64, pitch: f64) -> Result<f64, EvaluatorError> {
        let key = (omega.to_bits(), pitch.to_bits());
        if let Some(&p) = self.table.get(&key) {
            return Ok(p);
        }
        let p = self.evaluator.power(self.uinf, omega, pitch)?;
        self.calls += 1;
        self.table.insert(key, p);
        Ok(p)
    }

    /// Evaluator calls actually made (cache misses)
    pub fn calls(&self) -> usize {
        self.calls
    }
}

/// Outcome of one regime solve
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Solved {
    /// rpm
    pub omega: f64,
    /// deg
    pub pitch: f64,
    pub performance: PointPerformance,
    pub iterations: usize,
    pub converged: bool,
    pub fallback: Option<Fallback>,
    /// Evaluator calls made during the search, final evaluation excluded
    pub evaluations: usize,
}

fn finish<E: Evaluator + ?Sized>(
    memo: &PowerMemo<'_, E>,
    omega: f64,
    pitch: f64,
    iterations: usize,
    converged: bool,
    fallback: Option<Fallback>,
) -> Result<Solved, EvaluatorError> {
    let performance = memo.evaluator.performance(memo.uinf, omega, pitch)?;
    Ok(Solved {
        omega,
        pitch,
        performance,
        iterations,
        converged,
        fallback,
        evaluations: memo.calls(),
    })
}

/// Pitch maximizing power at a pinned rotor speed
fn maximize_over_pitch<E: Evaluator + ?Sized>(
    memo: &mut PowerMemo<'_, E>,
    omega: f64,
    limits: &RotorLimits,
    tol: &Tolerances,
) -> Result<Minimum<f64>, EvaluatorError> {
    minimize_bounded(
        |pitch| memo.power(omega, pitch).map(|p| -p),
        (limits.pitch_min, limits.pitch_max),
        tol,
    )
}

fn pinned<E: Evaluator + ?Sized>(
    evaluator: &E,
    uinf: f64,
    omega: f64,
    limits: &RotorLimits,
    tol: &Tolerances,
) -> Result<Solved, EvaluatorError> {
    let mut memo = PowerMemo::new(evaluator, uinf);
    let best = maximize_over_pitch(&mut memo, omega, limits, tol)?;
    finish(&memo, omega, best.x, best.iterations, best.converged, None)
}

/// Below the fixed-TSR band: rotor speed held at `omega_min`.
pub fn solve_low<E: Evaluator + ?Sized>(
    evaluator: &E,
    uinf: f64,
    limits: &RotorLimits,
    tol: &Tolerances,
) -> Result<Solved, EvaluatorError> {
    pinned(evaluator, uinf, limits.omega_min, limits, tol)
}

/// Above the fixed-TSR band, below rating: rotor speed held at `omega_max`.
pub fn solve_upper<E: Evaluator + ?Sized>(
    evaluator: &E,
    uinf: f64,
    limits: &RotorLimits,
    tol: &Tolerances,
) -> Result<Solved, EvaluatorError> {
    pinned(evaluator, uinf, limits.omega_max, limits, tol)
}

/// Inside the fixed-TSR band: rotor speed and pitch both free.
///
/// `guess` is `(omega, pitch)` and is clipped into the control box.
pub fn solve_mid<E: Evaluator + ?Sized>(
    evaluator: &E,
    uinf: f64,
    limits: &RotorLimits,
    guess: (f64, f64),
    tol: &Tolerances,
) -> Result<Solved, EvaluatorError> {
    let mut memo = PowerMemo::new(evaluator, uinf);
    let best = nelder_mead_bounded(
        |x: &[f64; 2]| memo.power(x[0], x[1]).map(|p| -p),
        [guess.0, guess.1],
        [limits.omega_min, limits.pitch_min],
        [limits.omega_max, limits.pitch_max],
        tol,
    )?;
    let [omega, pitch] = best.x;
    finish(&memo, omega, pitch, best.iterations, best.converged, None)
}

/// Above rating: rotor speed held at `omega_max`, pitch set so that power
/// equals `rated_power`.
///
/// `probe` is the power at `omega_max` and fine pitch if the caller already
/// has it.
/// When no pitch inside the bounds brings power to rating, the solve falls
/// back to maximizing power and flags [`Fallback::PowerLimited`].
pub fn solve_high<E: Evaluator + ?Sized>(
    evaluator: &E,
    uinf: f64,
    limits: &RotorLimits,
    rated_power: f64,
    probe: Option<f64>,
    tol: &Tolerances,
) -> Result<Solved, EvaluatorError> {
    let omega = limits.omega_max;
    let mut memo = PowerMemo::new(evaluator, uinf);
    if let Some(p) = probe {
        memo.seed(omega, limits.clamp_pitch(0.0), p);
    }

    let search = find_root(
        |pitch| memo.power(omega, pitch).map(|p| p - rated_power),
        (limits.pitch_min, limits.pitch_max),
        tol,
    );

    match search {
        Ok(root) => {
            debug!(uinf, pitch = root.x, residual = root.fx, "rated pitch found");
            finish(&memo, omega, root.x, root.iterations, root.converged, None)
        }
        Err(RootError::NoSignChange { f_lo, f_hi, .. }) => {
            warn!(
                uinf,
                excess_at_pitch_min = f_lo,
                excess_at_pitch_max = f_hi,
                "rated power not reachable by pitching; maximizing power instead"
            );
            let best = maximize_over_pitch(&mut memo, omega, limits, tol)?;
            // The failed bracket check counts as one iteration; its endpoint
            // evaluations are already in the memo's call count.
            finish(
                &memo,
                omega,
                best.x,
                best.iterations + 1,
                best.converged,
                Some(Fallback::PowerLimited),
            )
        }
        Err(RootError::Objective(e)) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytic::AnalyticRotor;
    use crate::evaluator::{Coefficients, DistributedLoads, PerformanceOutputs};
    use approx::assert_abs_diff_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn limits() -> RotorLimits {
        RotorLimits::new(4.0, 95.0, 60.0, 0.0, 30.0)
    }

    fn tol() -> Tolerances {
        Tolerances::default()
    }

    /// Power is a known function of (omega, pitch); counts calls.
    struct Surface<F: Fn(f64, f64) -> f64 + Send + Sync> {
        f: F,
        calls: AtomicUsize,
    }

    impl<F: Fn(f64, f64) -> f64 + Send + Sync> Surface<F> {
        fn new(f: F) -> Self {
            Self {
                f,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl<F: Fn(f64, f64) -> f64 + Send + Sync> Evaluator for Surface<F> {
        fn evaluate(
            &self,
            wind_speeds: &[f64],
            rotor_speeds: &[f64],
            pitches: &[f64],
            want_coefficients: bool,
        ) -> Result<PerformanceOutputs, EvaluatorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let power: Vec<f64> = rotor_speeds
                .iter()
                .zip(pitches)
                .map(|(&o, &p)| (self.f)(o, p))
                .collect();
            let n = wind_speeds.len();
            Ok(PerformanceOutputs {
                thrust: vec![1.0; n],
                blade_moment: vec![2.0; n],
                coefficients: want_coefficients.then(|| Coefficients {
                    ct: vec![0.5; n],
                    cp: vec![0.4; n],
                }),
                power,
            })
        }

        fn distributed_loads(
            &self,
            _: f64,
            _: f64,
            _: f64,
            _: f64,
        ) -> Result<DistributedLoads, EvaluatorError> {
            Ok(DistributedLoads::default())
        }
    }

    #[test]
    fn test_low_pins_omega_min() {
        let ev = Surface::new(|_, pitch| 1e6 - (pitch - 7.0).powi(2));
        let solved = solve_low(&ev, 3.0, &limits(), &tol()).unwrap();
        assert_eq!(solved.omega, limits().omega_min);
        assert_abs_diff_eq!(solved.pitch, 7.0, epsilon = 1e-3);
        assert!(solved.converged);
        assert!(solved.fallback.is_none());
        assert_eq!(solved.performance.cp, 0.4);
    }

    #[test]
    fn test_upper_pins_omega_max() {
        let ev = Surface::new(|_, pitch| 1e6 - (pitch - 3.0).powi(2));
        let solved = solve_upper(&ev, 14.0, &limits(), &tol()).unwrap();
        assert_eq!(solved.omega, limits().omega_max);
        assert_abs_diff_eq!(solved.pitch, 3.0, epsilon = 1e-3);
    }

    #[test]
    fn test_mid_finds_interior_optimum() {
        let ev = Surface::new(|omega, pitch| {
            5e6 - 1e3 * (omega - 9.0).powi(2) - 1e3 * (pitch - 2.0).powi(2)
        });
        let t = Tolerances {
            xtol: 1e-6,
            ftol: 1e-14,
            max_iter: 500,
        };
        let solved = solve_mid(&ev, 7.0, &limits(), (8.0, 0.0), &t).unwrap();
        assert_abs_diff_eq!(solved.omega, 9.0, epsilon = 1e-3);
        assert_abs_diff_eq!(solved.pitch, 2.0, epsilon = 1e-3);
    }

    #[test]
    fn test_mid_guess_outside_box_is_clipped() {
        let ev = Surface::new(|omega, _| omega);
        let solved = solve_mid(&ev, 7.0, &limits(), (100.0, -10.0), &tol()).unwrap();
        assert!(solved.omega <= limits().omega_max);
        assert!(solved.pitch >= limits().pitch_min);
        assert_abs_diff_eq!(solved.omega, limits().omega_max, epsilon = 1e-9);
    }

    #[test]
    fn test_high_hits_rated_power() {
        let rated = 5e6;
        // Power falls linearly with pitch: 8 MW at 0 deg, 0 at 20 deg
        let ev = Surface::new(|_, pitch| 8e6 * (1.0 - pitch / 20.0));
        let t = Tolerances {
            xtol: 1e-10,
            ..Default::default()
        };
        let solved = solve_high(&ev, 18.0, &limits(), rated, None, &t).unwrap();
        assert_eq!(solved.omega, limits().omega_max);
        assert_abs_diff_eq!(solved.pitch, 7.5, epsilon = 1e-8);
        assert!(solved.fallback.is_none());
    }

    #[test]
    fn test_high_falls_back_when_rating_unreachable() {
        let ev = Surface::new(|_, pitch| 4e6 - (pitch - 1.0).powi(2));
        let solved = solve_high(&ev, 18.0, &limits(), 1e7, None, &tol()).unwrap();
        assert_eq!(solved.fallback, Some(Fallback::PowerLimited));
        assert_eq!(solved.omega, limits().omega_max);
        assert_abs_diff_eq!(solved.pitch, 1.0, epsilon = 1e-3);
    }

    #[test]
    fn test_high_fallback_counts_bracket_work() {
        let f = |_: f64, pitch: f64| 4e6 - (pitch - 1.0).powi(2);
        let upper = solve_upper(&Surface::new(f), 18.0, &limits(), &tol()).unwrap();
        let high = solve_high(&Surface::new(f), 18.0, &limits(), 1e7, None, &tol()).unwrap();
        assert_eq!(high.pitch, upper.pitch);
        assert_eq!(high.iterations, upper.iterations + 1);
        // Both bracket endpoints at pitch_min and pitch_max
        assert_eq!(high.evaluations, upper.evaluations + 2);
    }

    #[test]
    fn test_memo_avoids_repeat_calls() {
        let ev = Surface::new(|o, p| o + p);
        let mut memo = PowerMemo::new(&ev, 8.0);
        memo.power(5.0, 1.0).unwrap();
        memo.power(5.0, 1.0).unwrap();
        memo.seed(6.0, 0.0, 42.0);
        assert_eq!(memo.power(6.0, 0.0).unwrap(), 42.0);
        assert_eq!(memo.calls(), 1);
        assert_eq!(ev.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_evaluator_failure_propagates() {
        let rotor = AnalyticRotor::new(60.0, 1.5, 3, 1.225);
        let err = solve_low(&rotor, -3.0, &limits(), &tol()).unwrap_err();
        assert!(matches!(err, EvaluatorError::InvalidInput { .. }));
    }

    #[test]
    fn test_analytic_high_regime_reaches_rating() {
        let rotor = AnalyticRotor::new(60.0, 1.5, 3, 1.225);
        let rated = 5e6;
        let solved = solve_high(&rotor, 20.0, &limits(), rated, None, &tol()).unwrap();
        assert!(solved.fallback.is_none());
        assert!((solved.performance.power - rated).abs() / rated < 1e-3);
        assert!(solved.pitch > 0.0);
    }
}
