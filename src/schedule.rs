//! Schedule dispatcher
//!
//! Classifies each wind speed of a sweep, routes it to the solver for its
//! regime, and collects one outcome per input in input order. Points are
//! independent once the optimizer is calibrated, so the sweep fans out over
//! a rayon pool; serial and parallel runs produce identical setpoints.

use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config;
use crate::error::{PointFailure, ScheduleError};
use crate::evaluator::{Evaluator, EvaluatorError};
use crate::numerics::Tolerances;
use crate::rotor::RotorLimits;
use crate::solvers::{self, Fallback, Solved};
use crate::zones::{self, Band, Calibration, Mode, Zone};

/// How the sweep is spread over threads
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Execution {
    Serial,
    /// `threads = 0` uses one worker per CPU
    Parallel { threads: usize },
}

impl Default for Execution {
    fn default() -> Self {
        Execution::Parallel { threads: 0 }
    }
}

/// Fixed inputs to the optimizer besides the control limits
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OptimizerSettings {
    /// m
    pub tip_radius: f64,
    /// m/s
    pub max_tip_speed: f64,
    /// W
    pub rated_power: f64,
    /// m/s
    pub reference_uinf: f64,
    pub initial_tsr: f64,
    /// deg
    pub initial_pitch: f64,
    pub tolerances: Tolerances,
    pub execution: Execution,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            tip_radius: 1.0,
            max_tip_speed: 1.0,
            rated_power: 1.0,
            reference_uinf: 6.0,
            initial_tsr: 10.0,
            initial_pitch: 0.0,
            tolerances: Tolerances::default(),
            execution: Execution::default(),
        }
    }
}

impl OptimizerSettings {
    pub fn from_config(cfg: &config::Root) -> Self {
        let solver = cfg.solver();
        Self {
            tip_radius: cfg.rotor.tip_radius,
            max_tip_speed: cfg.rotor.max_tip_speed,
            rated_power: cfg.rotor.rated_power,
            reference_uinf: cfg.control.reference_uinf,
            initial_tsr: cfg.control.initial_tsr,
            initial_pitch: cfg.control.initial_pitch,
            tolerances: solver.tolerances(),
            execution: if solver.serial {
                Execution::Serial
            } else {
                Execution::Parallel {
                    threads: solver.threads,
                }
            },
        }
    }
}

/// Optimal setpoint at one wind speed
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct SetpointResult {
    /// m/s
    pub uinf: f64,
    pub zone: Mode,
    /// rpm
    pub omega: f64,
    /// deg
    pub pitch: f64,
    /// W
    #[serde(rename = "P")]
    pub power: f64,
    /// N
    #[serde(rename = "T")]
    pub thrust: f64,
    #[serde(rename = "CT")]
    pub ct: f64,
    #[serde(rename = "CP")]
    pub cp: f64,
    /// N·m
    #[serde(rename = "Mb")]
    pub blade_moment: f64,
    #[serde(rename = "niter")]
    pub iterations: usize,
}

impl SetpointResult {
    fn from_solved(uinf: f64, zone: Zone, solved: &Solved) -> Self {
        let perf = &solved.performance;
        Self {
            uinf,
            zone: zone.into(),
            omega: solved.omega,
            pitch: solved.pitch,
            power: perf.power,
            thrust: perf.thrust,
            ct: perf.ct,
            cp: perf.cp,
            blade_moment: perf.blade_moment,
            iterations: solved.iterations,
        }
    }
}

/// A setpoint together with how its search ended
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct SolvedPoint {
    #[serde(flatten)]
    pub setpoint: SetpointResult,
    pub converged: bool,
    pub fallback: Option<Fallback>,
    /// Evaluator calls spent by the search, fallback work included
    pub evaluations: usize,
}

pub type PointOutcome = Result<SolvedPoint, PointFailure>;

#[derive(Clone, Debug)]
pub struct SweepOutcome {
    pub calibration: Calibration,
    /// One entry per input wind speed, in input order
    pub points: Vec<PointOutcome>,
}

impl SweepOutcome {
    pub fn solved(&self) -> impl Iterator<Item = &SolvedPoint> {
        self.points.iter().filter_map(|p| p.as_ref().ok())
    }

    pub fn setpoints(&self) -> Vec<SetpointResult> {
        self.solved().map(|p| p.setpoint).collect()
    }

    /// Solved setpoints paired with their position in the sweep
    pub fn indexed_setpoints(&self) -> Vec<(usize, SetpointResult)> {
        self.points
            .iter()
            .enumerate()
            .filter_map(|(index, p)| p.as_ref().ok().map(|p| (index, p.setpoint)))
            .collect()
    }

    pub fn failures(&self) -> impl Iterator<Item = &PointFailure> {
        self.points.iter().filter_map(|p| p.as_ref().err())
    }

    pub fn success_count(&self) -> usize {
        self.solved().count()
    }

    pub fn failure_count(&self) -> usize {
        self.failures().count()
    }
}

pub struct ControlOptimizer<E> {
    evaluator: E,
    limits: RotorLimits,
    settings: OptimizerSettings,
    calibration: Option<Calibration>,
    /// Fine-pitch power at omega_max per wind speed, keyed by bit pattern
    probes: Mutex<HashMap<u64, f64>>,
}

impl<E: Evaluator> ControlOptimizer<E> {
    pub fn new(evaluator: E, limits: RotorLimits, settings: OptimizerSettings) -> Self {
        Self {
            evaluator,
            limits,
            settings,
            calibration: None,
            probes: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(evaluator: E, cfg: &config::Root) -> Self {
        Self::new(
            evaluator,
            RotorLimits::from_config(cfg),
            OptimizerSettings::from_config(cfg),
        )
    }

    pub fn evaluator(&self) -> &E {
        &self.evaluator
    }

    pub fn limits(&self) -> &RotorLimits {
        &self.limits
    }

    pub fn settings(&self) -> &OptimizerSettings {
        &self.settings
    }

    pub fn set_execution(&mut self, execution: Execution) {
        self.settings.execution = execution;
    }

    pub fn calibration(&self) -> Option<&Calibration> {
        self.calibration.as_ref()
    }

    /// Solve the reference optimum for `sweep` and fix the zone boundaries.
    ///
    /// Fails if the sweep is empty or the evaluator fails at the reference
    /// point; nothing can be classified without a reference.
    pub fn initialize(&mut self, sweep: &[f64]) -> Result<&Calibration, ScheduleError> {
        let calibration = zones::calibrate(&self.evaluator, sweep, &self.limits, &self.settings)?
            .ok_or(ScheduleError::EmptySweep)?;
        Ok(&*self.calibration.insert(calibration))
    }

    /// Regime for `uinf` under the current calibration.
    pub fn classify(&self, uinf: f64) -> Result<Zone, ScheduleError> {
        let calibration = self.calibration.as_ref().ok_or(ScheduleError::NotInitialized)?;
        Ok(self.zone_of(calibration, uinf)?.0)
    }

    /// Solve a single wind speed.
    pub fn process(&self, uinf: f64) -> Result<SolvedPoint, ScheduleError> {
        let calibration = self.calibration.as_ref().ok_or(ScheduleError::NotInitialized)?;
        Ok(self.solve_point(calibration, uinf)?)
    }

    /// Calibrate on `sweep`, then solve every wind speed in it.
    ///
    /// Only initialization failures abort the sweep; a wind speed whose
    /// evaluations fail becomes a [`PointFailure`] in its slot.
    pub fn run_sweep(&mut self, sweep: &[f64]) -> Result<SweepOutcome, ScheduleError> {
        let calibration = *self.initialize(sweep)?;

        let solve = |(index, uinf): (usize, f64)| {
            let outcome = self
                .solve_point(&calibration, uinf)
                .map_err(|error| PointFailure { index, uinf, error });
            (index, outcome)
        };
        let indexed: Vec<(usize, f64)> = sweep.iter().copied().enumerate().collect();

        let mut points: Vec<(usize, PointOutcome)> = match self.settings.execution {
            Execution::Serial => indexed.into_iter().map(solve).collect(),
            Execution::Parallel { threads } => {
                let threads = if threads == 0 { num_cpus::get() } else { threads };
                let pool = ThreadPoolBuilder::new().num_threads(threads).build()?;
                debug!(threads, "solving sweep in parallel");
                pool.install(|| indexed.into_par_iter().map(solve).collect())
            }
        };
        points.sort_by_key(|(index, _)| *index);

        let outcome = SweepOutcome {
            calibration,
            points: points.into_iter().map(|(_, p)| p).collect(),
        };
        for failure in outcome.failures() {
            warn!(
                index = failure.index,
                uinf = failure.uinf,
                error = %failure.error,
                "wind speed failed"
            );
        }
        info!(
            points = sweep.len(),
            solved = outcome.success_count(),
            failed = outcome.failure_count(),
            "sweep complete"
        );
        Ok(outcome)
    }

    fn probe(&self, uinf: f64) -> Result<f64, EvaluatorError> {
        let key = uinf.to_bits();
        if let Some(&p) = self.probes.lock().unwrap_or_else(|e| e.into_inner()).get(&key) {
            return Ok(p);
        }
        let p = self
            .evaluator
            .power(uinf, self.limits.omega_max, self.limits.clamp_pitch(0.0))?;
        self.probes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, p);
        Ok(p)
    }

    /// Zone and, above the fixed-TSR band, the fine-pitch probe used to pick it
    fn zone_of(
        &self,
        calibration: &Calibration,
        uinf: f64,
    ) -> Result<(Zone, Option<f64>), EvaluatorError> {
        Ok(match calibration.boundaries.band(uinf) {
            Band::Below => (Zone::Low, None),
            Band::Inside => (Zone::Mid, None),
            Band::Above => {
                let p = self.probe(uinf)?;
                let zone = if p > self.settings.rated_power {
                    Zone::High
                } else {
                    Zone::Upper
                };
                (zone, Some(p))
            }
        })
    }

    fn solve_point(
        &self,
        calibration: &Calibration,
        uinf: f64,
    ) -> Result<SolvedPoint, EvaluatorError> {
        let (zone, probe) = self.zone_of(calibration, uinf)?;
        let tol = &self.settings.tolerances;
        let ev = &self.evaluator;

        let solved = match zone {
            Zone::Low => solvers::solve_low(ev, uinf, &self.limits, tol)?,
            Zone::Mid => {
                let reference = &calibration.reference;
                let guess = (
                    reference.omega_opt * uinf / reference.uinf,
                    reference.pitch_opt,
                );
                solvers::solve_mid(ev, uinf, &self.limits, guess, tol)?
            }
            Zone::Upper => solvers::solve_upper(ev, uinf, &self.limits, tol)?,
            Zone::High => solvers::solve_high(
                ev,
                uinf,
                &self.limits,
                self.settings.rated_power,
                probe,
                tol,
            )?,
        };

        if !solved.converged {
            warn!(
                uinf,
                zone = %zone,
                iterations = solved.iterations,
                "solve hit the iteration cap"
            );
        }
        debug!(
            uinf,
            zone = %zone,
            omega = solved.omega,
            pitch = solved.pitch,
            power = solved.performance.power,
            iterations = solved.iterations,
            evaluations = solved.evaluations,
            "solved"
        );

        Ok(SolvedPoint {
            setpoint: SetpointResult::from_solved(uinf, zone, &solved),
            converged: solved.converged,
            fallback: solved.fallback,
            evaluations: solved.evaluations,
        })
    }
}
