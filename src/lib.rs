//! Control-schedule optimization for variable-speed, pitch-regulated wind
//! turbine rotors.
//!
//! Given a sweep of free-stream wind speeds, [`ControlOptimizer`] finds the
//! rotor speed and blade pitch that maximize power below rating and hold
//! rated power above it, within the rotor's speed and pitch limits. The
//! aerodynamic model stays behind the [`Evaluator`] trait; [`AnalyticRotor`]
//! is a closed-form reference implementation. [`compute_blade_loads`] turns
//! the resulting setpoints into blade root bending moments.

pub mod analytic;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod fixed;
pub mod io;
pub mod loads;
pub mod numerics;
pub mod rotor;
pub mod schedule;
pub mod solvers;
pub mod zones;

#[cfg(test)]
mod tests;

pub use analytic::AnalyticRotor;
pub use error::{PointFailure, ScheduleError};
pub use evaluator::{Evaluator, EvaluatorError};
pub use fixed::run_fixed;
pub use loads::{compute_blade_loads, BladeLoadRecord, BladeLoads};
pub use rotor::{ReferenceState, RotorLimits};
pub use schedule::{
    ControlOptimizer, Execution, OptimizerSettings, SetpointResult, SolvedPoint, SweepOutcome,
};
pub use solvers::Fallback;
pub use zones::{Calibration, Mode, Zone, ZoneBoundaries};
