//! Fixed operating points
//!
//! Evaluates user-given `(uinf, omega, pitch)` triples as they are, with no
//! search. Useful for checking a schedule against a reference table or for
//! probing the evaluator at hand-picked points.

use tracing::{info, warn};

use crate::config::OperatingPoint;
use crate::error::PointFailure;
use crate::evaluator::Evaluator;
use crate::schedule::SetpointResult;
use crate::zones::Mode;

pub type FixedOutcome = Result<SetpointResult, PointFailure>;

/// Evaluate each operating point once, coefficients included.
pub fn run_fixed<E: Evaluator + ?Sized>(
    evaluator: &E,
    points: &[OperatingPoint],
) -> Vec<FixedOutcome> {
    let outcomes: Vec<FixedOutcome> = points
        .iter()
        .enumerate()
        .map(|(index, op)| {
            evaluator
                .performance(op.uinf, op.omega, op.pitch)
                .map(|perf| SetpointResult {
                    uinf: op.uinf,
                    zone: Mode::Fixed,
                    omega: op.omega,
                    pitch: op.pitch,
                    power: perf.power,
                    thrust: perf.thrust,
                    ct: perf.ct,
                    cp: perf.cp,
                    blade_moment: perf.blade_moment,
                    iterations: 1,
                })
                .map_err(|error| {
                    warn!(index, uinf = op.uinf, %error, "fixed point failed");
                    PointFailure {
                        index,
                        uinf: op.uinf,
                        error,
                    }
                })
        })
        .collect();

    let failed = outcomes.iter().filter(|o| o.is_err()).count();
    info!(points = points.len(), failed, "fixed points evaluated");
    outcomes
}

/// Evaluated points with their position in the input list
pub fn evaluated(outcomes: &[FixedOutcome]) -> Vec<(usize, SetpointResult)> {
    outcomes
        .iter()
        .enumerate()
        .filter_map(|(index, o)| o.as_ref().ok().map(|sp| (index, *sp)))
        .collect()
}
