//! Blade root bending moments at solved setpoints

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::PointFailure;
use crate::evaluator::{Evaluator, EvaluatorError};
use crate::numerics::trapezoid;
use crate::schedule::SetpointResult;

/// Azimuth at which spanwise loads are sampled, deg
pub const LOAD_AZIMUTH: f64 = 0.0;

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct RootMoments {
    pub flapwise: f64,
    pub edgewise: f64,
    pub combined_rms: f64,
}

/// Integrate `np·r` and `tp·r` along the span.
pub fn root_moments(r: &[f64], np: &[f64], tp: &[f64]) -> RootMoments {
    let weighted = |f: &[f64]| -> Vec<f64> { f.iter().zip(r).map(|(f, r)| f * r).collect() };
    let flapwise = trapezoid(&weighted(np), r);
    let edgewise = trapezoid(&weighted(tp), r);
    RootMoments {
        flapwise,
        edgewise,
        combined_rms: flapwise.hypot(edgewise),
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BladeLoadRecord {
    pub uinf: f64,
    pub r: Vec<f64>,
    pub np: Vec<f64>,
    pub tp: Vec<f64>,
    pub flapwise_moment: f64,
    pub edgewise_moment: f64,
    pub combined_rms_moment: f64,
}

#[derive(Clone, Debug, Default)]
pub struct BladeLoads {
    /// In setpoint order, failed points omitted
    pub records: Vec<BladeLoadRecord>,
    pub failures: Vec<PointFailure>,
}

fn record_for<E: Evaluator + ?Sized>(
    evaluator: &E,
    setpoint: &SetpointResult,
) -> Result<BladeLoadRecord, EvaluatorError> {
    let loads =
        evaluator.distributed_loads(setpoint.uinf, setpoint.omega, setpoint.pitch, LOAD_AZIMUTH)?;
    let n = loads.r.len();
    if loads.np.len() != n || loads.tp.len() != n {
        return Err(EvaluatorError::Malformed(format!(
            "distributed loads have {} stations but {} Np and {} Tp values",
            n,
            loads.np.len(),
            loads.tp.len()
        )));
    }
    let m = root_moments(&loads.r, &loads.np, &loads.tp);
    Ok(BladeLoadRecord {
        uinf: setpoint.uinf,
        r: loads.r,
        np: loads.np,
        tp: loads.tp,
        flapwise_moment: m.flapwise,
        edgewise_moment: m.edgewise,
        combined_rms_moment: m.combined_rms,
    })
}

/// Spanwise loads and root moments for each `(index, setpoint)` pair.
///
/// `index` is the setpoint's position in the run that produced it (sweep or
/// fixed-point list), so a load failure reported in
/// [`BladeLoads::failures`] names the same slot as a solve failure would.
pub fn compute_blade_loads<E: Evaluator + ?Sized>(
    evaluator: &E,
    setpoints: &[(usize, SetpointResult)],
) -> BladeLoads {
    let mut out = BladeLoads::default();
    for &(index, sp) in setpoints {
        match record_for(evaluator, &sp) {
            Ok(record) => {
                debug!(
                    uinf = sp.uinf,
                    flapwise = record.flapwise_moment,
                    edgewise = record.edgewise_moment,
                    "blade loads"
                );
                out.records.push(record);
            }
            Err(error) => {
                warn!(index, uinf = sp.uinf, %error, "blade loads failed");
                out.failures.push(PointFailure {
                    index,
                    uinf: sp.uinf,
                    error,
                });
            }
        }
    }
    out
}
