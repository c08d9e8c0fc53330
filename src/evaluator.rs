//! Aerodynamic evaluator seam
//!
//! The optimizer never looks inside the aerodynamic model. Everything it
//! needs goes through [`Evaluator`]: rotor performance at a batch of
//! operating points, and spanwise loads at a single one.
//!
//! Units: wind speed m/s, rotor speed rpm, pitch and azimuth degrees,
//! power W, thrust N, moments N·m, span positions m.
//!
//! Implementations must be deterministic, free of shared mutable state, and
//! silent: nothing may be written to stdout or stderr. Diagnostics belong in
//! `tracing` events.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvaluatorError {
    /// The operating point is outside what the model accepts.
    #[error("invalid operating point (uinf={uinf}, omega={omega}, pitch={pitch}): {reason}")]
    InvalidInput {
        uinf: f64,
        omega: f64,
        pitch: f64,
        reason: String,
    },
    /// Input slices of unequal length.
    #[error("input length mismatch: {wind} wind speeds, {rotor} rotor speeds, {pitch} pitches")]
    LengthMismatch {
        wind: usize,
        rotor: usize,
        pitch: usize,
    },
    /// The model returned something unusable (wrong lengths, NaN).
    #[error("malformed evaluator output: {0}")]
    Malformed(String),
    /// Any other model failure.
    #[error("evaluator failed: {0}")]
    Failed(String),
}

/// Non-dimensional coefficients, only filled when requested
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Coefficients {
    pub ct: Vec<f64>,
    pub cp: Vec<f64>,
}

/// Elementwise performance at a batch of operating points
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PerformanceOutputs {
    pub power: Vec<f64>,
    pub thrust: Vec<f64>,
    /// Blade root flapwise bending moment
    pub blade_moment: Vec<f64>,
    pub coefficients: Option<Coefficients>,
}

/// Spanwise loads per unit length on one blade
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DistributedLoads {
    /// Span positions measured from the rotation axis
    pub r: Vec<f64>,
    /// Force normal to the rotor plane
    pub np: Vec<f64>,
    /// Force tangential to the rotor plane
    pub tp: Vec<f64>,
}

/// Scalar performance at one operating point, coefficients included
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PointPerformance {
    pub power: f64,
    pub thrust: f64,
    pub ct: f64,
    pub cp: f64,
    pub blade_moment: f64,
}

pub trait Evaluator: Send + Sync {
    /// Rotor performance at each `(wind_speeds[i], rotor_speeds[i], pitches[i])`.
    ///
    /// Coefficients may be skipped when `want_coefficients` is false.
    fn evaluate(
        &self,
        wind_speeds: &[f64],
        rotor_speeds: &[f64],
        pitches: &[f64],
        want_coefficients: bool,
    ) -> Result<PerformanceOutputs, EvaluatorError>;

    /// Spanwise loads at one operating point and azimuth.
    fn distributed_loads(
        &self,
        wind_speed: f64,
        rotor_speed: f64,
        pitch: f64,
        azimuth: f64,
    ) -> Result<DistributedLoads, EvaluatorError>;

    /// Power at a single point, without coefficients.
    fn power(&self, wind_speed: f64, rotor_speed: f64, pitch: f64) -> Result<f64, EvaluatorError> {
        let out = self.evaluate(&[wind_speed], &[rotor_speed], &[pitch], false)?;
        let p = out
            .power
            .first()
            .copied()
            .ok_or_else(|| EvaluatorError::Malformed("empty power output".to_string()))?;
        if p.is_nan() {
            return Err(EvaluatorError::Malformed(format!(
                "power is NaN at uinf={wind_speed}, omega={rotor_speed}, pitch={pitch}"
            )));
        }
        Ok(p)
    }

    /// Full performance at a single point, coefficients enabled.
    fn performance(
        &self,
        wind_speed: f64,
        rotor_speed: f64,
        pitch: f64,
    ) -> Result<PointPerformance, EvaluatorError> {
        let out = self.evaluate(&[wind_speed], &[rotor_speed], &[pitch], true)?;
        let coeffs = out
            .coefficients
            .as_ref()
            .ok_or_else(|| EvaluatorError::Malformed("coefficients missing".to_string()))?;
        let first = |v: &[f64], name: &str| {
            v.first()
                .copied()
                .ok_or_else(|| EvaluatorError::Malformed(format!("empty {name} output")))
        };
        Ok(PointPerformance {
            power: first(&out.power, "power")?,
            thrust: first(&out.thrust, "thrust")?,
            ct: first(&coeffs.ct, "ct")?,
            cp: first(&coeffs.cp, "cp")?,
            blade_moment: first(&out.blade_moment, "blade moment")?,
        })
    }
}

impl<E: Evaluator + ?Sized> Evaluator for &E {
    fn evaluate(
        &self,
        wind_speeds: &[f64],
        rotor_speeds: &[f64],
        pitches: &[f64],
        want_coefficients: bool,
    ) -> Result<PerformanceOutputs, EvaluatorError> {
        (**self).evaluate(wind_speeds, rotor_speeds, pitches, want_coefficients)
    }

    fn distributed_loads(
        &self,
        wind_speed: f64,
        rotor_speed: f64,
        pitch: f64,
        azimuth: f64,
    ) -> Result<DistributedLoads, EvaluatorError> {
        (**self).distributed_loads(wind_speed, rotor_speed, pitch, azimuth)
    }
}

/// Check that three input slices line up.
pub fn check_lengths(
    wind_speeds: &[f64],
    rotor_speeds: &[f64],
    pitches: &[f64],
) -> Result<usize, EvaluatorError> {
    let n = wind_speeds.len();
    if rotor_speeds.len() != n || pitches.len() != n {
        return Err(EvaluatorError::LengthMismatch {
            wind: n,
            rotor: rotor_speeds.len(),
            pitch: pitches.len(),
        });
    }
    Ok(n)
}
