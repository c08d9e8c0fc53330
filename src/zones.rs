//! Operating regimes and the wind speeds separating them
//!
//! Below rated power a variable-speed rotor tracks its optimal tip-speed
//! ratio, limited at the bottom by the minimum rotor speed and at the top by
//! the tip-speed cap. The two speeds where those limits engage bound the
//! fixed-TSR band; a third speed marks where the capped rotor reaches rated
//! power at fine pitch.

use serde::{Serialize, Serializer};
use std::fmt;
use tracing::{info, warn};

use crate::evaluator::{Evaluator, EvaluatorError};
use crate::numerics::{find_root, RootError};
use crate::rotor::{omega_to_tsr, tip_speed, tsr_to_omega, ReferenceState, RotorLimits};
use crate::schedule::OptimizerSettings;
use crate::solvers;

/// Control regime, ordered by wind speed
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Zone {
    /// Rotor speed at its minimum
    Low,
    /// Fixed tip-speed ratio
    Mid,
    /// Rotor speed at its maximum, below rating
    Upper,
    /// Rotor speed at its maximum, pitched to rating
    High,
}

impl Zone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Zone::Low => "low",
            Zone::Mid => "mid",
            Zone::Upper => "upper",
            Zone::High => "high",
        }
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Label carried by a setpoint: an optimized regime, or a fixed operating
/// point evaluated as given.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Mode {
    Regime(Zone),
    Fixed,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Regime(zone) => zone.as_str(),
            Mode::Fixed => "fixed",
        }
    }

    pub fn zone(&self) -> Option<Zone> {
        match self {
            Mode::Regime(zone) => Some(*zone),
            Mode::Fixed => None,
        }
    }
}

impl From<Zone> for Mode {
    fn from(zone: Zone) -> Self {
        Mode::Regime(zone)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Mode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Where a wind speed falls relative to the fixed-TSR band
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Band {
    Below,
    Inside,
    Above,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ZoneBoundaries {
    /// m/s, rotor reaches `omega_min` at the optimal TSR
    pub uinf_low: f64,
    /// m/s, rotor reaches `omega_max` at the optimal TSR
    pub uinf_high: f64,
    /// m/s, capped rotor at fine pitch reaches rated power
    pub uinf_switch: f64,
    /// False when `uinf_switch` is the top of the sweep rather than a root
    pub switch_found: bool,
}

impl ZoneBoundaries {
    /// Band edges for a rotor tracking `tsr_opt`
    pub fn band_edges(tsr_opt: f64, limits: &RotorLimits, tip_radius: f64) -> (f64, f64) {
        (
            tip_speed(limits.omega_min, tip_radius) / tsr_opt,
            tip_speed(limits.omega_max, tip_radius) / tsr_opt,
        )
    }

    pub fn band(&self, uinf: f64) -> Band {
        if uinf < self.uinf_low {
            Band::Below
        } else if uinf <= self.uinf_high {
            Band::Inside
        } else {
            Band::Above
        }
    }
}

/// Reference optimum and the boundaries derived from it
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Calibration {
    pub reference: ReferenceState,
    pub boundaries: ZoneBoundaries,
    /// Whether the reference optimization met its tolerance
    pub reference_converged: bool,
}

/// Sweep value nearest to `target`; the first one wins a tie.
pub fn closest_to(sweep: &[f64], target: f64) -> Option<f64> {
    sweep.iter().copied().fold(None, |best, u| match best {
        Some(b) if (b - target).abs() <= (u - target).abs() => Some(b),
        _ => Some(u),
    })
}

/// Wind speed where `P(U, omega_max, 0)` crosses `rated_power`, searched on
/// `[uinf_high, uinf_max]`.
///
/// Returns `(uinf_max, false)` when the interval is empty or holds no
/// crossing.
pub fn switch_speed<E: Evaluator + ?Sized>(
    evaluator: &E,
    limits: &RotorLimits,
    settings: &OptimizerSettings,
    uinf_high: f64,
    uinf_max: f64,
) -> Result<(f64, bool), EvaluatorError> {
    if !(uinf_high < uinf_max) {
        warn!(
            uinf_high,
            uinf_max,
            "rotor speed cap not reached inside the sweep; switch speed set to sweep maximum"
        );
        return Ok((uinf_max, false));
    }

    let pitch = limits.clamp_pitch(0.0);
    let search = find_root(
        |u| {
            evaluator
                .power(u, limits.omega_max, pitch)
                .map(|p| p - settings.rated_power)
        },
        (uinf_high, uinf_max),
        &settings.tolerances,
    );
    match search {
        Ok(root) => Ok((root.x, true)),
        Err(RootError::NoSignChange { f_lo, f_hi, .. }) => {
            warn!(
                uinf_high,
                uinf_max,
                excess_at_uinf_high = f_lo,
                excess_at_uinf_max = f_hi,
                "rated power not crossed inside the sweep; switch speed set to sweep maximum"
            );
            Ok((uinf_max, false))
        }
        Err(RootError::Objective(e)) => Err(e),
    }
}

/// Solve the reference optimum and derive the zone boundaries.
///
/// Deterministic for a deterministic evaluator: calling it twice on the same
/// sweep returns the same calibration.
pub fn calibrate<E: Evaluator + ?Sized>(
    evaluator: &E,
    sweep: &[f64],
    limits: &RotorLimits,
    settings: &OptimizerSettings,
) -> Result<Option<Calibration>, EvaluatorError> {
    let (Some(u_ref), Some(uinf_max)) = (
        closest_to(sweep, settings.reference_uinf),
        sweep.iter().copied().reduce(f64::max),
    ) else {
        return Ok(None);
    };

    let guess = (
        limits.clamp_omega(tsr_to_omega(
            settings.initial_tsr,
            u_ref,
            settings.tip_radius,
            settings.max_tip_speed,
        )),
        limits.clamp_pitch(settings.initial_pitch),
    );
    let solved = solvers::solve_mid(evaluator, u_ref, limits, guess, &settings.tolerances)?;
    if !solved.converged {
        warn!(
            uinf = u_ref,
            iterations = solved.iterations,
            "reference optimization hit the iteration cap"
        );
    }

    let tsr_opt = omega_to_tsr(solved.omega, u_ref, settings.tip_radius);
    let reference = ReferenceState {
        uinf: u_ref,
        omega_opt: solved.omega,
        pitch_opt: solved.pitch,
        tsr_opt,
    };
    let (uinf_low, uinf_high) = ZoneBoundaries::band_edges(tsr_opt, limits, settings.tip_radius);
    let (uinf_switch, switch_found) =
        switch_speed(evaluator, limits, settings, uinf_high, uinf_max)?;

    info!(
        reference_uinf = u_ref,
        omega_opt = reference.omega_opt,
        pitch_opt = reference.pitch_opt,
        tsr_opt,
        uinf_low,
        uinf_high,
        uinf_switch,
        "zone boundaries"
    );

    Ok(Some(Calibration {
        reference,
        boundaries: ZoneBoundaries {
            uinf_low,
            uinf_high,
            uinf_switch,
            switch_found,
        },
        reference_converged: solved.converged,
    }))
}
