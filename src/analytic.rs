//! Analytic reference rotor
//!
//! A closed-form power-coefficient surface standing in for a full blade
//! element momentum model. Good enough to give the optimizer a smooth,
//! physically shaped landscape: a single power optimum in tip-speed ratio at
//! fine pitch, and power falling monotonically as the blades pitch to
//! feather.
//!
//! Power coefficient (Heier):
//!
//! ```text
//! Cp(λ, β) = c1 (c2/λi - c3 β - c4) exp(-c5/λi) + c6 λ
//! 1/λi     = 1/(λ + 0.08 β) - 0.035/(β³ + 1)
//! ```
//!
//! with β clamped at zero below fine pitch. The thrust coefficient follows
//! from momentum theory by inverting `Cp = 4a(1-a)²` on `a ∈ [0, 1/3]`.
//! Spanwise loads spread thrust linearly and torque uniformly between hub
//! and tip, so their root integrals reproduce thrust and torque per blade.
//! Inflow is uniform, so azimuth has no effect.

use std::convert::Infallible;
use std::f64::consts::PI;

use crate::config;
use crate::evaluator::{
    check_lengths, Coefficients, DistributedLoads, Evaluator, EvaluatorError, PerformanceOutputs,
};
use crate::numerics::{find_root, linspace, Tolerances};
use crate::rotor::rpm_to_rad_s;

/// Betz limit, 16/27
const CP_BETZ: f64 = 16.0 / 27.0;

/// Coefficients of the Cp(λ, β) surface
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CpSurface {
    pub c1: f64,
    pub c2: f64,
    pub c3: f64,
    pub c4: f64,
    pub c5: f64,
    pub c6: f64,
}

impl Default for CpSurface {
    fn default() -> Self {
        Self {
            c1: 0.5176,
            c2: 116.0,
            c3: 0.4,
            c4: 5.0,
            c5: 21.0,
            c6: 0.0068,
        }
    }
}

impl CpSurface {
    pub fn power_coefficient(&self, tsr: f64, pitch_deg: f64) -> f64 {
        let beta = pitch_deg.max(0.0);
        let inv_li = 1.0 / (tsr + 0.08 * beta) - 0.035 / (beta.powi(3) + 1.0);
        self.c1 * (self.c2 * inv_li - self.c3 * beta - self.c4) * (-self.c5 * inv_li).exp()
            + self.c6 * tsr
    }
}

/// Thrust coefficient consistent with `cp` under momentum theory.
pub fn thrust_coefficient(cp: f64) -> f64 {
    if cp <= 0.0 {
        return 0.0;
    }
    let target = cp.min(CP_BETZ);
    let tol = Tolerances {
        xtol: 1e-12,
        ..Default::default()
    };
    let a = find_root(
        |a| Ok::<_, Infallible>(4.0 * a * (1.0 - a).powi(2) - target),
        (0.0, 1.0 / 3.0),
        &tol,
    )
    .map(|root| root.x)
    .unwrap_or(1.0 / 3.0);
    4.0 * a * (1.0 - a)
}

#[derive(Clone, Debug, PartialEq)]
pub struct AnalyticRotor {
    pub tip_radius: f64,
    pub hub_radius: f64,
    pub blades: u32,
    pub rho: f64,
    pub n_span: usize,
    pub surface: CpSurface,
}

impl AnalyticRotor {
    pub fn new(tip_radius: f64, hub_radius: f64, blades: u32, rho: f64) -> Self {
        Self {
            tip_radius,
            hub_radius,
            blades,
            rho,
            n_span: 50,
            surface: CpSurface::default(),
        }
    }

    pub fn from_config(cfg: &config::Root) -> Self {
        let mut rotor = Self::new(
            cfg.rotor.tip_radius,
            cfg.rotor.hub_radius,
            cfg.rotor.blades,
            cfg.rotor.rho,
        );
        if let Some(ref aero) = cfg.aero {
            rotor.n_span = aero.n_span;
            rotor.surface = aero.surface();
        }
        rotor
    }

    pub fn with_span_points(mut self, n_span: usize) -> Self {
        self.n_span = n_span;
        self
    }

    pub fn swept_area(&self) -> f64 {
        PI * self.tip_radius * self.tip_radius
    }

    fn tsr(&self, uinf: f64, omega: f64) -> f64 {
        rpm_to_rad_s(omega) * self.tip_radius / uinf
    }

    fn check(&self, uinf: f64, omega: f64, pitch: f64) -> Result<(), EvaluatorError> {
        let reason = if !(uinf.is_finite() && omega.is_finite() && pitch.is_finite()) {
            "non-finite input"
        } else if uinf <= 0.0 {
            "wind speed must be positive"
        } else if omega <= 0.0 {
            "rotor speed must be positive"
        } else {
            return Ok(());
        };
        Err(EvaluatorError::InvalidInput {
            uinf,
            omega,
            pitch,
            reason: reason.to_string(),
        })
    }

    /// ∫ r dr and ∫ r² dr from hub to tip
    fn span_moments(&self) -> (f64, f64) {
        let (rh, rt) = (self.hub_radius, self.tip_radius);
        (
            (rt * rt - rh * rh) / 2.0,
            (rt.powi(3) - rh.powi(3)) / 3.0,
        )
    }

    /// (power, thrust, ct, cp, blade root moment)
    fn point(&self, uinf: f64, omega: f64, pitch: f64) -> Result<[f64; 5], EvaluatorError> {
        self.check(uinf, omega, pitch)?;
        let cp = self.surface.power_coefficient(self.tsr(uinf, omega), pitch);
        let ct = thrust_coefficient(cp);
        let q = 0.5 * self.rho * self.swept_area() * uinf * uinf;
        let power = q * uinf * cp;
        let thrust = q * ct;
        // Np(r) = thrust / B * r / ∫r dr, moment about the axis
        let (m1, m2) = self.span_moments();
        let blade_moment = thrust / self.blades as f64 * m2 / m1;
        Ok([power, thrust, ct, cp, blade_moment])
    }
}

impl Evaluator for AnalyticRotor {
    fn evaluate(
        &self,
        wind_speeds: &[f64],
        rotor_speeds: &[f64],
        pitches: &[f64],
        want_coefficients: bool,
    ) -> Result<PerformanceOutputs, EvaluatorError> {
        let n = check_lengths(wind_speeds, rotor_speeds, pitches)?;
        let mut out = PerformanceOutputs {
            power: Vec::with_capacity(n),
            thrust: Vec::with_capacity(n),
            blade_moment: Vec::with_capacity(n),
            coefficients: None,
        };
        let mut coeffs = Coefficients::default();

        for i in 0..n {
            let [p, t, ct, cp, mb] = self.point(wind_speeds[i], rotor_speeds[i], pitches[i])?;
            out.power.push(p);
            out.thrust.push(t);
            out.blade_moment.push(mb);
            if want_coefficients {
                coeffs.ct.push(ct);
                coeffs.cp.push(cp);
            }
        }
        if want_coefficients {
            out.coefficients = Some(coeffs);
        }
        Ok(out)
    }

    fn distributed_loads(
        &self,
        wind_speed: f64,
        rotor_speed: f64,
        pitch: f64,
        _azimuth: f64,
    ) -> Result<DistributedLoads, EvaluatorError> {
        let [power, thrust, ..] = self.point(wind_speed, rotor_speed, pitch)?;
        let torque = power / rpm_to_rad_s(rotor_speed);
        let per_blade = 1.0 / self.blades as f64;
        let (m1, _) = self.span_moments();

        let r = linspace(self.hub_radius, self.tip_radius, self.n_span);
        let np = r.iter().map(|ri| thrust * per_blade * ri / m1).collect();
        let tp = r.iter().map(|_| torque * per_blade / m1).collect();
        Ok(DistributedLoads { r, np, tp })
    }
}
