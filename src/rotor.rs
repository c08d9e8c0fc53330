//! Rotor kinematics and control limits

use serde::Serialize;
use std::f64::consts::PI;

use crate::config;

pub fn rpm_to_rad_s(omega_rpm: f64) -> f64 {
    omega_rpm * 2.0 * PI / 60.0
}

/// Blade tip speed in m/s
pub fn tip_speed(omega_rpm: f64, radius: f64) -> f64 {
    rpm_to_rad_s(omega_rpm) * radius
}

/// Rotor speed (rpm) holding `tsr` at `uinf`, capped by the maximum tip speed
pub fn tsr_to_omega(tsr: f64, uinf: f64, radius: f64, max_tip_speed: f64) -> f64 {
    let ts = (uinf * tsr).min(max_tip_speed);
    ts * 60.0 / (2.0 * PI * radius)
}

pub fn omega_to_tsr(omega_rpm: f64, uinf: f64, radius: f64) -> f64 {
    tip_speed(omega_rpm, radius) / uinf
}

/// Admissible control box, fixed for the optimizer's lifetime
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct RotorLimits {
    /// rpm
    pub omega_min: f64,
    /// rpm, from the tip speed limit
    pub omega_max: f64,
    /// deg
    pub pitch_min: f64,
    /// deg
    pub pitch_max: f64,
}

impl RotorLimits {
    pub fn new(
        omega_min: f64,
        max_tip_speed: f64,
        tip_radius: f64,
        pitch_min: f64,
        pitch_max: f64,
    ) -> Self {
        Self {
            omega_min,
            omega_max: max_tip_speed * 60.0 / (2.0 * PI * tip_radius),
            pitch_min,
            pitch_max,
        }
    }

    pub fn from_config(cfg: &config::Root) -> Self {
        Self::new(
            cfg.control.omega_min,
            cfg.rotor.max_tip_speed,
            cfg.rotor.tip_radius,
            cfg.control.pitch_min,
            cfg.control.pitch_max,
        )
    }

    pub fn clamp_omega(&self, omega: f64) -> f64 {
        omega.max(self.omega_min).min(self.omega_max)
    }

    pub fn clamp_pitch(&self, pitch: f64) -> f64 {
        pitch.max(self.pitch_min).min(self.pitch_max)
    }
}

/// Optimal operating point at the reference wind speed
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ReferenceState {
    /// Sweep value actually used as the reference
    pub uinf: f64,
    /// rpm
    pub omega_opt: f64,
    /// deg
    pub pitch_opt: f64,
    pub tsr_opt: f64,
}
