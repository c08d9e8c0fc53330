use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::analytic::CpSurface;
use crate::numerics::Tolerances;
use crate::rotor::RotorLimits;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Root {
    pub project: Project,
    pub rotor: Rotor,
    pub control: Control,
    pub sweep: Sweep,
    pub solver: Option<Solver>,
    pub aero: Option<Aero>,
    /// Fixed operating points, evaluated without optimization
    pub fixed: Option<Vec<OperatingPoint>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Project {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Rotor {
    /// m
    pub tip_radius: f64,
    /// m
    #[serde(default)]
    pub hub_radius: f64,
    pub blades: u32,
    /// kg/m³
    #[serde(default = "default_rho")]
    pub rho: f64,
    /// m/s
    pub max_tip_speed: f64,
    /// W
    pub rated_power: f64,
}

fn default_rho() -> f64 { 1.225 }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Control {
    /// Minimum rotor speed, rpm
    pub omega_min: f64,
    /// deg
    #[serde(default)]
    pub pitch_min: f64,
    /// deg
    #[serde(default = "default_pitch_max")]
    pub pitch_max: f64,
    /// Wind speed at which the reference optimum is computed, m/s
    #[serde(default = "default_reference_uinf")]
    pub reference_uinf: f64,
    /// Tip-speed ratio seeding the reference optimization
    #[serde(default = "default_initial_tsr")]
    pub initial_tsr: f64,
    /// deg
    #[serde(default)]
    pub initial_pitch: f64,
}

fn default_pitch_max() -> f64 { 30.0 }
fn default_reference_uinf() -> f64 { 6.0 }
fn default_initial_tsr() -> f64 { 10.0 }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Sweep {
    /// Wind speeds, m/s, in output order
    pub uinf: Vec<f64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Solver {
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,
    #[serde(default = "default_xtol")]
    pub xtol: f64,
    #[serde(default = "default_ftol")]
    pub ftol: f64,
    /// Worker threads; 0 = one per CPU
    #[serde(default)]
    pub threads: usize,
    /// Solve the sweep on the calling thread
    #[serde(default)]
    pub serial: bool,
}

fn default_max_iter() -> usize { 200 }
fn default_xtol() -> f64 { 1e-4 }
fn default_ftol() -> f64 { 1e-8 }

impl Default for Solver {
    fn default() -> Self {
        Self {
            max_iter: default_max_iter(),
            xtol: default_xtol(),
            ftol: default_ftol(),
            threads: 0,
            serial: false,
        }
    }
}

impl Solver {
    pub fn tolerances(&self) -> Tolerances {
        Tolerances {
            xtol: self.xtol,
            ftol: self.ftol,
            max_iter: self.max_iter,
        }
    }
}

/// Reference evaluator settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Aero {
    /// Span stations for distributed loads
    #[serde(default = "default_n_span")]
    pub n_span: usize,
    /// Cp surface coefficients; defaults to Heier's values
    #[serde(default)]
    pub cp_coefficients: Option<[f64; 6]>,
}

fn default_n_span() -> usize { 50 }

impl Aero {
    pub fn surface(&self) -> CpSurface {
        match self.cp_coefficients {
            Some([c1, c2, c3, c4, c5, c6]) => CpSurface { c1, c2, c3, c4, c5, c6 },
            None => CpSurface::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct OperatingPoint {
    pub uinf: f64,
    /// rpm
    pub omega: f64,
    /// deg
    pub pitch: f64,
}

impl Root {
    /// Parse TOML text and validate it.
    pub fn parse(text: &str) -> Result<Self> {
        let cfg: Root = toml::from_str(text).context("parsing configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse and validate a configuration file; also returns the raw text.
    pub fn load(path: &Path) -> Result<(Self, String)> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading configuration '{}'", path.display()))?;
        let cfg = Self::parse(&text)
            .with_context(|| format!("loading configuration '{}'", path.display()))?;
        Ok((cfg, text))
    }

    pub fn solver(&self) -> Solver {
        self.solver.clone().unwrap_or_default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.project.name.trim().is_empty() {
            bail!("project.name must not be empty");
        }

        let rotor = &self.rotor;
        if !(rotor.tip_radius > 0.0) {
            bail!("rotor.tip_radius must be positive");
        }
        if !(0.0..rotor.tip_radius).contains(&rotor.hub_radius) {
            bail!("rotor.hub_radius must be in [0, tip_radius)");
        }
        if rotor.blades == 0 {
            bail!("rotor.blades must be >= 1");
        }
        if !(rotor.rho > 0.0) {
            bail!("rotor.rho must be positive");
        }
        if !(rotor.max_tip_speed > 0.0) {
            bail!("rotor.max_tip_speed must be positive");
        }
        if !(rotor.rated_power > 0.0) {
            bail!("rotor.rated_power must be positive");
        }

        let control = &self.control;
        if !(control.omega_min > 0.0) {
            bail!("control.omega_min must be positive");
        }
        let limits = RotorLimits::from_config(self);
        if control.omega_min >= limits.omega_max {
            bail!(
                "control.omega_min ({}) must be below the tip-speed limited maximum ({:.4} rpm)",
                control.omega_min,
                limits.omega_max
            );
        }
        if !(control.pitch_min < control.pitch_max) {
            bail!("control.pitch_min must be < control.pitch_max");
        }
        if !(control.reference_uinf > 0.0) {
            bail!("control.reference_uinf must be positive");
        }
        if !(control.initial_tsr > 0.0) {
            bail!("control.initial_tsr must be positive");
        }

        if self.sweep.uinf.is_empty() {
            bail!("sweep.uinf must contain at least one wind speed");
        }
        if let Some(bad) = self.sweep.uinf.iter().find(|u| !(u.is_finite() && **u > 0.0)) {
            bail!("sweep.uinf values must be positive and finite, got {}", bad);
        }

        if let Some(ref solver) = self.solver {
            if solver.max_iter == 0 || solver.max_iter > 100_000 {
                bail!("solver.max_iter must be in [1, 100000]");
            }
            if !(solver.xtol > 0.0) {
                bail!("solver.xtol must be positive");
            }
            if !(solver.ftol > 0.0) {
                bail!("solver.ftol must be positive");
            }
        }

        if let Some(ref aero) = self.aero {
            if aero.n_span < 2 {
                bail!("aero.n_span must be >= 2");
            }
        }

        if let Some(ref fixed) = self.fixed {
            for (i, op) in fixed.iter().enumerate() {
                if !(op.uinf > 0.0) {
                    bail!("fixed[{}].uinf must be positive", i);
                }
                if !(op.omega > 0.0) {
                    bail!("fixed[{}].omega must be positive", i);
                }
                if !op.pitch.is_finite() {
                    bail!("fixed[{}].pitch must be finite", i);
                }
            }
        }

        Ok(())
    }
}
