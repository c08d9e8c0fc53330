//! Output tables and the JSON result bundle

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File};
use std::hash::{Hash, Hasher};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::config;
use crate::error::PointFailure;
use crate::loads::{BladeLoadRecord, BladeLoads};
use crate::rotor::{omega_to_tsr, tip_speed};
use crate::schedule::{SetpointResult, SolvedPoint};
use crate::solvers::Fallback;
use crate::zones::{Calibration, Mode};

pub const SCHEMA_VERSION: &str = "1.0.0";
pub const PROGRAM: &str = "rotor-schedule";

/// Relative tolerance when matching span positions between records
const SPAN_TOL: f64 = 1e-9;

pub struct CsvWriter {
    w: BufWriter<File>,
}

impl CsvWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let f = File::create(path).with_context(|| format!("creating '{}'", path.display()))?;
        Ok(Self { w: BufWriter::new(f) })
    }

    pub fn write_schedule_header(&mut self) -> Result<()> {
        writeln!(self.w, "uinf,zone,omega,pitch,P,T,CT,CP,Mb,niter,tsr,tip_speed,converged")?;
        Ok(())
    }

    pub fn write_schedule_row(
        &mut self,
        sp: &SetpointResult,
        converged: bool,
        tip_radius: f64,
    ) -> Result<()> {
        writeln!(
            self.w,
            "{:.4},{},{:.6},{:.6},{:.6e},{:.6e},{:.6},{:.6},{:.6e},{},{:.6},{:.4},{}",
            sp.uinf,
            sp.zone,
            sp.omega,
            sp.pitch,
            sp.power,
            sp.thrust,
            sp.ct,
            sp.cp,
            sp.blade_moment,
            sp.iterations,
            omega_to_tsr(sp.omega, sp.uinf, tip_radius),
            tip_speed(sp.omega, tip_radius),
            converged
        )?;
        Ok(())
    }

    /// Wide spanwise table: one `r` column, then `Np_<u>` and `Tp_<u>` per record.
    ///
    /// Span positions come from the first record; records must share them.
    /// Nothing is written when they don't.
    pub fn write_blade_loads(&mut self, records: &[BladeLoadRecord]) -> Result<()> {
        check_span_grid(records)?;
        let mut header = vec!["r".to_string()];
        for rec in records {
            header.push(format!("Np_{:.1}", rec.uinf));
            header.push(format!("Tp_{:.1}", rec.uinf));
        }
        writeln!(self.w, "{}", header.join(","))?;

        let Some(first) = records.first() else {
            return Ok(());
        };
        for (i, r) in first.r.iter().enumerate() {
            write!(self.w, "{:.6}", r)?;
            for rec in records {
                write!(self.w, ",{:.6e},{:.6e}", rec.np[i], rec.tp[i])?;
            }
            writeln!(self.w)?;
        }
        Ok(())
    }

    pub fn write_moments(&mut self, records: &[BladeLoadRecord]) -> Result<()> {
        writeln!(self.w, "uinf,flapwise_moment,edgewise_moment,combined_rms")?;
        for rec in records {
            writeln!(
                self.w,
                "{:.4},{:.6e},{:.6e},{:.6e}",
                rec.uinf, rec.flapwise_moment, rec.edgewise_moment, rec.combined_rms_moment
            )?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.w.flush()?;
        Ok(())
    }
}

/// Every record must sample loads at the span positions of the first one.
pub fn check_span_grid(records: &[BladeLoadRecord]) -> Result<()> {
    let Some(first) = records.first() else {
        return Ok(());
    };
    for rec in records {
        if rec.r.len() != first.r.len() {
            bail!(
                "span grid at {} m/s has {} stations, expected {}",
                rec.uinf,
                rec.r.len(),
                first.r.len()
            );
        }
        if rec.np.len() != rec.r.len() || rec.tp.len() != rec.r.len() {
            bail!(
                "loads at {} m/s have {} Np and {} Tp values for {} stations",
                rec.uinf,
                rec.np.len(),
                rec.tp.len(),
                rec.r.len()
            );
        }
        if let Some(i) = (0..rec.r.len()).find(|&i| {
            let (a, b) = (rec.r[i], first.r[i]);
            (a - b).abs() > SPAN_TOL * a.abs().max(b.abs()).max(1.0)
        }) {
            bail!(
                "span station {} at {} m/s is r={}, expected r={}",
                i,
                rec.uinf,
                rec.r[i],
                first.r[i]
            );
        }
    }
    Ok(())
}

/// Write `schedule.csv`-style rows for `(setpoint, converged)` pairs.
pub fn write_schedule_csv<'a>(
    path: &Path,
    rows: impl IntoIterator<Item = (&'a SetpointResult, bool)>,
    tip_radius: f64,
) -> Result<()> {
    let mut w = CsvWriter::create(path)?;
    w.write_schedule_header()?;
    for (sp, converged) in rows {
        w.write_schedule_row(sp, converged, tip_radius)?;
    }
    w.flush()
}

pub fn write_blade_loads_csv(path: &Path, loads: &BladeLoads) -> Result<()> {
    check_span_grid(&loads.records)?;
    let mut w = CsvWriter::create(path)?;
    w.write_blade_loads(&loads.records)?;
    w.flush()
}

pub fn write_moments_csv(path: &Path, loads: &BladeLoads) -> Result<()> {
    let mut w = CsvWriter::create(path)?;
    w.write_moments(&loads.records)?;
    w.flush()
}

// ============================================================================
// JSON result bundle
// ============================================================================

#[derive(Serialize)]
pub struct Manifest {
    pub schema_version: String,
    pub solver_version: String,
    pub program: String,
    pub timestamp_utc: String,
    pub platform: String,
    pub config_hash: String,
    pub config_snapshot: config::Root,
}

impl Manifest {
    pub fn new(cfg: &config::Root, cfg_text: &str) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            solver_version: env!("CARGO_PKG_VERSION").to_string(),
            program: PROGRAM.to_string(),
            timestamp_utc: chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            config_hash: config_hash(cfg_text),
            config_snapshot: cfg.clone(),
        }
    }
}

pub fn config_hash(text: &str) -> String {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Column-oriented `performance`: every field is a list indexed like `uinf`
#[derive(Debug, Default, Serialize)]
pub struct PerformanceColumns {
    pub uinf: Vec<f64>,
    pub zone: Vec<Mode>,
    pub omega: Vec<f64>,
    pub pitch: Vec<f64>,
    #[serde(rename = "P")]
    pub power: Vec<f64>,
    #[serde(rename = "T")]
    pub thrust: Vec<f64>,
    #[serde(rename = "CT")]
    pub ct: Vec<f64>,
    #[serde(rename = "CP")]
    pub cp: Vec<f64>,
    #[serde(rename = "Mb")]
    pub blade_moment: Vec<f64>,
    #[serde(rename = "niter")]
    pub iterations: Vec<usize>,
    pub tsr: Vec<f64>,
    pub tip_speed: Vec<f64>,
    pub converged: Vec<bool>,
    pub fallback: Vec<Option<Fallback>>,
    pub evaluations: Vec<usize>,
}

impl PerformanceColumns {
    pub fn push(
        &mut self,
        sp: &SetpointResult,
        converged: bool,
        fallback: Option<Fallback>,
        evaluations: usize,
        tip_radius: f64,
    ) {
        self.uinf.push(sp.uinf);
        self.zone.push(sp.zone);
        self.omega.push(sp.omega);
        self.pitch.push(sp.pitch);
        self.power.push(sp.power);
        self.thrust.push(sp.thrust);
        self.ct.push(sp.ct);
        self.cp.push(sp.cp);
        self.blade_moment.push(sp.blade_moment);
        self.iterations.push(sp.iterations);
        self.tsr.push(omega_to_tsr(sp.omega, sp.uinf, tip_radius));
        self.tip_speed.push(tip_speed(sp.omega, tip_radius));
        self.converged.push(converged);
        self.fallback.push(fallback);
        self.evaluations.push(evaluations);
    }

    pub fn from_solved<'a>(
        points: impl IntoIterator<Item = &'a SolvedPoint>,
        tip_radius: f64,
    ) -> Self {
        let mut cols = Self::default();
        for p in points {
            cols.push(&p.setpoint, p.converged, p.fallback, p.evaluations, tip_radius);
        }
        cols
    }

    /// Fixed points: evaluated once, nothing to converge
    pub fn from_fixed<'a>(
        setpoints: impl IntoIterator<Item = &'a SetpointResult>,
        tip_radius: f64,
    ) -> Self {
        let mut cols = Self::default();
        for sp in setpoints {
            cols.push(sp, true, None, 0, tip_radius);
        }
        cols
    }
}

#[derive(Serialize)]
pub struct SpanLoads {
    #[serde(rename = "Np")]
    pub np: Vec<f64>,
    #[serde(rename = "Tp")]
    pub tp: Vec<f64>,
}

/// Column-oriented blade loads, indexed like `uinf_list`
#[derive(Serialize)]
pub struct BladeLoadSummary {
    pub r: Vec<f64>,
    pub uinf_list: Vec<f64>,
    pub loads_list: Vec<SpanLoads>,
    pub flapwise_moments: Vec<f64>,
    pub edgewise_moments: Vec<f64>,
    pub combined_rms: Vec<f64>,
}

impl From<&BladeLoads> for BladeLoadSummary {
    fn from(loads: &BladeLoads) -> Self {
        let recs = &loads.records;
        Self {
            r: recs.first().map(|r| r.r.clone()).unwrap_or_default(),
            uinf_list: recs.iter().map(|r| r.uinf).collect(),
            loads_list: recs
                .iter()
                .map(|r| SpanLoads {
                    np: r.np.clone(),
                    tp: r.tp.clone(),
                })
                .collect(),
            flapwise_moments: recs.iter().map(|r| r.flapwise_moment).collect(),
            edgewise_moments: recs.iter().map(|r| r.edgewise_moment).collect(),
            combined_rms: recs.iter().map(|r| r.combined_rms_moment).collect(),
        }
    }
}

/// Zone boundaries keep the capitalized keys plotting tools read
#[derive(Serialize)]
pub struct Metadata {
    #[serde(rename = "Uinf_low")]
    pub uinf_low: f64,
    #[serde(rename = "Uinf_high")]
    pub uinf_high: f64,
    #[serde(rename = "Uinf_switch")]
    pub uinf_switch: f64,
    pub switch_found: bool,
    pub omega_opt: f64,
    pub pitch_opt: f64,
    pub tsr_opt: f64,
    pub reference_uinf: f64,
}

impl From<&Calibration> for Metadata {
    fn from(c: &Calibration) -> Self {
        Self {
            uinf_low: c.boundaries.uinf_low,
            uinf_high: c.boundaries.uinf_high,
            uinf_switch: c.boundaries.uinf_switch,
            switch_found: c.boundaries.switch_found,
            omega_opt: c.reference.omega_opt,
            pitch_opt: c.reference.pitch_opt,
            tsr_opt: c.reference.tsr_opt,
            reference_uinf: c.reference.uinf,
        }
    }
}

#[derive(Serialize)]
pub struct FailureRow {
    pub stage: &'static str,
    pub index: usize,
    pub uinf: f64,
    pub error: String,
}

impl FailureRow {
    pub fn new(stage: &'static str, failure: &PointFailure) -> Self {
        Self {
            stage,
            index: failure.index,
            uinf: failure.uinf,
            error: failure.error.to_string(),
        }
    }
}

#[derive(Serialize)]
pub struct ResultBundle {
    pub manifest: Manifest,
    pub performance: PerformanceColumns,
    pub blade_loads: BladeLoadSummary,
    /// Absent for fixed-point runs
    pub metadata: Option<Metadata>,
    pub failures: Vec<FailureRow>,
}

pub fn write_json_bundle(path: &Path, bundle: &ResultBundle) -> Result<()> {
    let json = serde_json::to_string_pretty(bundle)?;
    fs::write(path, json).with_context(|| format!("writing '{}'", path.display()))?;
    Ok(())
}
