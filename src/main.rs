use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::FmtSubscriber;

use rotor_schedule::config;
use rotor_schedule::fixed;
use rotor_schedule::io::{
    self, BladeLoadSummary, FailureRow, Manifest, Metadata, PerformanceColumns, ResultBundle,
};
use rotor_schedule::{
    compute_blade_loads, run_fixed, AnalyticRotor, ControlOptimizer, Execution, RotorLimits,
};

#[derive(Parser, Debug)]
#[command(name = "rotor-schedule")]
#[command(version)]
#[command(about = "Wind turbine control schedule optimizer")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output directory
    #[arg(short, long, global = true, default_value = "results")]
    out: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: tracing::Level,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Optimize setpoints over the configured wind speed sweep
    Run {
        /// Also write results.json
        #[arg(long)]
        json: bool,
        /// Solve wind speeds on the calling thread
        #[arg(long, conflicts_with = "threads")]
        serial: bool,
        /// Worker threads (0 = one per CPU)
        #[arg(long)]
        threads: Option<usize>,
    },
    /// Evaluate the [[fixed]] operating points without optimization
    Fixed {
        /// Also write fixed_results.json
        #[arg(long)]
        json: bool,
    },
    /// Print the reference optimum, zone boundaries and per-speed regimes
    Zones,
    /// Validate a configuration file
    Validate,
    /// Print version information
    Version,
}

fn load_config(path: Option<&PathBuf>) -> Result<(config::Root, String)> {
    let path = path.context("--config required")?;
    let (cfg, text) = config::Root::load(path)?;
    info!(project = %cfg.project.name, config = %path.display(), "configuration loaded");
    Ok((cfg, text))
}

fn prepare_out_dir(out: &Path) -> Result<()> {
    fs::create_dir_all(out)
        .with_context(|| format!("creating output directory '{}'", out.display()))
}

// ============================================================================
// Run Modes
// ============================================================================

fn run_schedule(
    cfg: &config::Root,
    cfg_text: &str,
    out: &Path,
    json_output: bool,
    execution: Option<Execution>,
) -> Result<()> {
    let mut optimizer = ControlOptimizer::from_config(AnalyticRotor::from_config(cfg), cfg);
    if let Some(execution) = execution {
        optimizer.set_execution(execution);
    }

    let start = Instant::now();
    let outcome = optimizer
        .run_sweep(&cfg.sweep.uinf)
        .context("schedule initialization failed")?;
    let loads = compute_blade_loads(optimizer.evaluator(), &outcome.indexed_setpoints());
    let wall_time_ms = start.elapsed().as_secs_f64() * 1000.0;

    prepare_out_dir(out)?;
    let tip_radius = cfg.rotor.tip_radius;
    let schedule_path = out.join("schedule.csv");
    io::write_schedule_csv(
        &schedule_path,
        outcome.solved().map(|p| (&p.setpoint, p.converged)),
        tip_radius,
    )?;
    io::write_blade_loads_csv(&out.join("blade_loads.csv"), &loads)?;
    io::write_moments_csv(&out.join("moments.csv"), &loads)?;

    let suspect = outcome.solved().filter(|p| !p.converged).count();
    info!(
        solved = outcome.success_count(),
        failed = outcome.failure_count(),
        not_converged = suspect,
        load_failures = loads.failures.len(),
        wall_time_ms,
        "schedule written to {}",
        schedule_path.display()
    );

    if json_output {
        let json_path = out.join("results.json");
        let mut failures: Vec<FailureRow> =
            outcome.failures().map(|f| FailureRow::new("schedule", f)).collect();
        failures.extend(loads.failures.iter().map(|f| FailureRow::new("blade_loads", f)));
        let bundle = ResultBundle {
            manifest: Manifest::new(cfg, cfg_text),
            performance: PerformanceColumns::from_solved(outcome.solved(), tip_radius),
            blade_loads: BladeLoadSummary::from(&loads),
            metadata: Some(Metadata::from(&outcome.calibration)),
            failures,
        };
        io::write_json_bundle(&json_path, &bundle)?;
        info!("JSON bundle: {}", json_path.display());
    }

    if outcome.success_count() == 0 {
        bail!("all {} wind speeds failed", outcome.points.len());
    }
    Ok(())
}

fn run_fixed_points(
    cfg: &config::Root,
    cfg_text: &str,
    out: &Path,
    json_output: bool,
) -> Result<()> {
    let points = cfg
        .fixed
        .as_deref()
        .filter(|p| !p.is_empty())
        .context("[[fixed]] operating points required for the fixed command")?;

    let rotor = AnalyticRotor::from_config(cfg);
    let outcomes = run_fixed(&rotor, points);
    let evaluated = fixed::evaluated(&outcomes);
    let loads = compute_blade_loads(&rotor, &evaluated);

    prepare_out_dir(out)?;
    let tip_radius = cfg.rotor.tip_radius;
    let path = out.join("fixed.csv");
    io::write_schedule_csv(&path, evaluated.iter().map(|(_, sp)| (sp, true)), tip_radius)?;
    io::write_blade_loads_csv(&out.join("fixed_blade_loads.csv"), &loads)?;
    io::write_moments_csv(&out.join("fixed_moments.csv"), &loads)?;
    info!(
        points = points.len(),
        evaluated = evaluated.len(),
        "fixed points written to {}",
        path.display()
    );

    if json_output {
        let json_path = out.join("fixed_results.json");
        let mut failures: Vec<FailureRow> = outcomes
            .iter()
            .filter_map(|o| o.as_ref().err())
            .map(|f| FailureRow::new("fixed", f))
            .collect();
        failures.extend(loads.failures.iter().map(|f| FailureRow::new("blade_loads", f)));
        let bundle = ResultBundle {
            manifest: Manifest::new(cfg, cfg_text),
            performance: PerformanceColumns::from_fixed(
                evaluated.iter().map(|(_, sp)| sp),
                tip_radius,
            ),
            blade_loads: BladeLoadSummary::from(&loads),
            metadata: None,
            failures,
        };
        io::write_json_bundle(&json_path, &bundle)?;
        info!("JSON bundle: {}", json_path.display());
    }

    if evaluated.is_empty() {
        bail!("all {} fixed points failed", points.len());
    }
    Ok(())
}

fn print_zones(cfg: &config::Root) -> Result<()> {
    let mut optimizer = ControlOptimizer::from_config(AnalyticRotor::from_config(cfg), cfg);
    let calibration = *optimizer
        .initialize(&cfg.sweep.uinf)
        .context("schedule initialization failed")?;
    let limits = optimizer.limits();
    let (r, b) = (&calibration.reference, &calibration.boundaries);

    println!("rotor speed   [{:.4}, {:.4}] rpm", limits.omega_min, limits.omega_max);
    println!("pitch         [{:.2}, {:.2}] deg", limits.pitch_min, limits.pitch_max);
    println!(
        "reference     uinf={:.3} omega_opt={:.4} pitch_opt={:.4} tsr_opt={:.4}",
        r.uinf, r.omega_opt, r.pitch_opt, r.tsr_opt
    );
    println!("uinf_low      {:.4}", b.uinf_low);
    println!("uinf_high     {:.4}", b.uinf_high);
    println!(
        "uinf_switch   {:.4}{}",
        b.uinf_switch,
        if b.switch_found { "" } else { " (sweep maximum)" }
    );
    println!();
    println!("uinf      zone");
    for &u in &cfg.sweep.uinf {
        match optimizer.classify(u) {
            Ok(zone) => println!("{:<9.3} {}", u, zone),
            Err(e) => {
                warn!(uinf = u, error = %e, "classification failed");
                println!("{:<9.3} ?", u);
            }
        }
    }
    Ok(())
}

fn validate_config(path: Option<&PathBuf>) -> Result<()> {
    let (cfg, _) = load_config(path)?;
    let limits = RotorLimits::from_config(&cfg);
    let solver = cfg.solver();

    println!("config valid: {}", cfg.project.name);
    println!(
        "  rotor: R={} m, hub={} m, B={}, rated={:.3e} W, max tip speed={} m/s",
        cfg.rotor.tip_radius,
        cfg.rotor.hub_radius,
        cfg.rotor.blades,
        cfg.rotor.rated_power,
        cfg.rotor.max_tip_speed
    );
    println!(
        "  control: omega=[{}, {:.4}] rpm, pitch=[{}, {}] deg",
        limits.omega_min, limits.omega_max, limits.pitch_min, limits.pitch_max
    );
    println!("  sweep: {} wind speeds", cfg.sweep.uinf.len());
    println!(
        "  solver: max_iter={}, xtol={:.0e}, ftol={:.0e}, {}",
        solver.max_iter,
        solver.xtol,
        solver.ftol,
        if solver.serial { "serial".to_string() } else { format!("threads={}", solver.threads) }
    );
    if let Some(fixed) = &cfg.fixed {
        println!("  fixed points: {}", fixed.len());
    }
    Ok(())
}

fn print_version() {
    println!("rotor-schedule {}", env!("CARGO_PKG_VERSION"));
    println!("  Schema Version:  {}", io::SCHEMA_VERSION);
    println!("  Platform:        {}-{}", std::env::consts::OS, std::env::consts::ARCH);
}

// ============================================================================
// Main
// ============================================================================

fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("installing log subscriber")?;

    match args.command {
        Commands::Version => {
            print_version();
            Ok(())
        }
        Commands::Validate => validate_config(args.config.as_ref()),
        Commands::Zones => {
            let (cfg, _) = load_config(args.config.as_ref())?;
            print_zones(&cfg)
        }
        Commands::Run { json, serial, threads } => {
            let (cfg, cfg_text) = load_config(args.config.as_ref())?;
            let execution = match (serial, threads) {
                (true, _) => Some(Execution::Serial),
                (false, Some(threads)) => Some(Execution::Parallel { threads }),
                (false, None) => None,
            };
            run_schedule(&cfg, &cfg_text, &args.out, json, execution)
        }
        Commands::Fixed { json } => {
            let (cfg, cfg_text) = load_config(args.config.as_ref())?;
            run_fixed_points(&cfg, &cfg_text, &args.out, json)
        }
    }
}
