//! `quiesce torture`: grace-period torture run.

use anyhow::{bail, Context};
use quiesce_core::torture::{self, TortureReport};
use quiesce_core::{Config, Engine, Machine};
use std::path::PathBuf;

/// Command-line overrides on top of the config file
pub struct TortureArgs {
    pub config: Option<PathBuf>,
    pub cpus: Option<usize>,
    pub readers: Option<usize>,
    pub writers: Option<usize>,
    pub duration_ms: Option<u64>,
    pub json: bool,
}

/// Load the config file (if any) and apply the flags over it
fn resolve_config(args: &TortureArgs) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(cpus) = args.cpus {
        config.machine.ncpu = cpus;
    }
    if let Some(readers) = args.readers {
        config.torture.readers = readers;
    }
    if let Some(writers) = args.writers {
        config.torture.writers = writers;
    }
    if let Some(duration_ms) = args.duration_ms {
        config.torture.duration_ms = duration_ms;
    }

    config.validate().context("Invalid torture settings")?;
    Ok(config)
}

fn print_report(report: &TortureReport, ncpu: usize) {
    println!("cpus:          {}", ncpu);
    println!("reads:         {}", report.reads);
    println!("updates:       {}", report.updates);
    println!("grace periods: {}", report.grace_periods);
    println!("max grace:     {} us", report.max_grace_us);
    println!("violations:    {}", report.violations);
}

pub fn execute(args: TortureArgs) -> anyhow::Result<()> {
    let config = resolve_config(&args)?;

    let machine = Machine::new(config.machine.clone());
    let engine = Engine::new(machine.clone());
    let ncpu = config.machine.effective_ncpu();

    let report = torture::run(&machine, &engine, &config.torture).context("Torture run failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report, ncpu);
    }

    if !report.passed() {
        bail!("{} grace-period violations", report.violations);
    }
    Ok(())
}
