//! Quiesce command-line driver
//!
//! Runs the grace-period torture harness and a workqueue demo on a hosted
//! machine. Logging goes to stderr and is controlled by `RUST_LOG`.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quiesce")]
#[command(about = "Passive serialization and workqueue driver", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Hammer readers and writers and check every grace period
    Torture {
        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Number of virtual CPUs (0 = host CPUs)
        #[arg(long)]
        cpus: Option<usize>,
        /// Reader threads (0 = one per CPU)
        #[arg(long)]
        readers: Option<usize>,
        /// Writer threads
        #[arg(long)]
        writers: Option<usize>,
        /// Length of the run in milliseconds
        #[arg(long)]
        duration_ms: Option<u64>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run numbered work items through a workqueue
    Workqueue {
        /// Number of virtual CPUs (0 = host CPUs)
        #[arg(long, default_value_t = 4)]
        cpus: usize,
        /// Items to enqueue
        #[arg(long, default_value_t = 100)]
        items: usize,
        /// One queue per CPU, items spread round-robin
        #[arg(long)]
        percpu: bool,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging();

    match cli.command {
        Commands::Torture {
            config,
            cpus,
            readers,
            writers,
            duration_ms,
            json,
        } => commands::torture::execute(commands::torture::TortureArgs {
            config,
            cpus,
            readers,
            writers,
            duration_ms,
            json,
        }),

        Commands::Workqueue {
            cpus,
            items,
            percpu,
        } => commands::workqueue::execute(cpus, items, percpu),
    }
}
