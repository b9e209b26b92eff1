//! ptycho command-line interface.
//!
//! Run reconstructions from TOML configuration files:
//! ```sh
//! ptycho-cli run job.toml
//! ptycho-cli validate job.toml
//! ptycho-cli backends
//! ```

mod config;
mod runner;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use ptycho_compute::{ComputeBackend, CpuBackend};

#[derive(Parser)]
#[command(name = "ptycho-cli")]
#[command(about = "ptycho: Difference-Map ptychographic reconstruction")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a reconstruction from a TOML configuration file.
    Run {
        /// Path to the job configuration file.
        config: PathBuf,
        /// Output directory (overrides config file setting).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate a configuration file without running the reconstruction.
    Validate {
        /// Path to the job configuration file.
        config: PathBuf,
    },
    /// Display information about available compute backends.
    Backends,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, output } => {
            println!("ptycho Difference-Map Reconstruction");
            println!("====================================");
            let job = config::load_config(&config)?;
            println!("Configuration: {}", config.display());

            let result = runner::run_reconstruction(&job)?;

            let out_dir = output.unwrap_or_else(|| PathBuf::from(&job.output.directory));

            if job.output.save_errors {
                runner::write_errors_csv(&result.errors, &out_dir.join("errors.csv"), &job)?;
            }
            if job.output.save_json {
                runner::write_summary_json(&result, &out_dir.join("summary.json"))?;
            }
            if job.output.save_object {
                runner::write_object_csv(&result.state, &out_dir.join("object.csv"))?;
            }

            println!("Reconstruction complete.");
            Ok(())
        }
        Commands::Validate { config } => {
            let _job = config::load_config(&config)?;
            println!("Configuration is valid: {}", config.display());
            Ok(())
        }
        Commands::Backends => {
            let cpu = CpuBackend::new().device_info();
            println!("Available compute backends:");
            println!();
            println!("  cpu   {} (Rayon)", cpu.name);
            println!("  auto  selects cpu");
            println!();
            println!("  gpu   not available in this build");
            Ok(())
        }
    }
}
