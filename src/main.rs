use anyhow::Result;
use clap::Parser;
use log::{debug, info};
use std::path::PathBuf;
use std::time::Instant;

// Define modules used by main
mod boundary;
mod equilibrium;
mod field;
mod lattice;
mod macroscopic;
mod output;
mod simulation;
mod streaming;

use channel_common::ChannelConfig;
use simulation::ChannelSimulation;

/// D2Q9 lattice Boltzmann solver for 2D Poiseuille channel flow.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML run configuration
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the output directory from the configuration
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    // Initialize the logger
    env_logger::init();
    let args = Args::parse();

    info!("Starting Channel Flow Engine (D2Q9 BGK)...");

    // --- Load Configuration ---
    let mut config = ChannelConfig::load(&args.config)?;
    if let Some(dir) = args.output {
        config.output.directory = dir;
    }
    info!("Loaded configuration from {}", args.config.display());
    info!("Using {} Rayon threads.", rayon::current_num_threads());

    // --- Initialize Simulation ---
    let mut sim = ChannelSimulation::new(config)?;
    let params = sim.params();
    info!(
        "Channel {}x{} | tau {:.3} (nu {:.4}) | u_max {:.4} | Re {:.1}",
        params.nx, params.ny, params.tau, params.nu, params.u_max, params.reynolds
    );
    debug!("Simulation Parameters: {:#?}", params);

    // --- Simulation Loop ---
    let start_time = Instant::now();
    let state = sim.run()?;
    let total_duration = start_time.elapsed();
    info!(
        "Simulation finished ({:?}) after {} steps in {:.3} seconds.",
        state,
        sim.current_step(),
        total_duration.as_secs_f64()
    );

    // --- Save Recorded Data ---
    info!("Saving results to {}...", sim.config().output.directory.display());
    output::save_results(&sim, total_duration.as_secs_f64())?;

    info!("Simulation Complete.");
    Ok(())
}
