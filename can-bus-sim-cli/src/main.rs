//! CAN Bus Simulator CLI Application
//!
//! Command-line front end for the can-bus-sim library:
//! - Loads a TOML simulation configuration
//! - Applies command-line overrides
//! - Runs the bus-off attack simulation
//! - Prints a per-node summary and exports the JSON report

use anyhow::{Context, Result};
use can_bus_sim::{Simulation, SimulationReport};
use clap::Parser;
use std::path::PathBuf;

mod config;
mod report;

use config::AppConfig;

/// CAN Bus Simulator - Bit-level CAN bus with a bus-off attacker
#[derive(Parser, Debug)]
#[command(name = "can-bus-sim-cli")]
#[command(about = "Simulate a CAN bus and a bus-off attack against a periodic node", long_about = None)]
#[command(version)]
struct Args {
    /// Path to configuration file (config.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Global clock period in microseconds
    #[arg(long, value_name = "MICROS")]
    clock_us: Option<u64>,

    /// Victim transmission period in bus frame-counter units
    #[arg(short, long, value_name = "FRAMES")]
    period: Option<u64>,

    /// Seed for random frame generation
    #[arg(long, value_name = "SEED")]
    seed: Option<u64>,

    /// Stop once the bus frame counter reaches this value
    #[arg(long, value_name = "COUNT")]
    max_frames: Option<u64>,

    /// Write the JSON report to this file
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Run without the attacker (requires a frame limit)
    #[arg(long)]
    no_attacker: bool,

    /// Verbosity level (can be repeated: -v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.verbose, args.quiet);

    log::info!("CAN Bus Simulator CLI v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using simulator library v{}", can_bus_sim::VERSION);

    let config = match &args.config {
        Some(path) => {
            log::info!("Loading configuration from: {:?}", path);
            config::load_config(path)?
        }
        None => AppConfig::default(),
    };
    let config = apply_overrides(config, &args);

    let report = run_simulation(&config, args.quiet)?;

    if !args.quiet && config.output.summary {
        println!("{}", report::format_summary(&report));
    }

    match &report.bus_off_node {
        Some(node) => println!("{} entered BUS_OFF. Stopping all threads.", node),
        None if !args.quiet => println!("No node entered BUS_OFF."),
        None => {}
    }

    if let Some(path) = &config.output.json {
        report::write_json(&report, path)?;
        if !args.quiet {
            println!("✓ Report written to {:?}", path);
        }
    }

    Ok(())
}

/// Command-line flags take precedence over the configuration file
fn apply_overrides(mut config: AppConfig, args: &Args) -> AppConfig {
    let sim = &mut config.simulation;
    if let Some(clock_us) = args.clock_us {
        sim.clock_period_us = clock_us;
    }
    if let Some(period) = args.period {
        sim.victim.period = Some(period);
    }
    if let Some(seed) = args.seed {
        sim.seed = Some(seed);
    }
    if let Some(max_frames) = args.max_frames {
        sim.max_frames = Some(max_frames);
    }
    if args.no_attacker {
        sim.attacker.enabled = false;
    }
    if let Some(output) = &args.output {
        config.output.json = Some(output.clone());
    }
    config
}

fn run_simulation(config: &AppConfig, quiet: bool) -> Result<SimulationReport> {
    let simulation =
        Simulation::new(config.simulation.clone()).context("Invalid simulation configuration")?;

    if !quiet {
        let sim = simulation.config();
        println!("═══════════════════════════════════════════════");
        println!("  CAN Bus Simulator");
        println!("═══════════════════════════════════════════════\n");
        println!("  Clock period:  {:?}", sim.clock_period());
        println!("  Pulses/bit:    {}", sim.pulses_per_bit);
        println!("  Nodes:         {}", sim.nodes().count());
        println!(
            "  Attacker:      {}",
            if sim.attacker.enabled { sim.attacker.name.as_str() } else { "disabled" }
        );
        if let Some(limit) = sim.max_frames {
            println!("  Frame limit:   {}", limit);
        }
        println!("───────────────────────────────────────────────\n");
    }

    simulation.run().context("Simulation failed")
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
