//! fleetsim CLI — Compare datacenter placement policies in simulation.

use clap::{Parser, Subcommand};
use fleetsim_core::config::SimConfig;
use fleetsim_core::metrics;
use fleetsim_core::simulation::Simulation;
use std::path::PathBuf;
use tracing_subscriber::filter::LevelFilter;

#[derive(Parser)]
#[command(
    name = "fleetsim",
    about = "Compare datacenter placement policies in simulation",
    version
)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulation with a single placement policy.
    Run {
        /// Path to TOML configuration file.
        #[arg(short, long)]
        config: PathBuf,
        /// Placement policy; overrides `scheduler.policy`.
        #[arg(short, long)]
        scheduler: Option<String>,
        /// Stop at this virtual time (ms) instead of running to completion.
        #[arg(long)]
        until: Option<u64>,
        /// Output results to JSON file.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Compare several policies on the same config.
    Compare {
        /// Path to TOML configuration file.
        #[arg(short, long)]
        config: PathBuf,
        /// Comma-separated list of policy names.
        #[arg(short = 'S', long, value_delimiter = ',')]
        schedulers: Vec<String>,
        /// Output results to JSON file.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List available placement policies, filters and weighers.
    ListSchedulers,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: &PathBuf) -> SimConfig {
    SimConfig::from_file(path).unwrap_or_else(|e| {
        eprintln!("Error loading config: {}", e);
        std::process::exit(1);
    })
}

fn write_json<T: serde::Serialize>(value: &T, path: &PathBuf) {
    let json = serde_json::to_string_pretty(value).unwrap_or_else(|e| {
        eprintln!("Error serializing results: {}", e);
        std::process::exit(1);
    });
    std::fs::write(path, json).unwrap_or_else(|e| {
        eprintln!("Error writing output: {}", e);
        std::process::exit(1);
    });
    println!("Results written to {}", path.display());
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Run {
            config,
            scheduler,
            until,
            output,
        } => {
            let sim_config = load_config(&config);
            let policy = scheduler.unwrap_or_else(|| sim_config.scheduler.policy.clone());
            if !fleetsim_scheduler::available_schedulers().contains(&policy.as_str()) {
                eprintln!(
                    "Unknown scheduler: {}. Available: {:?}",
                    policy,
                    fleetsim_scheduler::available_schedulers()
                );
                std::process::exit(1);
            }

            let sim = Simulation::from_config_with_policy(&sim_config, &policy)
                .unwrap_or_else(|e| {
                    eprintln!("Error building simulation: {}", e);
                    std::process::exit(1);
                });
            let result = match until {
                Some(deadline) => sim.run_until(deadline),
                None => sim.run(),
            }
            .unwrap_or_else(|e| {
                eprintln!("Simulation failed: {}", e);
                std::process::exit(1);
            });
            println!("{}", metrics::format_table(&result));

            if let Some(output_path) = output {
                write_json(&result, &output_path);
            }
        }
        Commands::Compare {
            config,
            schedulers,
            output,
        } => {
            let sim_config = load_config(&config);
            let names: Vec<&str> = if schedulers.is_empty() {
                fleetsim_scheduler::available_schedulers()
            } else {
                schedulers.iter().map(|s| s.as_str()).collect()
            };

            let results = fleetsim_core::compare_schedulers(&sim_config, &names);
            println!("{}", metrics::format_comparison_table(&results));

            for result in &results {
                println!("{}", metrics::format_table(result));
            }

            if let Some(output_path) = output {
                write_json(&results, &output_path);
            }
        }
        Commands::ListSchedulers => {
            println!("Available placement policies:");
            for name in fleetsim_scheduler::available_schedulers() {
                println!("  - {}", name);
            }
            println!("Filters:");
            for name in fleetsim_scheduler::filters::available_filters() {
                println!("  - {}", name);
            }
            println!("Weighers:");
            for name in fleetsim_scheduler::weighers::available_weighers() {
                println!("  - {}", name);
            }
        }
    }
}
