//! foresight-sim - drive the prediction stack over a loopback network.
//!
//! - `foresight-sim run <SCENARIO>...` - run scenarios and print a JSON report
//! - `foresight-sim run --all` - run every scenario
//! - `foresight-sim scenarios` - list what can be run
//! - `foresight-sim config` - print the effective configuration as YAML

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use foresight_sim::{run_all, Scenario, ScenarioReport, SimConfig};

#[derive(Parser)]
#[command(name = "foresight-sim")]
#[command(about = "Client-side prediction loopback harness", version)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run scenarios and print their report
    Run {
        /// Scenarios to run
        #[arg(value_enum)]
        scenarios: Vec<Scenario>,

        /// Run every scenario
        #[arg(long, conflicts_with = "scenarios")]
        all: bool,

        /// One-way latency in ticks, overriding the config file
        #[arg(long)]
        latency: Option<u64>,

        /// Include every message sent in the report
        #[arg(long)]
        transcript: bool,
    },

    /// List available scenarios
    Scenarios,

    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the report.
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    if cli.json_logs {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    let mut config = SimConfig::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Some(Commands::Run {
            scenarios,
            all,
            latency,
            transcript,
        }) => {
            if let Some(latency) = latency {
                config.network.latency_ticks = latency;
            }
            config.record_transcript |= transcript;
            run(&config, &scenarios, all)
        }
        Some(Commands::Scenarios) => {
            for scenario in Scenario::ALL {
                println!("{:<22}{}", scenario.as_str(), scenario.description());
            }
            Ok(())
        }
        Some(Commands::Config) => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
        None => {
            println!("foresight-sim - client-side prediction loopback harness");
            println!();
            println!("Usage: foresight-sim <COMMAND>");
            println!();
            println!("Commands:");
            println!("  run        Run scenarios and print their report");
            println!("  scenarios  List available scenarios");
            println!("  config     Print the effective configuration");
            println!();
            println!("Run 'foresight-sim --help' for more information.");
            Ok(())
        }
    }
}

fn run(config: &SimConfig, scenarios: &[Scenario], all: bool) -> Result<()> {
    tracing::info!(
        latency_ticks = config.network.latency_ticks,
        tick_rate = config.tick_rate,
        "Running scenarios"
    );

    let reports: Vec<ScenarioReport> = if all || scenarios.is_empty() {
        run_all(config)?
    } else {
        scenarios
            .iter()
            .map(|scenario| scenario.run(config))
            .collect::<Result<_>>()?
    };

    println!("{}", serde_json::to_string_pretty(&reports)?);

    let failed: Vec<&str> = reports
        .iter()
        .filter(|r| !r.passed)
        .map(|r| r.scenario.as_str())
        .collect();
    if !failed.is_empty() {
        bail!("{} scenario(s) failed: {}", failed.len(), failed.join(", "));
    }
    Ok(())
}
