use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use drawdown::core::{Scenario, run_batch, run_single_simulation};

#[derive(Parser)]
#[command(name = "drawdown", about = "Retirement drawdown simulation engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the JSON API over HTTP.
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Run a scenario file and print the result as JSON.
    Run {
        scenario: PathBuf,
        /// Run the Monte Carlo batch instead of one deterministic projection.
        #[arg(long)]
        monte_carlo: bool,
    },
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { port } => {
            if let Err(e) = drawdown::api::run_http_server(port).await {
                eprintln!("Server error: {e}");
                std::process::exit(1);
            }
        }
        Command::Run {
            scenario,
            monte_carlo,
        } => {
            if let Err(e) = run_scenario_file(&scenario, monte_carlo) {
                eprintln!("{e}");
                std::process::exit(1);
            }
        }
    }
}

fn run_scenario_file(path: &Path, monte_carlo: bool) -> Result<(), String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    let scenario: Scenario =
        serde_json::from_str(&raw).map_err(|e| format!("cannot parse scenario: {e}"))?;

    let output = if monte_carlo {
        let result = run_batch(&scenario, |p| {
            log::info!("completed {}/{} runs", p.completed_runs, p.total_runs);
        })
        .map_err(|e| e.to_string())?;
        serde_json::to_string_pretty(&result)
    } else {
        let result = run_single_simulation(&scenario, None).map_err(|e| e.to_string())?;
        serde_json::to_string_pretty(&result)
    }
    .map_err(|e| e.to_string())?;

    println!("{output}");
    Ok(())
}
