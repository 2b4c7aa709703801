use anyhow::Result;
use clap::Parser;
use colored::*;
use std::time::Duration;

use testing_tools::output::print_test_summary;
use testing_tools::scenarios;

#[derive(Parser)]
#[command(name = "stream-probe")]
#[command(about = "Vehicle stream integration testing tool")]
struct Cli {
    /// Base URL of the relay (e.g., http://localhost:8080)
    #[arg(long)]
    base_url: String,

    /// Test scenario to run
    #[arg(long, value_enum)]
    scenario: ScenarioChoice,

    /// Number of concurrent clients for the fan-out scenario
    #[arg(long, default_value_t = 3)]
    clients: usize,

    /// Seconds to wait for an event on each connection
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Enable verbose output
    #[arg(long, short)]
    verbose: bool,
}

#[derive(clap::ValueEnum, Clone)]
enum ScenarioChoice {
    /// Test a single client connection receiving an event
    ConnectionTest,
    /// Test that several clients all receive events
    FanOut,
    /// Test the stream status endpoint while a client is connected
    Status,
    /// Run all tests
    All,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    }

    let client = reqwest::Client::new();
    let base_url = cli.base_url.trim_end_matches('/');
    let timeout = Duration::from_secs(cli.timeout_secs);

    println!("{}", "=== RUNNING TESTS ===".bright_white().bold());

    let mut results = Vec::new();
    match cli.scenario {
        ScenarioChoice::ConnectionTest => {
            results.push(scenarios::test_connection(&client, base_url, timeout).await?);
        }
        ScenarioChoice::FanOut => {
            results.push(scenarios::test_fan_out(&client, base_url, cli.clients, timeout).await?);
        }
        ScenarioChoice::Status => {
            results.push(scenarios::test_status(&client, base_url, timeout).await?);
        }
        ScenarioChoice::All => {
            results.push(scenarios::test_connection(&client, base_url, timeout).await?);
            results.push(scenarios::test_fan_out(&client, base_url, cli.clients, timeout).await?);
            results.push(scenarios::test_status(&client, base_url, timeout).await?);
        }
    }

    print_test_summary(&results);

    if results.iter().any(|r| !r.passed) {
        std::process::exit(1);
    }

    Ok(())
}
