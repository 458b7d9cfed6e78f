//! Pipeline Contract Harness - CLI Entry Point

use anyhow::Result;
use clap::Parser;
use pipeline_contract_harness::Scenario;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "pipeline-contract-harness",
    about = "Run mock-driven contract scenarios against HTTP-facing pipeline stages",
    version
)]
struct Args {
    /// Path to scenario file
    #[arg(short, long, default_value = "scenario.yaml")]
    scenario: PathBuf,

    /// Only run cases whose name contains this text
    #[arg(short, long)]
    case: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print an example scenario and exit
    #[arg(long)]
    print_config: bool,

    /// Validate the scenario and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.print_config {
        let example = include_str!("../scenarios/default-scenario.yaml");
        println!("{}", example);
        return Ok(());
    }

    if !args.scenario.exists() {
        anyhow::bail!("Scenario file not found: {:?}", args.scenario);
    }
    info!(path = ?args.scenario, "Loading scenario");
    let scenario = Scenario::from_file(&args.scenario)?;

    if args.validate {
        println!(
            "Scenario '{}' is valid ({} cases defined)",
            scenario.name,
            scenario.cases.len()
        );
        return Ok(());
    }

    let reports = scenario.run_all(args.case.as_deref()).await;
    if reports.is_empty() {
        anyhow::bail!("No cases matched {:?}", args.case);
    }

    let mut failed = 0;
    for report in &reports {
        if report.passed() {
            println!("PASS  {}", report.name);
        } else {
            failed += 1;
            println!("FAIL  {}", report.name);
            for mismatch in &report.mismatches {
                println!("      {}", mismatch);
            }
        }
    }
    println!(
        "\n{}: {} passed, {} failed",
        scenario.name,
        reports.len() - failed,
        failed
    );

    if failed > 0 {
        anyhow::bail!("{} of {} cases failed", failed, reports.len());
    }
    Ok(())
}
