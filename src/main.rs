use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use approval_harness::{
    init_telemetry, lint_paths, load_assets, HarnessConfig, Orchestrator, ProviderClients,
    ScenarioSettings, SimulatedCloud,
};

#[derive(Parser)]
#[command(name = "approval-harness")]
#[command(about = "Integration harness for approval-gated automation workflows")]
#[command(long_about = "Provisions an ephemeral stack, registers the approval automation document, \
                       runs it through its approval gate and verifies the stack was deleted. \
                       Every resource the run creates is torn down, whatever the outcome.")]
struct Cli {
    /// Configuration file (defaults to approval-harness.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the approval workflow scenario once
    Run {
        /// Use the in-memory simulated cloud instead of AWS
        #[arg(long)]
        simulate: bool,
    },
    /// Check that automation documents are well-formed JSON
    Lint {
        /// Files or directories to check (defaults to paths.lint_roots)
        paths: Vec<PathBuf>,
    },
    /// Print the effective configuration as TOML
    ShowConfig,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = HarnessConfig::load(cli.config.as_deref()).context("loading configuration")?;

    let passed = match cli.command {
        Commands::Run { simulate } => tokio::runtime::Runtime::new()?
            .block_on(async { run_command(&config, simulate).await })?,
        Commands::Lint { paths } => lint_command(&config, paths),
        Commands::ShowConfig => {
            print!("{}", config.to_toml()?);
            true
        }
    };

    Ok(if passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn run_command(config: &HarnessConfig, simulate: bool) -> Result<bool> {
    init_telemetry(&config.general.log_level);

    let (template, document) = load_assets(config)?;
    let (clients, backend) = build_clients(config, simulate).await?;
    let settings = ScenarioSettings::from_config(config);

    let report = Orchestrator::new(clients, settings, template, document)
        .run(backend)
        .await;
    println!("{report}");
    Ok(report.passed())
}

#[cfg(feature = "aws")]
async fn build_clients(config: &HarnessConfig, simulate: bool) -> Result<(ProviderClients, &'static str)> {
    if simulate {
        return Ok((simulated_clients(config), "simulated"));
    }
    let cloud = approval_harness::providers::AwsCloud::load(&config.general.region).await;
    Ok((ProviderClients::aws(Arc::new(cloud)), "aws"))
}

#[cfg(not(feature = "aws"))]
async fn build_clients(config: &HarnessConfig, simulate: bool) -> Result<(ProviderClients, &'static str)> {
    if !simulate {
        anyhow::bail!("this build has no AWS backend; rebuild with --features aws or pass --simulate");
    }
    Ok((simulated_clients(config), "simulated"))
}

fn simulated_clients(config: &HarnessConfig) -> ProviderClients {
    ProviderClients::simulated(Arc::new(SimulatedCloud::new(config.simulation_profile())))
}

fn lint_command(config: &HarnessConfig, paths: Vec<PathBuf>) -> bool {
    let roots = if paths.is_empty() {
        config.paths.lint_roots.clone()
    } else {
        paths
    };

    let report = lint_paths(&roots);
    for finding in &report.findings {
        println!("{finding}");
    }
    if report.is_clean() {
        println!("{} document(s) well formed", report.checked.len());
    } else {
        println!(
            "{} of {} document(s) malformed",
            report.findings.len(),
            report.checked.len()
        );
    }
    report.is_clean()
}
