//! Command-line entry point: run or validate a reaction plan.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use rust_synth::config::Settings;
use rust_synth::controller::{AbortHandle, Controller, RunReport};
use rust_synth::flow::FlowEngine;
use rust_synth::hardware::mock::{MockChannelDriver, MockSpectrometer};
use rust_synth::hardware::ChannelTable;
use rust_synth::logging;
use rust_synth::plan::ReactionPlan;

#[derive(Parser)]
#[command(name = "rust_synth", version)]
#[command(about = "Closed-loop nanomaterial synthesis controller", long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/synth.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a reaction plan
    Run {
        /// Path to the plan TOML file
        plan: PathBuf,
        /// Use simulated channels and spectrometer
        #[arg(long)]
        simulate: bool,
        /// Center the simulated peak converges to, in nm
        #[arg(long, default_value_t = 650.0)]
        simulate_center_nm: f64,
    },
    /// Check a plan against the configured channels without touching hardware
    Validate {
        /// Path to the plan TOML file
        plan: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match execute(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn execute(cli: Cli) -> Result<u8> {
    let settings = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    }
    .context("Failed to load configuration")?;
    logging::init(&settings.application)?;

    match cli.command {
        Commands::Validate { plan } => cmd_validate(&settings, &plan),
        Commands::Run {
            plan,
            simulate,
            simulate_center_nm,
        } => cmd_run(settings, &plan, simulate, simulate_center_nm).await,
    }
}

fn cmd_validate(settings: &Settings, plan_path: &Path) -> Result<u8> {
    let plan = ReactionPlan::load(plan_path)
        .with_context(|| format!("Failed to load plan {}", plan_path.display()))?;
    let engine = FlowEngine::new(settings.flow.clone());
    let channels = ChannelTable::from_configs(&settings.channels);

    println!("Plan '{}' ({} steps)", plan.id, plan.steps.len());
    for (index, step) in plan.steps.iter().enumerate() {
        let commands = engine
            .commands_for(step, &channels)
            .with_context(|| format!("Step {index} is not executable"))?;
        println!(
            "  [{index}] {:<12} timeout {:?}, {} device commands",
            step.name(),
            step.timeout(),
            commands.len()
        );
    }
    println!("OK");
    Ok(0)
}

async fn cmd_run(
    settings: Settings,
    plan_path: &Path,
    simulate: bool,
    simulate_center_nm: f64,
) -> Result<u8> {
    let plan = ReactionPlan::load(plan_path)
        .with_context(|| format!("Failed to load plan {}", plan_path.display()))?;

    if !simulate {
        bail!("No vendor driver binding is compiled into this build; rerun with --simulate");
    }
    let controller = Controller::new(
        settings,
        Arc::new(MockChannelDriver::new()),
        Arc::new(MockSpectrometer::converging(simulate_center_nm).with_noise(0.5)),
    )?;

    let abort = AbortHandle::new();
    let signal = abort.signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, aborting run");
            abort.abort();
        }
    });

    let report = controller.run(Arc::new(plan), signal).await?;
    print_report(&report);
    info!(exit_code = report.exit_code(), "Exiting");
    Ok(report.exit_code() as u8)
}

fn print_report(report: &RunReport) {
    println!("Run {} of plan '{}'", report.run_uid, report.plan_id);
    for transition in &report.history {
        println!("  {} -> {}", transition.from, transition.to);
    }
    println!("Terminal state: {}", report.final_state);
    println!("Cause:          {}", report.cause);
    println!("Features:       {}", report.features_recorded);
    println!("Record:         {}", report.record_path.display());
    for error in &report.vent_errors {
        println!("Vent error:     {error}");
    }
}
