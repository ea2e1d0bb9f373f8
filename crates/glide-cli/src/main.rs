//! glide - rental session demo driver
//!
//! Runs scripted rental sessions against the in-memory simulated gateway:
//! start a ride, send distance/approve/end signals at fixed offsets, and
//! print the final receipt.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use glide_core::config::GlideConfig;
use glide_core::gateway::SimulatedGateway;
use glide_core::session::journal::Replay;
use glide_core::session::{
    CompletionJournal, FileJournal, RentalRequest, SessionRuntime, Signal, StatusSnapshot,
};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// glide - rental session demo driver
#[derive(Parser, Debug)]
#[command(name = "glide")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to a TOML configuration file (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one scripted rental session to completion
    Ride(RideArgs),

    /// Print the effective configuration as TOML
    Config,

    /// Fold a journal file and print the state a resume would start from
    Inspect {
        /// Journal file written by a previous `ride --journal` run
        journal: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct RideArgs {
    /// Device identifier to unlock (digits only)
    #[arg(long, default_value = "1234")]
    device: String,

    /// Rider email, resolved to a billing customer
    #[arg(long, default_value = "rider@example.com")]
    email: String,

    /// Send a distance signal at this offset from start (repeatable)
    #[arg(long = "distance-at", value_parser = parse_duration)]
    distance_at: Vec<Duration>,

    /// Approve continued consumption at this offset
    #[arg(long = "approve-at", value_parser = parse_duration)]
    approve_at: Option<Duration>,

    /// Request the ride end at this offset
    #[arg(long = "end-at", value_parser = parse_duration)]
    end_at: Option<Duration>,

    /// Journal file for durable progress
    #[arg(long)]
    journal: Option<PathBuf>,

    /// Resume the session recorded in --journal instead of starting fresh
    #[arg(long, requires = "journal")]
    resume: bool,

    /// Fail the first N gateway charge calls to exercise retries
    #[arg(long, default_value_t = 0)]
    outage: u32,

    /// Output format for the final receipt
    #[arg(long, default_value = "text", value_parser = ["text", "json"])]
    format: String,
}

fn parse_duration(raw: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(raw)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Ride(args) => {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("failed to build tokio runtime")?;
            rt.block_on(run_ride(config, args))
        },
        Commands::Config => {
            println!(
                "{}",
                config.to_toml().context("failed to render configuration")?
            );
            Ok(())
        },
        Commands::Inspect { journal } => inspect_journal(&config, &journal),
    }
}

fn load_config(path: Option<&Path>) -> Result<GlideConfig> {
    match path {
        Some(path) => GlideConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display())),
        None => Ok(GlideConfig::default()),
    }
}

async fn run_ride(config: GlideConfig, args: RideArgs) -> Result<()> {
    let gateway = Arc::new(
        SimulatedGateway::new()
            .with_customer(&args.email, "cus_demo")
            .with_outage(args.outage),
    );
    let runtime = SessionRuntime::new(config, gateway);

    let journal: Option<Box<dyn CompletionJournal>> = match &args.journal {
        Some(path) => Some(Box::new(FileJournal::open(path).with_context(|| {
            format!("failed to open journal {}", path.display())
        })?)),
        None => None,
    };

    let request = RentalRequest {
        device_id: args.device.clone(),
        email: args.email.clone(),
        pricing: None,
    };
    let session_id = match (journal, args.resume) {
        (Some(journal), true) => runtime.resume_session(journal).await?,
        (Some(journal), false) => runtime.start_session_with_journal(request, journal).await?,
        (None, _) => runtime.start_session(request).await?,
    };
    info!(session = %session_id, "ride underway");

    let started = tokio::time::Instant::now();
    let mut script: Vec<(Duration, Signal)> = args
        .distance_at
        .iter()
        .map(|offset| (*offset, Signal::Distance))
        .collect();
    if let Some(offset) = args.approve_at {
        script.push((offset, Signal::Approve));
    }
    if let Some(offset) = args.end_at {
        script.push((offset, Signal::End));
    }
    script.sort_by_key(|(offset, _)| *offset);

    for (offset, signal) in script {
        tokio::time::sleep_until(started + offset).await;
        match signal {
            Signal::Distance => runtime.signal_distance(&session_id).await?,
            Signal::End => runtime.signal_end(&session_id).await?,
            Signal::Approve => runtime.signal_approve(&session_id).await?,
        }
        info!(session = %session_id, signal = %signal, "signal sent");
    }

    match runtime.await_completion(&session_id).await {
        Ok(receipt) => {
            print_receipt(&receipt, &args.format)?;
            Ok(())
        },
        Err(err) => {
            // The failed session still has a terminal snapshot worth showing.
            if let Ok(snapshot) = runtime.query_status(&session_id).await {
                print_receipt(&snapshot, &args.format)?;
            }
            Err(err.into())
        },
    }
}

fn print_receipt(snapshot: &StatusSnapshot, format: &str) -> Result<()> {
    if format == "json" {
        println!(
            "{}",
            serde_json::to_string_pretty(snapshot).context("failed to render receipt")?
        );
        return Ok(());
    }

    println!("session    {}", snapshot.session_id);
    println!("device     {}", snapshot.device_id);
    println!("phase      {}", snapshot.phase);
    println!(
        "tokens     {} (unlock {}, time {}, distance {})",
        snapshot.tokens.total, snapshot.tokens.unlock, snapshot.tokens.time, snapshot.tokens.distance
    );
    println!("distance   {} ft", snapshot.distance_ft);
    println!(
        "amount due {} {} (minor units)",
        snapshot.amount_due_minor, snapshot.pricing.currency
    );
    println!("started    {}", snapshot.started_at);
    if let Some(ended_at) = snapshot.ended_at {
        println!("ended      {ended_at}");
    }
    if let Some(err) = &snapshot.last_error {
        println!("last error {err}");
    }
    Ok(())
}

fn inspect_journal(config: &GlideConfig, path: &Path) -> Result<()> {
    let journal = FileJournal::open(path)
        .with_context(|| format!("failed to open journal {}", path.display()))?;
    let replay = Replay::from_journal(&journal, config.tariff.feet_per_increment);

    let Some(record) = &replay.started else {
        bail!(
            "journal {} has no session start record",
            journal.path().display()
        );
    };
    println!("journal    {}", journal.path().display());
    println!("session    {}", record.session_id);
    println!("device     {}", record.device_id);
    println!("steps      {}", journal.steps().len());
    println!(
        "tokens     {} (unlock {}, time {}, distance {})",
        replay.ledger.total, replay.ledger.unlock, replay.ledger.time, replay.ledger.distance
    );
    println!("distance   {} ft", replay.distance_ft);
    println!(
        "gate       {}",
        if replay.gate_satisfied {
            "approved"
        } else {
            "not approved"
        }
    );
    match replay.closed {
        Some((phase, ended_at)) => println!("closed     {phase} at {ended_at}"),
        None => println!("closed     no (resumable)"),
    }
    Ok(())
}
