//! nanofab - run a print job on the laser nanofactory
//!
//! Loads a job file, plans it, and executes it against the configured
//! controller. Progress events go to stdout as JSON lines, logs to stderr.

use anyhow::{Context, Result};
use clap::Parser;
use nanofab::{Config, ConsoleObserver, ExecutionEngine, Job, JobRunner, Session, TransportKind};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nanofab")]
#[command(about = "Laser nanofactory job runner")]
#[command(version)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Run against the built-in simulated controller
    #[arg(long)]
    simulate: bool,

    /// Validate and plan the job without connecting
    #[arg(long)]
    dry_run: bool,

    /// Resume after this step (the last one that completed)
    #[arg(long, value_name = "STEP")]
    resume_after: Option<usize>,

    /// Pretty-print progress events
    #[arg(long)]
    pretty: bool,

    /// Job file (YAML, or JSON with a .json extension)
    job_file: String,
}

impl Args {
    fn get_config_path(&self) -> String {
        self.config
            .clone()
            .or_else(|| std::env::var("NANOFAB_CONFIG").ok())
            .unwrap_or_else(|| "config/default_config.yaml".to_string())
    }

    fn first_step(&self) -> usize {
        self.resume_after.map_or(0, |step| step + 1)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = args.get_config_path();

    let mut config = Config::load_from_path(&config_path)
        .with_context(|| format!("Failed to load config {}", config_path))?;
    if args.simulate {
        config.transport.kind = TransportKind::Simulated;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    info!("Laser Nanofactory job runner");
    info!("{}", "=".repeat(50));
    info!("Using config: {}", config_path);

    let job = Job::load_from_path(&args.job_file)
        .with_context(|| format!("Failed to load job {}", args.job_file))?;

    let observer = if args.pretty {
        ConsoleObserver::pretty()
    } else {
        ConsoleObserver::new()
    };
    let engine = ExecutionEngine::new(&config).with_observer(Arc::new(observer));

    let plan = engine.plan(&job, args.first_step()).context("Job validation failed")?;
    info!(
        "Job '{}': {} commands, path {:.1} µm, exposure {:?}, estimated {:?}",
        plan.job_name,
        plan.summary.command_count,
        plan.summary.path_length_microns,
        plan.summary.exposure_time,
        plan.summary.estimated_duration
    );

    if args.dry_run {
        for planned in &plan.commands {
            info!("step {:>4}: {:?}", planned.step, planned.command);
        }
        info!("Dry run complete, nothing sent");
        return Ok(());
    }

    let mut session = Session::from_config(&config).context("Failed to create session")?;
    if let Err(e) = session.connect().await {
        error!("Connection failed: {}", e);
        error!("Make sure:");
        error!("   - The controller is powered and reachable at {}", config.transport.describe());
        error!("   - Configuration files are correct");
        return Err(e.into());
    }

    match session.query_status().await {
        Ok(status) => info!(
            "Stage at {}, laser {}, interlock {}",
            status.position,
            status.power,
            if status.armed { "armed" } else { "disarmed" }
        ),
        Err(e) => warn!("Status query failed: {}", e),
    }

    let handle = JobRunner::spawn(engine, job, session, args.first_step());

    // Ctrl+C stops the job at the next command boundary
    let cancel = handle.cancel_token();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling job");
            cancel.cancel();
        }
    });

    let (mut session, result) = handle.join().await?;
    signal_task.abort();

    if let Err(e) = session.close().await {
        warn!("Failed to close session cleanly: {}", e);
    }

    match result {
        Ok(report) => {
            info!(
                "Job complete: {} steps, {} commands, {} retries in {:?}",
                report.steps_completed, report.commands_executed, report.retries, report.elapsed
            );
            Ok(())
        }
        Err(e) => {
            if let Some(step) = e.last_step() {
                error!("Resume with --resume-after {}", step);
            }
            Err(e.into())
        }
    }
}
