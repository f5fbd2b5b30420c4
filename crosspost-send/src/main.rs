//! crosspost-send - posting daemon
//!
//! Picks up submissions from a spool directory, posts each one to every
//! destination it lists and streams progress as JSON lines on stdout.

mod spool;

use anyhow::{Context, Result};
use clap::Parser;
use libcrosspost::adapters::directory::DirectoryAdapter;
use libcrosspost::config::{resolve_data_path, DestinationConfig};
use libcrosspost::events::{Event, EventReceiver};
use libcrosspost::logging::{LogFormat, LoggingConfig};
use libcrosspost::{Config, CrosspostError, DestinationAdapter, Orchestrator, PostState};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::spool::Spool;

#[derive(Parser, Debug)]
#[command(name = "crosspost-send")]
#[command(version)]
#[command(about = "Post spooled submissions to every configured destination")]
#[command(long_about = "\
crosspost-send - posting daemon

DESCRIPTION:
    crosspost-send watches a spool directory for submission files
    (*.json, one serialized submission each), queues them and posts every
    submission to each destination it lists. Scheduling, retries, rate
    limits and prerequisites follow the configuration file.

    Each destination is delivered to a local directory:
    <context.base_dir>/<destination>/<submission>/

    Progress events are written to stdout, one JSON object per line.
    Picked-up files are renamed to *.json.queued (or *.json.rejected).

USAGE:
    # Run in foreground (logs to stderr)
    crosspost-send --spool ~/crosspost/spool

    # Post everything currently spooled, then exit
    crosspost-send --once

    # Poll faster
    crosspost-send --poll-interval 250ms

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes adapter calls in flight)

CONFIGURATION:
    Configuration file: ~/.config/crosspost/config.toml (or $CROSSPOST_CONFIG)
    Default spool:      ~/.local/share/crosspost/spool

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error, or a destination failed (with --once)
    2 - Configuration error
")]
struct Cli {
    /// Configuration file (overrides CROSSPOST_CONFIG)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory to pick up submission files from
    #[arg(long, value_name = "DIR")]
    spool: Option<PathBuf>,

    /// Scheduler and spool poll interval, e.g. "500ms" or "2s" (overrides config)
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    poll_interval: Option<Duration>,

    /// Post what is spooled now and exit
    #[arg(long)]
    once: bool,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Log format on stderr: text, json or pretty
    #[arg(long, value_name = "FORMAT", env = "CROSSPOST_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Minimum log level
    #[arg(long, value_name = "LEVEL", env = "CROSSPOST_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// What the event printer saw before the bus closed
#[derive(Debug, Default)]
struct Summary {
    completed: usize,
    cancelled: usize,
    failed_pairs: usize,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    LoggingConfig::new(cli.log_format, cli.log_level.clone(), cli.verbose).init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            let code = e
                .downcast_ref::<CrosspostError>()
                .map(CrosspostError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code as u8)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    if let Some(interval) = cli.poll_interval {
        config.scheduler.poll_interval_ms = (interval.as_millis() as u64).max(1);
    }

    let spool_dir = match cli.spool {
        Some(dir) => dir,
        None => resolve_data_path()?.join("spool"),
    };
    std::fs::create_dir_all(&spool_dir)
        .with_context(|| format!("Failed to create spool {}", spool_dir.display()))?;
    let spool = Spool::new(spool_dir);

    let orchestrator = Orchestrator::from_config(&config, directory_adapter);
    let printer = tokio::spawn(print_events(orchestrator.subscribe()));

    info!(
        destinations = config.destinations.len(),
        spool = %spool.dir().display(),
        "crosspost-send starting"
    );

    if cli.once {
        spool.collect(&orchestrator);
        orchestrator.drain().await;
    } else {
        let shutdown = CancellationToken::new();
        install_signal_handlers(shutdown.clone())?;
        let interval = config.scheduler_config().poll_interval;
        tokio::join!(
            orchestrator.run(shutdown.clone()),
            watch_spool(&spool, &orchestrator, interval, shutdown),
        );
    }

    orchestrator.shutdown().await;
    // Closing the bus lets the printer finish
    drop(orchestrator);
    let summary = printer.await.context("Event printer failed")?;

    info!(
        completed = summary.completed,
        cancelled = summary.cancelled,
        failed_pairs = summary.failed_pairs,
        "crosspost-send stopped"
    );

    if cli.once && summary.failed_pairs > 0 {
        return Ok(ExitCode::from(1));
    }
    Ok(ExitCode::SUCCESS)
}

fn directory_adapter(destination: &DestinationConfig) -> Arc<dyn DestinationAdapter> {
    // Lanes follow the destination's own rate_limit_free setting
    let mut adapter = DirectoryAdapter::new(destination.website()).serialized();
    if let Some(requirements) = &destination.requirements {
        adapter = adapter.with_requirements(requirements.clone());
    }
    Arc::new(adapter)
}

async fn watch_spool(
    spool: &Spool,
    orchestrator: &Orchestrator,
    interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        spool.collect(orchestrator);
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Write every event to stdout as one JSON line until the bus closes
async fn print_events(mut events: EventReceiver) -> Summary {
    let mut summary = Summary::default();
    let mut stdout = std::io::stdout();

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event output fell behind");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match &event {
            Event::SubmissionCompleted { results, .. } => {
                summary.completed += 1;
                summary.failed_pairs += results
                    .iter()
                    .filter(|r| r.status == PostState::Error)
                    .count();
            }
            Event::SubmissionCancelled { .. } => summary.cancelled += 1,
            _ => {}
        }

        match serde_json::to_string(&event) {
            Ok(line) => {
                if writeln!(stdout, "{}", line).and_then(|_| stdout.flush()).is_err() {
                    warn!("stdout closed, no longer printing events");
                }
            }
            Err(e) => warn!(error = %e, "Cannot serialize event"),
        }
    }

    summary
}

/// Set up signal handlers for graceful shutdown
#[cfg(unix)]
fn install_signal_handlers(shutdown: CancellationToken) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("Signal setup failed")?;

    std::thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            info!(signal, "Received shutdown signal, stopping gracefully...");
            shutdown.cancel();
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn install_signal_handlers(shutdown: CancellationToken) -> Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, stopping gracefully...");
            shutdown.cancel();
        }
    });
    Ok(())
}
