use anyhow::{Context, Result};
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use haier_lib::{Capture, MonitorConfig, analyze_capture};
use haier_rs::logging::setup_logging;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Run a capture file through the correlator and report sessions,
/// transitions, response pairs and authentication timing.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Capture file to analyse
    capture: PathBuf,
    /// JSON monitor configuration for the correlation settings
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Idle time in seconds after which a session start opens a new session
    #[arg(long)]
    session_timeout: Option<u64>,
    /// Fail on the first unrecognised line instead of skipping it
    #[arg(long)]
    strict: bool,
    /// Print the report as JSON
    #[arg(long)]
    json: bool,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file.clone(), &cli.verbose)?;

    let mut config = match &cli.config {
        Some(path) => MonitorConfig::from_json_file(path)
            .with_context(|| format!("Failed to load monitor configuration from {:?}", path))?,
        None => MonitorConfig::default(),
    };
    if let Some(secs) = cli.session_timeout {
        config.session.timeout = Duration::from_secs(secs);
    }

    let text = std::fs::read_to_string(&cli.capture).with_context(|| format!("Failed to read {:?}", cli.capture))?;
    let capture = if cli.strict {
        Capture::parse_strict(&text)?
    } else {
        Capture::parse(&text)
    };
    for skipped in capture.skipped() {
        warn!("Line {} skipped: {}", skipped.line, skipped.reason);
    }

    let analysis = analyze_capture(&capture, &config);
    let report = analysis.report();

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for session in &analysis.sessions {
        let summary = session.summary();
        println!(
            "Session {} ({} frames, {} ms, ended {}, {} errors, {} retries)",
            summary.id,
            summary.frames,
            session.duration().as_millis(),
            summary.state,
            summary.error_count,
            summary.retry_count
        );
        for record in &session.transitions {
            println!(
                "  {:>14} #{:<4} {} -> {} on {} {}",
                record.timestamp, record.sequence, record.from, record.to, record.direction, record.kind
            );
        }
    }

    for latency in analysis.auth_latencies() {
        println!(
            "Auth in session {} at {}: answered in {} ms",
            latency.session,
            latency.challenged_at,
            latency.latency.as_millis()
        );
    }
    for duplicate in &report.duplicate_challenges {
        println!(
            "Challenge {} sent {} times (sessions {:?})",
            duplicate.challenge, duplicate.count, duplicate.sessions
        );
    }

    let stats = report.snapshot.stats;
    info!(
        "{} frame(s), {} invalid, {} resync(s), {} paired, {} unanswered, {} power cycle(s)",
        stats.frames(),
        stats.invalid_frames,
        stats.resyncs,
        stats.paired,
        stats.unpaired,
        stats.power_cycles
    );
    Ok(())
}
