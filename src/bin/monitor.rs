use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use haier_lib::correlator::MonitorSnapshot;
use haier_lib::{Direction, DualStreamMonitor, Frame, MonitorConfig, MonitorEvent, MonitorHandle};
use haier_rs::logging::setup_logging;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};

/// Watch the washer (machine) and modem serial lines at the same time and
/// follow their conversation.
///
/// Lines typed on stdin as `machine <hex>` or `modem <hex>` are written to
/// the port carrying that side's traffic.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Port carrying the washer's transmissions
    #[arg(long, required_unless_present = "config")]
    machine: Option<String>,
    /// Port carrying the modem's transmissions
    #[arg(long, required_unless_present = "config")]
    modem: Option<String>,
    /// JSON monitor configuration; --machine/--modem override its ports
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Baud rate for both ports
    #[arg(short, long)]
    baud: Option<u32>,
    /// Idle time in seconds after which a session start opens a new session
    #[arg(long)]
    session_timeout: Option<u64>,
    /// Print every frame, not only transitions and pairs
    #[arg(long)]
    frames: bool,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

fn build_config(cli: &Cli) -> Result<MonitorConfig> {
    let mut config = match &cli.config {
        Some(path) => MonitorConfig::from_json_file(path)
            .with_context(|| format!("Failed to load monitor configuration from {:?}", path))?,
        None => MonitorConfig::default(),
    };
    if let Some(port) = &cli.machine {
        config.outbound.port = port.clone();
    }
    if let Some(port) = &cli.modem {
        config.inbound.port = port.clone();
    }
    if let Some(baud) = cli.baud {
        config.outbound.baud_rate = baud;
        config.inbound.baud_rate = baud;
    }
    if let Some(secs) = cli.session_timeout {
        config.session.timeout = Duration::from_secs(secs);
    }
    Ok(config)
}

fn describe(event: &MonitorEvent, show_frames: bool) -> Option<String> {
    match event {
        MonitorEvent::Frame(frame) if show_frames || !frame.is_valid() => Some(format!(
            "[{}] #{} {} {} {}{}{} | {}",
            frame.session,
            frame.sequence,
            frame.timestamp,
            frame.direction,
            frame.kind,
            if frame.retry { " (retry)" } else { "" },
            if frame.is_valid() {
                String::new()
            } else {
                format!(" {:?}", frame.validation)
            },
            frame.frame.hex_string()
        )),
        MonitorEvent::Frame(_) => None,
        MonitorEvent::Transition { session, record } => Some(format!(
            "[{session}] {} -> {} on {} {}",
            record.from, record.to, record.direction, record.kind
        )),
        MonitorEvent::Paired { session, event } => Some(format!(
            "[{session}] {} answered by {} in {} ms",
            event.request_kind(),
            event.response_kind(),
            event.latency.as_millis()
        )),
        MonitorEvent::AuthResolved { session, latency } => {
            Some(format!("[{session}] authentication answered in {} ms", latency.as_millis()))
        }
        MonitorEvent::Resync {
            direction,
            discarded,
            reason,
        } => Some(format!("{direction}: resynchronised, dropped {discarded} byte(s) ({reason})")),
        MonitorEvent::PowerCycle { direction, timestamp } => {
            Some(format!("{direction}: power cycle at {timestamp}"))
        }
        MonitorEvent::SyncEstablished(report) => Some(format!(
            "clocks aligned: offset {} ms, quality {}",
            report.offset.unwrap_or_default(),
            report.quality.map(|q| q.to_string()).unwrap_or_else(|| "unknown".to_string())
        )),
        MonitorEvent::SessionStarted { session, timestamp } => {
            Some(format!("[{session}] session started at {timestamp}"))
        }
        MonitorEvent::SessionEnded(session) => {
            let summary = session.summary();
            Some(format!(
                "[{}] session ended in {} after {} frame(s), {} error(s), {} retr(y/ies)",
                summary.id, summary.state, summary.frames, summary.error_count, summary.retry_count
            ))
        }
        MonitorEvent::LinkDown { direction, error } => Some(format!("{direction}: link down ({error})")),
        MonitorEvent::LinkRestored { direction } => Some(format!("{direction}: link restored")),
        MonitorEvent::LinkFailed { direction, error } => Some(format!("{direction}: link lost ({error})")),
    }
}

fn parse_injection(line: &str) -> Result<(Direction, Frame)> {
    let (source, hex) = line
        .trim()
        .split_once(char::is_whitespace)
        .context("expected `machine <hex>` or `modem <hex>`")?;
    let Some(direction) = Direction::from_source_name(source) else {
        bail!("unknown side {source:?}, expected machine or modem");
    };
    let compact: String = hex.split_whitespace().collect();
    let bytes = hex::decode(compact).context("invalid hex")?;
    let frame = Frame::try_from(Bytes::from(bytes))?;
    Ok((direction, frame))
}

async fn inject(handle: &MonitorHandle, line: &str) {
    match parse_injection(line) {
        Ok((direction, frame)) => match handle.send(direction, frame).await {
            Ok(written) => info!("Wrote {} byte(s) to the {} port", written.len(), direction),
            Err(e) => error!("Write failed: {}", e),
        },
        Err(e) => warn!("Ignoring input: {:#}", e),
    }
}

fn print_summary(snapshot: &MonitorSnapshot) {
    let stats = &snapshot.stats;
    info!("--- Monitor summary ---");
    info!(
        "Frames: {} machine, {} modem, {} invalid",
        stats.outbound_frames, stats.inbound_frames, stats.invalid_frames
    );
    info!("Resyncs: {} ({} byte(s) dropped)", stats.resyncs, stats.bytes_discarded);
    info!(
        "Pairs: {} matched, {} unanswered, {} dropped",
        stats.paired, stats.unpaired, stats.dropped
    );
    info!("Sessions: {}, power cycles: {}", stats.sessions, stats.power_cycles);
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file.clone(), &cli.verbose)?;
    let config = build_config(&cli)?;

    let (handle, mut events) = DualStreamMonitor::start(config)
        .await
        .context("Failed to start the monitor")?;
    info!("Monitoring. Press Ctrl+C to stop.");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, stopping");
                break;
            }
            event = events.recv() => match event {
                Some(event) => {
                    if let Some(line) = describe(&event, cli.frames) {
                        println!("{line}");
                    }
                }
                None => {
                    warn!("Both links closed");
                    break;
                }
            },
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) if !line.trim().is_empty() => inject(&handle, &line).await,
                Ok(Some(_)) => {}
                Ok(None) => {
                    debug!("stdin closed");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!("stdin read failed: {}", e);
                    stdin_open = false;
                }
            },
        }
    }

    let snapshot = handle.stop().await?;
    while let Ok(event) = events.try_recv() {
        if let Some(line) = describe(&event, cli.frames) {
            println!("{line}");
        }
    }
    print_summary(&snapshot);
    Ok(())
}
