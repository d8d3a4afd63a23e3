use anyhow::{Context, Result, bail};
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use haier_lib::capture::Capture;
use haier_lib::config::{ReplayConfig, SerialConfig};
use haier_lib::replay::ResponseOutcome;
use haier_lib::serial::{FramedLink, SerialConnector, connect_with_retry};
use haier_lib::{Direction, FrameCodec, SequenceReplayer};
use haier_rs::logging::setup_logging;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Replay one side of a recorded conversation onto a serial port, with the
/// protocol's inter-frame timing.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Capture file to take the frames from
    capture: PathBuf,
    /// Serial port to write to
    #[arg(short, long, required_unless_present = "dry_run")]
    port: Option<String>,
    /// Which side of the capture to replay: machine or modem
    #[arg(short, long, default_value = "machine")]
    side: String,
    #[arg(short, long, default_value_t = 9600)]
    baud: u32,
    /// Multiplier for every inter-frame delay; 0 sends back to back
    #[arg(short = 'f', long, default_value_t = 1.0)]
    timing_factor: f64,
    /// How long to wait for an answer to each request, in milliseconds
    #[arg(long, default_value_t = 5000)]
    response_timeout: u64,
    /// Do not wait for answers
    #[arg(long)]
    no_wait: bool,
    /// Print the plan and exit without opening a port
    #[arg(long)]
    dry_run: bool,
    /// Print the full result as JSON
    #[arg(long)]
    json: bool,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file.clone(), &cli.verbose)?;

    let Some(direction) = Direction::from_source_name(&cli.side) else {
        bail!("unknown side {:?}, expected machine or modem", cli.side);
    };
    let capture = Capture::from_file(&cli.capture).with_context(|| format!("Failed to read {:?}", cli.capture))?;
    let frames = capture.frames_from(direction);
    if frames.is_empty() {
        bail!("{:?} holds no {} frames", cli.capture, direction);
    }

    let replayer = SequenceReplayer::new(ReplayConfig {
        timing_factor: cli.timing_factor,
        response_timeout: Duration::from_millis(cli.response_timeout),
        await_responses: !cli.no_wait,
    })?;
    let mut plan = replayer.load(frames);
    let total: Duration = plan.delays().iter().sum();
    info!(
        "Loaded {} {} frame(s), about {:.1} s of delays",
        plan.len(),
        direction,
        total.as_secs_f64()
    );

    if cli.dry_run {
        for (i, planned) in plan.frames().iter().enumerate() {
            println!(
                "{:>4} {:<18} {:<10} +{:>5} ms | {}",
                i,
                planned.kind.to_string(),
                planned.category.to_string(),
                planned.delay.as_millis(),
                planned.frame.hex_string()
            );
        }
        return Ok(());
    }

    let Some(port) = cli.port.clone() else {
        bail!("--port is required unless --dry-run is given");
    };
    let mut serial = SerialConfig::new(port);
    serial.baud_rate = cli.baud;
    let mut connector = SerialConnector::new(serial)?;
    let stream = connect_with_retry(&mut connector).await?;
    let mut link = FramedLink::new(stream, FrameCodec::default());

    let control = replayer.control();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, stopping after the current frame");
            control.stop();
        }
    });

    let result = replayer.run(&mut plan, &mut link).await;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        for record in &result.records {
            let response = match &record.response {
                ResponseOutcome::NotAwaited => String::new(),
                ResponseOutcome::Matched { kind, latency, skipped } => {
                    format!("-> {} in {} ms ({} skipped)", kind, latency.as_millis(), skipped)
                }
                ResponseOutcome::TimedOut { skipped } => format!("-> no answer ({} skipped)", skipped),
                ResponseOutcome::LinkError(e) => format!("-> link error: {e}"),
            };
            match &record.send_error {
                Some(e) => println!("{:>4} {:<18} send failed: {}", record.index, record.kind.to_string(), e),
                None => println!("{:>4} {:<18} {}", record.index, record.kind.to_string(), response),
            }
        }
    }

    let stats = result.stats;
    info!(
        "Sent {}, failed {}, answered {}, unanswered {} in {:.1} s",
        stats.sent,
        stats.send_failures,
        stats.matched,
        stats.unmatched,
        stats.elapsed.as_secs_f64()
    );
    if !result.is_success() {
        warn!("Replay did not complete cleanly");
    }
    result.into_result()?;
    Ok(())
}
