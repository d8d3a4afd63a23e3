use anyhow::Result;
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use haier_lib::serial::list_ports;
use haier_rs::logging::setup_logging;
use tracing::info;

/// List the serial ports the washer and modem lines may be attached to.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Print the list as JSON instead of a table
    #[arg(long)]
    json: bool,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(None, &cli.verbose)?;

    let ports = list_ports()?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }

    if ports.is_empty() {
        info!("No serial ports found.");
        return Ok(());
    }
    for (i, port) in ports.iter().enumerate() {
        println!("#{:<2} {:<24} {}", i + 1, port.name, port.kind);
    }
    Ok(())
}
