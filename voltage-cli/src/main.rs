//! Voltage CLI - download a torrent into a directory.

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use voltage_core::VoltageError;
use voltage_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "voltage")]
#[command(about = "A single-threaded BitTorrent downloader")]
struct Cli {
    /// Existing directory the torrent's files are written to
    dir: PathBuf,
    /// Path to the .torrent file
    torrent: PathBuf,
    /// Console log level; the full trace always goes to the log file
    #[arg(long, value_enum, default_value_t = CliLogLevel::Warn)]
    log_level: CliLogLevel,
    /// Directory for the run's trace file
    #[arg(long)]
    logs_dir: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref()) {
        eprintln!("WARNING: file logging unavailable: {e}");
    }

    match commands::run_download(&cli.dir, &cli.torrent) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Download failed: {e:#}");
            match e.downcast_ref::<VoltageError>() {
                Some(voltage_error) => eprintln!("ERROR: {}", voltage_error.user_message()),
                None => eprintln!("ERROR: {e:#}"),
            }
            ExitCode::FAILURE
        }
    }
}
