//! dutctl - bring-up, guarded flashing and recovery of devices under test
//!
//! Drives OpenWrt/LibreMesh routers on a test bench through power control,
//! a serial console and SSH.

use std::path::PathBuf;

use clap::Parser;
use commands::Commands;
use dutctl::common::error::ErrorReport;
use dutctl::common::logging;
use dutctl::{cli, commands};

#[derive(Parser)]
#[command(name = "dutctl", about = "Flash, boot and recover devices under test")]
#[command(version, long_about = None)]
struct Cli {
    /// Configuration file (default: platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print results and errors as JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    /// Debug-level logging
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    /// Also write a detailed session log to the data directory
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.log_file {
        if let Some(path) = logging::init_with_file(cli.verbose) {
            tracing::info!(path = %path.display(), "Session log enabled");
        }
    } else {
        logging::init_cli(cli.verbose);
    }

    let options = cli::Options {
        config: cli.config,
        json: cli.json,
    };

    match cli::dispatch(cli.command, &options).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            if options.json {
                let report = ErrorReport::from(&e);
                match serde_json::to_string_pretty(&report) {
                    Ok(json) => println!("{json}"),
                    Err(_) => eprintln!("Error: {e}"),
                }
            } else {
                eprintln!("Error: {e}");
            }
            std::process::exit(1);
        }
    }
}
