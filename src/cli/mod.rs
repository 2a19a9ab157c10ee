//! CLI command handling
//!
//! Opens the device lifecycle for a command and formats its result.

use std::path::PathBuf;

use serde::Serialize;

use crate::commands::Commands;
use crate::common::config::Config;
use crate::common::Result;
use crate::flash::{FlashOutcome, FlashReport, FlashRequest};
use crate::lifecycle::{DeviceLifecycle, DeviceState, Transition};
use crate::testbed;

/// Output options shared by every command
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub config: Option<PathBuf>,
    pub json: bool,
}

/// Final state of a device after a command
#[derive(Debug, Serialize)]
struct StateSummary<'a> {
    device: &'a str,
    state: DeviceState,
    history: &'a [Transition],
}

/// Dispatch a CLI command; returns whether it succeeded
pub async fn dispatch(command: Commands, options: &Options) -> Result<bool> {
    let config = Config::load(options.config.as_deref())?;

    match command {
        Commands::Flash {
            device,
            image,
            sha256,
            version,
            validate_only,
        } => {
            let mut dut = open(&config, &device).await?;
            let request = FlashRequest {
                image,
                expected_sha256: sha256,
                expected_version: version,
                validate_only,
            };
            let report = dut.flash(&request).await?;
            print_flash(&report, options)?;
            Ok(true)
        }

        Commands::Shell { device } => {
            let mut dut = open(&config, &device).await?;
            dut.transition(DeviceState::LinuxShell).await?;
            print_state(&dut, options)?;
            Ok(true)
        }

        Commands::Reach { device } => {
            let mut dut = open(&config, &device).await?;
            dut.transition(DeviceState::SshReachable).await?;
            print_state(&dut, options)?;
            Ok(true)
        }

        Commands::Recover { device, image } => {
            let mut dut = open(&config, &device).await?;
            let report = dut.recover(image).await?;
            print_flash(&report, options)?;
            Ok(true)
        }

        Commands::Off { device } => {
            let mut dut = open(&config, &device).await?;
            dut.ensure_off().await?;
            print_state(&dut, options)?;
            Ok(true)
        }

        Commands::Shutdown { device } => {
            let mut dut = open(&config, &device).await?;
            dut.cleanup_and_shutdown().await?;
            print_state(&dut, options)?;
            Ok(true)
        }

        Commands::Testbed { plan, verbose } => {
            let result = testbed::run_plan(&plan, &config, verbose).await?;
            if options.json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
            Ok(result.passed)
        }
    }
}

async fn open(config: &Config, device: &str) -> Result<DeviceLifecycle> {
    DeviceLifecycle::open(device, config.device(device)?).await
}

fn print_state(dut: &DeviceLifecycle, options: &Options) -> Result<()> {
    if options.json {
        let summary = StateSummary {
            device: dut.name(),
            state: dut.state(),
            history: dut.history(),
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}: {}", dut.name(), dut.state());
    }
    Ok(())
}

fn print_flash(report: &FlashReport, options: &Options) -> Result<()> {
    if options.json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("Image: {} ({} bytes)", report.image.path.display(), report.image.size);
    println!("SHA256: {}", report.image.sha256);
    println!("Guards:");
    for outcome in &report.guards.outcomes {
        println!("  {:<16} {:<8} {}", outcome.guard, outcome.status, outcome.reason);
    }
    match &report.outcome {
        FlashOutcome::Flashed { command } => println!("Flashed: {}", command),
        FlashOutcome::ValidatedOnly => println!("Validation passed, image not flashed"),
        FlashOutcome::AlreadyInstalled { version } => {
            println!("Version {} already installed, nothing to do", version)
        }
    }
    if let Some(release) = &report.installed {
        println!("Installed: {}", release);
    }
    Ok(())
}
