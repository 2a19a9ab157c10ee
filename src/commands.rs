//! CLI command definitions
//!
//! Defines the clap commands for the dutctl CLI.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Flash a firmware image behind the pre-flash guards
    Flash {
        /// Device name from the configuration file
        device: String,

        /// Path to the sysupgrade image
        image: PathBuf,

        /// Expected SHA256 of the image
        #[arg(long)]
        sha256: Option<String>,

        /// Version the image installs (downgrade guard and post-flash check)
        #[arg(long)]
        version: Option<String>,

        /// Run every guard including the on-device image test, but do not flash
        #[arg(long)]
        validate_only: bool,
    },

    /// Bring the device to a Linux shell on the serial console
    Shell {
        device: String,
    },

    /// Bring the device to SSH reachability, recovering if needed
    Reach {
        device: String,
    },

    /// Recover through the bootloader and re-flash
    Recover {
        device: String,

        /// Firmware to flash from the recovery environment
        /// (default: recovery.firmware_image from the profile)
        #[arg(long)]
        image: Option<PathBuf>,
    },

    /// Cut power to the device
    Off {
        device: String,
    },

    /// Shut the device down gracefully, then cut power
    Shutdown {
        device: String,
    },

    /// Flash every device listed in a YAML testbed plan
    Testbed {
        /// Path to the plan file
        plan: PathBuf,

        /// Show image paths and more detail
        #[arg(long, short)]
        verbose: bool,
    },
}
