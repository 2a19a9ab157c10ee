//! dutctl - bring-up, guarded flashing and recovery of devices under test
//!
//! This library drives OpenWrt/LibreMesh routers on a test bench: it boots
//! them to a known state, flashes firmware behind a set of guards and
//! escalates through serial and bootloader recovery when SSH is lost.

pub mod cli;
pub mod commands;
pub mod common;
pub mod flash;
pub mod lifecycle;
pub mod monitor;
pub mod network;
pub mod recovery;
pub mod testbed;
pub mod transport;

// Re-export commonly used types for tests
pub use common::{Error, Result};
pub use flash::{FlashOptions, FlashOutcome, FlashReport, FlashRequest};
pub use lifecycle::{DeviceLifecycle, DeviceState};
