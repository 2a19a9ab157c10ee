//! Testbed runs
//!
//! Reads a YAML plan naming devices and images, flashes each device through
//! its lifecycle and reports a structured result per device.

mod config;
mod runner;

pub use config::{DeviceImage, TestbedPlan};
pub use runner::{run_plan, run_with, ConfiguredDevices, DeviceProvider, DeviceResult, TestbedResult};
