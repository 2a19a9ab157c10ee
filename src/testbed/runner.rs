//! Testbed runner implementation
//!
//! Flashes every device of a plan in turn through its own lifecycle and
//! collects a structured result per device. A failing device does not stop
//! the run. Progress goes to stderr so that stdout stays free for the JSON
//! result.

use std::io::Write;
use std::path::Path;

use async_trait::async_trait;
use colored::Colorize;
use serde::Serialize;

use crate::common::config::Config;
use crate::common::error::ErrorReport;
use crate::common::Result;
use crate::flash::{FlashOutcome, FlashReport, FlashRequest};
use crate::lifecycle::{DeviceLifecycle, Transition};

use super::config::{DeviceImage, TestbedPlan};

/// Source of device lifecycles for a run
#[async_trait]
pub trait DeviceProvider: Send {
    async fn open(&mut self, name: &str) -> Result<DeviceLifecycle>;
}

/// Devices taken from the configuration file
pub struct ConfiguredDevices<'a> {
    config: &'a Config,
}

impl<'a> ConfiguredDevices<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DeviceProvider for ConfiguredDevices<'_> {
    async fn open(&mut self, name: &str) -> Result<DeviceLifecycle> {
        DeviceLifecycle::open(name, self.config.device(name)?).await
    }
}

/// Result for one device of the plan
#[derive(Debug, Serialize)]
pub struct DeviceResult {
    pub device: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<FlashReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
    pub history: Vec<Transition>,
}

/// Result of a whole testbed run
#[derive(Debug, Serialize)]
pub struct TestbedResult {
    pub name: String,
    pub passed: bool,
    pub devices: Vec<DeviceResult>,
}

/// Run a testbed plan from a YAML file against configured devices
pub async fn run_plan(path: &Path, config: &Config, verbose: bool) -> Result<TestbedResult> {
    let plan = TestbedPlan::load(path)?;
    let mut progress = std::io::stderr();
    Ok(run_with(&plan, &mut ConfiguredDevices::new(config), &mut progress, verbose).await)
}

/// Run a parsed plan with lifecycles from `provider`, reporting progress to `out`
pub async fn run_with(
    plan: &TestbedPlan,
    provider: &mut dyn DeviceProvider,
    out: &mut (dyn Write + Send),
    verbose: bool,
) -> TestbedResult {
    let _ = writeln!(
        out,
        "\n{} {}",
        "Running Testbed:".blue().bold(),
        plan.name.white().bold()
    );
    if let Some(desc) = &plan.description {
        let _ = writeln!(out, "  {}", desc.dimmed());
    }

    let _ = writeln!(out, "\n{}", "Devices:".cyan());
    let mut devices = Vec::with_capacity(plan.devices.len());
    for entry in &plan.devices {
        let result = run_device(entry, provider, plan.shutdown_after, out, verbose).await;
        match (&result.report, &result.error) {
            (Some(report), _) => {
                let _ = writeln!(
                    out,
                    "  {} {}: {}",
                    "✓".green(),
                    entry.name,
                    describe(report).dimmed()
                );
            }
            (None, Some(error)) => {
                let _ = writeln!(out, "  {} {}: {}", "✗".red(), entry.name, error.message);
            }
            (None, None) => {}
        }
        devices.push(result);
    }

    let passed = devices.iter().all(|d| d.passed);
    let failed = devices.iter().filter(|d| !d.passed).count();
    if passed {
        let _ = writeln!(
            out,
            "\n{} {}\n",
            "✓".green().bold(),
            "Testbed Passed".green().bold()
        );
    } else {
        let _ = writeln!(
            out,
            "\n{} {}\n",
            "✗".red().bold(),
            format!("Testbed Failed ({} of {} devices)", failed, devices.len())
                .red()
                .bold()
        );
    }

    TestbedResult {
        name: plan.name.clone(),
        passed,
        devices,
    }
}

async fn run_device(
    entry: &DeviceImage,
    provider: &mut dyn DeviceProvider,
    shutdown_after: bool,
    out: &mut (dyn Write + Send),
    verbose: bool,
) -> DeviceResult {
    if verbose {
        let _ = writeln!(
            out,
            "  {} {} <- {}",
            "→".cyan(),
            entry.name,
            entry.image.display().to_string().dimmed()
        );
    }

    let mut dut = match provider.open(&entry.name).await {
        Ok(dut) => dut,
        Err(e) => {
            return DeviceResult {
                device: entry.name.clone(),
                passed: false,
                report: None,
                error: Some(ErrorReport::from(&e)),
                history: Vec::new(),
            }
        }
    };

    let request = FlashRequest {
        image: entry.image.clone(),
        expected_sha256: entry.sha256.clone(),
        expected_version: entry.version.clone(),
        validate_only: entry.validate_only,
    };
    let result = dut.flash(&request).await;
    if let Err(e) = &result {
        tracing::warn!(device = %entry.name, error = %e, "Testbed flash failed");
    }

    if shutdown_after {
        if let Err(e) = dut.cleanup_and_shutdown().await {
            tracing::warn!(device = %entry.name, error = %e, "Shutdown after flash failed");
        }
    }

    let history = dut.history().to_vec();
    match result {
        Ok(report) => DeviceResult {
            device: entry.name.clone(),
            passed: true,
            report: Some(report),
            error: None,
            history,
        },
        Err(e) => DeviceResult {
            device: entry.name.clone(),
            passed: false,
            report: None,
            error: Some(ErrorReport::from(&e)),
            history,
        },
    }
}

fn describe(report: &FlashReport) -> String {
    match &report.outcome {
        FlashOutcome::Flashed { .. } => match &report.installed {
            Some(release) => format!("flashed, running {}", release),
            None => "flashed".to_string(),
        },
        FlashOutcome::ValidatedOnly => "validated, not flashed".to_string(),
        FlashOutcome::AlreadyInstalled { version } => format!("{} already installed", version),
    }
}
