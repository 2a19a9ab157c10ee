//! Testbed plan configuration types
//!
//! Defines the data structures for deserializing YAML testbed plans.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::common::{Error, Result};

/// A complete testbed plan loaded from a YAML file
#[derive(Deserialize, Debug)]
pub struct TestbedPlan {
    /// Name of the plan
    pub name: String,
    /// Optional description of what the run verifies
    pub description: Option<String>,
    /// Devices to flash, in order
    pub devices: Vec<DeviceImage>,
    /// Power every device down after its flash
    #[serde(default)]
    pub shutdown_after: bool,
}

/// One device and the image it should end up running
#[derive(Deserialize, Debug, Clone)]
pub struct DeviceImage {
    /// Device name as defined in the configuration file
    pub name: String,
    /// Image path, relative to the plan file unless absolute
    pub image: PathBuf,
    pub sha256: Option<String>,
    /// Version the image is expected to install
    pub version: Option<String>,
    #[serde(default)]
    pub validate_only: bool,
}

impl TestbedPlan {
    /// Read and parse a plan, resolving image paths against its directory
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Failed to read testbed plan '{}': {}",
                path.display(),
                e
            ))
        })?;

        let mut plan = Self::parse(&content)?;
        if let Some(base) = path.parent() {
            plan.resolve_images(base);
        }
        Ok(plan)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let plan: TestbedPlan = serde_yaml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse testbed plan: {}", e)))?;
        if plan.devices.is_empty() {
            return Err(Error::Config(format!(
                "Testbed plan '{}' lists no devices",
                plan.name
            )));
        }
        Ok(plan)
    }

    fn resolve_images(&mut self, base: &Path) {
        for device in &mut self.devices {
            if device.image.is_relative() {
                device.image = base.join(&device.image);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"
name: nightly
description: LibreMesh candidate on both routers
devices:
  - name: belkin1
    image: images/lime-mt7622.itb
    version: "24.10.0"
  - name: belkin2
    image: /srv/images/lime-mt7622.itb
    sha256: 0f1e
    validate_only: true
"#;

    #[test]
    fn test_parse_plan() {
        let plan = TestbedPlan::parse(PLAN).unwrap();
        assert_eq!(plan.name, "nightly");
        assert_eq!(plan.devices.len(), 2);
        assert!(!plan.shutdown_after);
        assert_eq!(plan.devices[0].version.as_deref(), Some("24.10.0"));
        assert!(!plan.devices[0].validate_only);
        assert!(plan.devices[1].validate_only);
    }

    #[test]
    fn test_load_resolves_relative_images() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.yaml");
        std::fs::write(&path, PLAN).unwrap();

        let plan = TestbedPlan::load(&path).unwrap();
        assert_eq!(plan.devices[0].image, dir.path().join("images/lime-mt7622.itb"));
        assert_eq!(plan.devices[1].image, PathBuf::from("/srv/images/lime-mt7622.itb"));
    }

    #[test]
    fn test_empty_plan_rejected() {
        let err = TestbedPlan::parse("name: empty\ndevices: []\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
