//! Guarded firmware flashing
//!
//! A flash attempt loads and hashes the image, evaluates the local guards
//! against the live device, then hands over to the sysupgrade executor which
//! uploads, re-verifies and applies it. Nothing destructive happens before
//! every local guard has passed.

pub mod guards;
pub mod image;
pub mod sysupgrade;

use std::path::PathBuf;

use serde::Serialize;

use crate::common::config::FlashSettings;
use crate::common::Result;
use crate::transport::SshSession;

pub use guards::{FlashGuardEngine, FlashGuardResult, Guard, GuardOutcome, GuardStatus, OsRelease};
pub use image::FirmwareImage;
pub use sysupgrade::SysupgradeExecutor;

/// What the caller wants flashed
#[derive(Debug, Clone, Default)]
pub struct FlashRequest {
    pub image: PathBuf,
    pub expected_sha256: Option<String>,
    /// Version the image installs, used for the downgrade guard, idempotence
    /// and post-flash verification
    pub expected_version: Option<String>,
    pub validate_only: bool,
}

impl FlashRequest {
    pub fn new(image: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            ..Self::default()
        }
    }
}

/// Flags that change how an image is applied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlashOptions {
    pub keep_config: bool,
    pub allow_downgrade: bool,
    pub validate_only: bool,
    pub skip_if_installed: bool,
}

impl FlashOptions {
    pub fn for_request(settings: &FlashSettings, request: &FlashRequest) -> Self {
        Self {
            keep_config: settings.keep_config,
            allow_downgrade: settings.allow_downgrade,
            validate_only: request.validate_only,
            skip_if_installed: settings.skip_if_installed,
        }
    }

    /// Options for re-flashing from a RAM-booted recovery image
    pub fn recovery() -> Self {
        Self {
            keep_config: false,
            allow_downgrade: true,
            validate_only: false,
            skip_if_installed: false,
        }
    }
}

/// What a flash attempt did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum FlashOutcome {
    Flashed { command: String },
    ValidatedOnly,
    AlreadyInstalled { version: String },
}

/// Structured diagnostics for one flash attempt
#[derive(Debug, Clone, Serialize)]
pub struct FlashReport {
    pub image: FirmwareImage,
    pub guards: FlashGuardResult,
    pub outcome: FlashOutcome,
    /// Release read back after the reboot
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installed: Option<OsRelease>,
}

/// Evaluate guards and apply the image over an established SSH session
pub async fn run_guarded(
    ssh: &mut dyn SshSession,
    settings: &FlashSettings,
    request: &FlashRequest,
    options: &FlashOptions,
) -> Result<FlashReport> {
    let image = FirmwareImage::load(&request.image, settings.expected_board.as_deref())?;
    let engine = FlashGuardEngine::new(settings);

    let mut guards = engine.evaluate(&image, request, options, ssh).await?;
    if let Some(version) = guards.already_installed.clone() {
        return Ok(FlashReport {
            image,
            guards,
            outcome: FlashOutcome::AlreadyInstalled { version },
            installed: None,
        });
    }
    guards.check()?;

    let outcome = SysupgradeExecutor::new(settings)
        .apply(&image, options, ssh, &mut guards)
        .await?;

    Ok(FlashReport {
        image,
        guards,
        outcome,
        installed: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::error::GuardFailureKind;
    use crate::common::Error;
    use crate::transport::mock::{DeviceSim, Event, MockDevice, LAN_ADDRESS};
    use crate::transport::Credentials;
    use std::io::Write;

    fn image_file(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&[0x5a; 4096])
            .unwrap();
        path
    }

    async fn connected(device: &MockDevice) -> crate::transport::mock::MockSsh {
        let mut ssh = device.ssh();
        ssh.connect(LAN_ADDRESS, &Credentials::default()).await.unwrap();
        ssh
    }

    fn settings() -> FlashSettings {
        FlashSettings {
            expected_board: Some("linksys,e8450-ubi".to_string()),
            ..FlashSettings::default()
        }
    }

    #[tokio::test]
    async fn test_guards_run_before_upload_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let device = MockDevice::new(DeviceSim::running());
        let mut ssh = connected(&device).await;
        let request = FlashRequest::new(image_file(&dir, "fw-squashfs-sysupgrade.itb"));
        let settings = settings();

        let report = run_guarded(&mut ssh, &settings, &request, &FlashOptions::for_request(&settings, &request))
            .await
            .unwrap();

        let order: Vec<Guard> = report.guards.outcomes.iter().map(|o| o.guard).collect();
        assert_eq!(
            order,
            vec![
                Guard::Board,
                Guard::Checksum,
                Guard::Space,
                Guard::VersionOrder,
                Guard::RemoteIntegrity,
                Guard::Functional,
                Guard::UbiAdvisory,
            ]
        );
        // UBI board, image without the marker
        assert_eq!(report.guards.status_of(Guard::UbiAdvisory), Some(GuardStatus::Advisory));
        assert!(matches!(report.outcome, FlashOutcome::Flashed { .. }));
    }

    #[tokio::test]
    async fn test_space_guard_blocks_upload() {
        let dir = tempfile::tempdir().unwrap();
        let device = MockDevice::new(DeviceSim {
            tmp_free_kb: 1024,
            ..DeviceSim::running()
        });
        let mut ssh = connected(&device).await;
        let request = FlashRequest::new(image_file(&dir, "fw.bin"));

        let err = run_guarded(&mut ssh, &settings(), &request, &FlashOptions::default())
            .await
            .unwrap_err();
        match err {
            Error::Guard(failure) => assert_eq!(failure.kind, GuardFailureKind::InsufficientSpace),
            other => panic!("Expected guard failure, got {other:?}"),
        }
        assert_eq!(device.uploads(), 0);
    }

    #[tokio::test]
    async fn test_functional_validation_failure_never_flashes() {
        let dir = tempfile::tempdir().unwrap();
        let device = MockDevice::new(DeviceSim {
            functional_ok: false,
            ..DeviceSim::running()
        });
        let mut ssh = connected(&device).await;
        let request = FlashRequest::new(image_file(&dir, "fw.bin"));

        let err = run_guarded(&mut ssh, &settings(), &request, &FlashOptions::default())
            .await
            .unwrap_err();
        match err {
            Error::Guard(failure) => {
                assert_eq!(failure.kind, GuardFailureKind::FunctionalValidationFailed);
                assert!(failure.reason.contains("platform_check_image"));
            }
            other => panic!("Expected guard failure, got {other:?}"),
        }
        assert!(device.flashes().is_empty());
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_reported_with_other_guards() {
        let dir = tempfile::tempdir().unwrap();
        let device = MockDevice::new(DeviceSim::running());
        let mut ssh = connected(&device).await;
        let mut request = FlashRequest::new(image_file(&dir, "fw.bin"));
        request.expected_sha256 = Some("00".repeat(32));

        let settings = settings();
        let image = FirmwareImage::load(&request.image, None).unwrap();
        let guards = FlashGuardEngine::new(&settings)
            .evaluate(&image, &request, &FlashOptions::default(), &mut ssh)
            .await
            .unwrap();

        assert_eq!(guards.status_of(Guard::Board), Some(GuardStatus::Passed));
        assert_eq!(guards.status_of(Guard::Checksum), Some(GuardStatus::Failed));
        assert_eq!(guards.status_of(Guard::Space), Some(GuardStatus::Passed));
        assert_eq!(
            guards.first_failure().map(|f| f.kind),
            Some(GuardFailureKind::ChecksumMismatch)
        );
        assert!(!device.events().iter().any(|e| matches!(e, Event::Upload { .. })));
    }
}
