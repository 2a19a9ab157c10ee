//! End-to-end integration tests for dutctl
//!
//! These tests drive a full `DeviceLifecycle` against the simulated router in
//! `dutctl::transport::mock` and verify:
//! 1. Flash guards stop bad images before anything is uploaded or flashed
//! 2. Idempotent and validate-only runs leave the device untouched
//! 3. The recovery ladder escalates in order and stops at its bounds
//!
//! Tests that need a real bench are `#[ignore]`d.

use std::io::Write;
use std::path::{Path, PathBuf};

use dutctl::common::config::{Config, DeviceProfile};
use dutctl::common::error::{GuardFailureKind, Tier};
use dutctl::flash::{FlashOutcome, FlashRequest, Guard, GuardStatus};
use dutctl::lifecycle::{DeviceLifecycle, DeviceState};
use dutctl::transport::mock::{DeviceSim, Event, MockDevice, Stage, LAN_ADDRESS};
use dutctl::transport::{Credentials, SshTarget};
use dutctl::Error;
use tempfile::TempDir;
use tokio::time::Instant;

const BOARD: &str = "linksys,e8450-ubi";

/// Test context with a scratch directory and a simulated device
struct TestContext {
    dir: TempDir,
    device: MockDevice,
    profile: DeviceProfile,
}

impl TestContext {
    fn new(sim: DeviceSim) -> Self {
        let mut profile = DeviceProfile::default();
        profile.flash.expected_board = Some(BOARD.to_string());
        Self {
            dir: tempfile::tempdir().expect("Failed to create temp dir"),
            device: MockDevice::new(sim),
            profile,
        }
    }

    /// Write a firmware image of `len` bytes into the scratch directory
    fn image(&self, name: &str, len: usize) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::File::create(&path)
            .and_then(|mut f| f.write_all(&vec![0x42; len]))
            .expect("Failed to write image");
        path
    }

    fn lifecycle(&self) -> DeviceLifecycle {
        DeviceLifecycle::new(
            "belkin1",
            SshTarget::new(LAN_ADDRESS, Credentials::default()),
            self.profile.clone(),
            self.device.transports(),
        )
    }

    /// Enable bootloader recovery with a RAM image and a persistent image
    fn enable_bootloader_recovery(&mut self) {
        let tftp = self.dir.path().join("tftp");
        std::fs::create_dir_all(&tftp).expect("Failed to create tftp root");
        let ramdisk = self.image("openwrt-initramfs-kernel.bin", 2048);
        let firmware = self.image("openwrt-squashfs-sysupgrade-ubi-.itb", 4096);

        let recovery = &mut self.profile.recovery;
        recovery.enable_uboot_recovery = true;
        recovery.tftp_root = Some(tftp);
        recovery.recovery_image = Some(ramdisk);
        recovery.firmware_image = Some(firmware);

        let uboot = &mut self.profile.uboot;
        uboot.prompt = "MT7622>".to_string();
        uboot.init_commands = vec!["tftpboot 0x48000000 {image}".to_string()];
    }

    fn side_effects(&self) -> Vec<Event> {
        self.device
            .events()
            .into_iter()
            .filter(|e| {
                matches!(
                    e,
                    Event::PowerOn | Event::PowerOff | Event::Upload { .. } | Event::Flash(_)
                )
            })
            .collect()
    }
}

fn states(dut: &DeviceLifecycle) -> Vec<DeviceState> {
    dut.history().iter().map(|t| t.to).collect()
}

// ============== Flash guards ==============

#[tokio::test(start_paused = true)]
async fn test_flash_runs_guards_in_order_and_verifies_version() {
    let ctx = TestContext::new(DeviceSim {
        flashed_release: Some("24.10.0".to_string()),
        ..DeviceSim::running()
    });
    let mut request = FlashRequest::new(ctx.image("openwrt-24.10.0-squashfs-sysupgrade-ubi-.itb", 8192));
    request.expected_version = Some("24.10.0".to_string());
    let mut dut = ctx.lifecycle();

    let report = dut.flash(&request).await.unwrap();

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
    assert_eq!(report.guards.status_of(Guard::UbiAdvisory), Some(GuardStatus::Passed));
    assert!(matches!(report.outcome, FlashOutcome::Flashed { .. }));
    assert_eq!(report.installed.as_ref().map(|r| r.release.as_str()), Some("24.10.0"));

    let states = states(&dut);
    let flashing = states.iter().position(|s| *s == DeviceState::Flashing).unwrap();
    assert_eq!(
        &states[flashing..],
        &[DeviceState::Flashing, DeviceState::Rebooting, DeviceState::SshReachable]
    );

    // The functional test runs against the uploaded copy before sysupgrade
    let commands = ctx.device.ssh_commands();
    let test = commands.iter().position(|c| c.starts_with("sysupgrade -T")).unwrap();
    let apply = commands.iter().position(|c| c == "sysupgrade -n /tmp/sysupgrade.bin").unwrap();
    assert!(test < apply);
}

#[tokio::test(start_paused = true)]
async fn test_board_mismatch_rejected_before_upload() {
    let ctx = TestContext::new(DeviceSim {
        board: "glinet,gl-mt300n-v2".to_string(),
        ..DeviceSim::running()
    });
    let request = FlashRequest::new(ctx.image("openwrt-squashfs-sysupgrade-ubi-.itb", 4096));
    let mut dut = ctx.lifecycle();

    let err = dut.flash(&request).await.unwrap_err();

    match err {
        Error::Guard(failure) => {
            assert_eq!(failure.kind, GuardFailureKind::BoardMismatch);
            assert!(failure.reason.contains("linksys,e8450-ubi"));
            assert!(failure.reason.contains("glinet,gl-mt300n-v2"));
        }
        other => panic!("Expected board mismatch, got {other:?}"),
    }
    assert!(ctx.side_effects().is_empty());
    assert_eq!(dut.state(), DeviceState::SshReachable);
}

#[tokio::test(start_paused = true)]
async fn test_checksum_mismatch_rejected_before_upload() {
    let ctx = TestContext::new(DeviceSim::running());
    let mut request = FlashRequest::new(ctx.image("fw-ubi-.itb", 4096));
    request.expected_sha256 = Some("ff".repeat(32));
    let mut dut = ctx.lifecycle();

    let err = dut.flash(&request).await.unwrap_err();

    assert!(matches!(
        err,
        Error::Guard(ref f) if f.kind == GuardFailureKind::ChecksumMismatch
    ));
    assert_eq!(ctx.device.uploads(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_remote_digest_mismatch_is_transfer_error() {
    let ctx = TestContext::new(DeviceSim {
        corrupt_uploads: true,
        ..DeviceSim::running()
    });
    let request = FlashRequest::new(ctx.image("fw-ubi-.itb", 4096));
    let mut dut = ctx.lifecycle();

    let err = dut.flash(&request).await.unwrap_err();

    assert!(matches!(err, Error::Transfer(_)), "got {err:?}");
    assert_eq!(ctx.device.uploads(), 1);
    assert!(ctx.device.flashes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_downgrade_rejected_unless_allowed() {
    let ctx = TestContext::new(DeviceSim {
        flashed_release: Some("22.03.7".to_string()),
        ..DeviceSim::running()
    });
    let mut request = FlashRequest::new(ctx.image("openwrt-22.03.7-ubi-.itb", 4096));
    request.expected_version = Some("22.03.7".to_string());

    let mut dut = ctx.lifecycle();
    let err = dut.flash(&request).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Guard(ref f) if f.kind == GuardFailureKind::DowngradeRejected
    ));
    assert_eq!(ctx.device.uploads(), 0);

    let mut allowed = TestContext::new(DeviceSim {
        flashed_release: Some("22.03.7".to_string()),
        ..DeviceSim::running()
    });
    allowed.profile.flash.allow_downgrade = true;
    let mut request = FlashRequest::new(allowed.image("openwrt-22.03.7-ubi-.itb", 4096));
    request.expected_version = Some("22.03.7".to_string());

    let report = allowed.lifecycle().flash(&request).await.unwrap();
    assert!(matches!(report.outcome, FlashOutcome::Flashed { ref command } if command.contains(" -F ")));
    assert_eq!(allowed.device.flashes(), vec!["sysupgrade -n -F /tmp/sysupgrade.bin".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_installed_version_mismatch_after_flash() {
    let ctx = TestContext::new(DeviceSim::running());
    let mut request = FlashRequest::new(ctx.image("fw-ubi-.itb", 4096));
    request.expected_version = Some("24.10.0".to_string());
    let mut dut = ctx.lifecycle();

    let err = dut.flash(&request).await.unwrap_err();

    match err {
        Error::VersionMismatch { expected, found } => {
            assert_eq!(expected, "24.10.0");
            assert!(found.contains("23.05.5"));
        }
        other => panic!("Expected version mismatch, got {other:?}"),
    }
    assert_eq!(ctx.device.flashes().len(), 1);
}

// ============== Idempotence and validation ==============

#[tokio::test(start_paused = true)]
async fn test_skip_if_installed_has_no_side_effects() {
    let mut ctx = TestContext::new(DeviceSim::running());
    ctx.profile.flash.skip_if_installed = true;
    let mut request = FlashRequest::new(ctx.image("fw-ubi-.itb", 4096));
    request.expected_version = Some("23.05.5".to_string());
    let mut dut = ctx.lifecycle();

    let report = dut.flash(&request).await.unwrap();

    assert_eq!(
        report.outcome,
        FlashOutcome::AlreadyInstalled {
            version: "23.05.5".to_string()
        }
    );
    assert!(ctx.side_effects().is_empty());
    assert_eq!(dut.state(), DeviceState::SshReachable);
}

#[tokio::test(start_paused = true)]
async fn test_validate_only_never_flashes() {
    let ctx = TestContext::new(DeviceSim::running());
    let mut request = FlashRequest::new(ctx.image("fw-ubi-.itb", 4096));
    request.validate_only = true;
    let mut dut = ctx.lifecycle();

    let report = dut.flash(&request).await.unwrap();

    assert_eq!(report.outcome, FlashOutcome::ValidatedOnly);
    assert_eq!(report.guards.status_of(Guard::Functional), Some(GuardStatus::Passed));
    assert!(ctx.device.flashes().is_empty());
    assert!(ctx
        .device
        .ssh_commands()
        .iter()
        .any(|c| c == "rm -f /tmp/sysupgrade.bin"));
    assert_eq!(ctx.device.count(&Event::PowerOff), 0);
}

// ============== Recovery ladder ==============

#[tokio::test(start_paused = true)]
async fn test_vanilla_ssh_timeout_recovers_over_serial() {
    let ctx = TestContext::new(DeviceSim {
        ssh_after_boot: false,
        ..DeviceSim::default()
    });
    let mut dut = ctx.lifecycle();
    let started = Instant::now();

    dut.transition(DeviceState::SshReachable).await.unwrap();

    assert_eq!(dut.state(), DeviceState::SshReachable);
    // The full vanilla window was spent before escalating
    assert!(started.elapsed() >= std::time::Duration::from_secs(60));
    assert_eq!(dut.counters().serial.used(), 1);
    assert_eq!(dut.counters().bootloader.used(), 0);

    let events = ctx.device.events();
    assert!(events.contains(&Event::SerialCommand("/etc/init.d/dropbear restart".to_string())));
    assert!(!events.iter().any(|e| matches!(e, Event::BootloaderCommand(_))));
    assert!(states(&dut).contains(&DeviceState::Recovering));
}

#[tokio::test(start_paused = true)]
async fn test_bootloader_recovery_bounded_by_max_attempts() {
    let mut ctx = TestContext::new(DeviceSim {
        bootable: false,
        ramboot_ok: false,
        ..DeviceSim::default()
    });
    ctx.enable_bootloader_recovery();
    let max = ctx.profile.recovery.max_recovery_attempts;
    let mut dut = ctx.lifecycle();

    let err = dut.transition(DeviceState::SshReachable).await.unwrap_err();

    match err {
        Error::RecoveryExhausted { tier, attempts, .. } => {
            assert_eq!(tier, Tier::BootloaderRecovery);
            assert_eq!(attempts, max);
        }
        other => panic!("Expected recovery exhaustion, got {other:?}"),
    }
    assert_eq!(dut.state(), DeviceState::Failed);
    assert_eq!(
        ctx.device.count(&Event::BootloaderCommand("bootm".to_string())),
        max as usize
    );
    assert!(ctx.device.flashes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_bootloader_recovery_reflashes_bricked_device() {
    let mut ctx = TestContext::new(DeviceSim {
        bootable: false,
        ..DeviceSim::default()
    });
    ctx.enable_bootloader_recovery();
    let mut dut = ctx.lifecycle();

    dut.transition(DeviceState::SshReachable).await.unwrap();

    assert_eq!(dut.state(), DeviceState::SshReachable);
    assert_eq!(dut.counters().bootloader.used(), 1);
    assert_eq!(
        ctx.device.flashes(),
        vec!["sysupgrade -n -F /tmp/sysupgrade.bin".to_string()]
    );
    let states = states(&dut);
    assert!(states.contains(&DeviceState::BootloaderPrompt));
    assert!(states.contains(&DeviceState::Flashing));
    assert!(ctx.dir.path().join("tftp/openwrt-initramfs-kernel.bin").exists());
}

#[tokio::test(start_paused = true)]
async fn test_no_bootloader_tier_when_disabled() {
    let ctx = TestContext::new(DeviceSim {
        ssh_after_boot: false,
        ssh_repairable: false,
        ..DeviceSim::default()
    });
    let mut dut = ctx.lifecycle();

    let err = dut.transition(DeviceState::SshReachable).await.unwrap_err();

    assert!(matches!(
        err,
        Error::RecoveryExhausted {
            tier: Tier::SerialRecovery,
            attempts: 1,
            ..
        }
    ));
    assert!(ctx.device.with(|sim| sim.stage == Stage::Linux));
}

// ============== Configuration ==============

#[test]
fn test_config_file_round_trip_through_lifecycle_settings() {
    let config = Config::parse(
        r#"
[devices.belkin1]
host = "192.168.20.182"

[devices.belkin1.power]
on_command = "relay on 1"
off_command = "relay off 1"

[devices.belkin1.serial]
tcp = "127.0.0.1:3001"

[devices.belkin1.profile.flash]
expected_board = "linksys,e8450-ubi"
skip_if_installed = true

[devices.belkin1.profile.recovery]
enable_uboot_recovery = true
max_recovery_attempts = 2
"#,
    )
    .unwrap();

    let device = config.device("belkin1").unwrap();
    assert_eq!(device.profile.recovery.max_recovery_attempts, 2);
    assert!(device.profile.flash.skip_if_installed);
    assert!(matches!(config.device("belkin2"), Err(Error::UnknownDevice(_))));
}

// ============== Hardware ==============

/// Needs `DUTCTL_CONFIG` pointing at a bench configuration with a device
/// named by `DUTCTL_DEVICE`
#[tokio::test]
#[ignore = "requires a physical device"]
async fn test_hardware_reach_and_power_off() {
    let config_path = std::env::var("DUTCTL_CONFIG").expect("DUTCTL_CONFIG not set");
    let name = std::env::var("DUTCTL_DEVICE").unwrap_or_else(|_| "belkin1".to_string());
    let config = Config::load(Some(Path::new(&config_path))).unwrap();

    let mut dut = DeviceLifecycle::open(&name, config.device(&name).unwrap())
        .await
        .unwrap();
    dut.transition(DeviceState::SshReachable).await.unwrap();
    assert_eq!(dut.state(), DeviceState::SshReachable);

    dut.cleanup_and_shutdown().await.unwrap();
    assert_eq!(dut.state(), DeviceState::PoweredOff);
}
