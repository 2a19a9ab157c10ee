//! Pre-flash validation
//!
//! Guards run in a fixed order. The local ones (board, checksum, space,
//! version order) all run so the report is complete, and the first failure is
//! surfaced as the error. None of them modify the device. The remaining
//! guards run after the upload and are driven by the sysupgrade executor.

use std::cmp::Ordering;
use std::fmt;

use serde::Serialize;

use super::{FirmwareImage, FlashOptions, FlashRequest};
use crate::common::config::FlashSettings;
use crate::common::error::{GuardFailure, GuardFailureKind};
use crate::common::{Error, Result};
use crate::transport::SshSession;

/// Individual guard in evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Guard {
    Board,
    Checksum,
    Space,
    VersionOrder,
    RemoteIntegrity,
    Functional,
    UbiAdvisory,
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Board => "board",
            Self::Checksum => "checksum",
            Self::Space => "space",
            Self::VersionOrder => "version order",
            Self::RemoteIntegrity => "remote integrity",
            Self::Functional => "functional",
            Self::UbiAdvisory => "ubi advisory",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardStatus {
    Passed,
    Failed,
    Skipped,
    /// Non-fatal warning
    Advisory,
}

impl fmt::Display for GuardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Passed => "passed",
            Self::Failed => "FAILED",
            Self::Skipped => "skipped",
            Self::Advisory => "advisory",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuardOutcome {
    pub guard: Guard,
    pub status: GuardStatus,
    pub reason: String,
    /// Failure classification, set when `status` is `Failed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<GuardFailureKind>,
}

/// Ordered guard outcomes for one flash attempt
#[derive(Debug, Clone, Default, Serialize)]
pub struct FlashGuardResult {
    pub outcomes: Vec<GuardOutcome>,
    /// Set when the requested version is already installed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub already_installed: Option<String>,
}

impl FlashGuardResult {
    fn record(&mut self, guard: Guard, status: GuardStatus, reason: impl Into<String>) {
        let reason = reason.into();
        match status {
            GuardStatus::Passed | GuardStatus::Skipped => {
                tracing::debug!(%guard, ?status, %reason, "Flash guard")
            }
            GuardStatus::Advisory => tracing::warn!(%guard, %reason, "Flash guard advisory"),
            GuardStatus::Failed => tracing::warn!(%guard, %reason, "Flash guard failed"),
        }
        self.outcomes.push(GuardOutcome {
            guard,
            status,
            reason,
            failure: None,
        });
    }

    fn fail(&mut self, guard: Guard, kind: GuardFailureKind, reason: impl Into<String>) {
        self.record(guard, GuardStatus::Failed, reason);
        if let Some(last) = self.outcomes.last_mut() {
            last.failure = Some(kind);
        }
    }

    /// First failed guard, in evaluation order
    pub fn first_failure(&self) -> Option<GuardFailure> {
        self.outcomes.iter().find_map(|o| {
            o.failure.map(|kind| GuardFailure {
                kind,
                reason: o.reason.clone(),
            })
        })
    }

    /// Turn the first failure into an error
    pub fn check(&self) -> Result<()> {
        match self.first_failure() {
            Some(failure) => Err(Error::Guard(failure)),
            None => Ok(()),
        }
    }

    pub fn status_of(&self, guard: Guard) -> Option<GuardStatus> {
        self.outcomes.iter().find(|o| o.guard == guard).map(|o| o.status)
    }
}

/// Release information from `/etc/openwrt_release`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OsRelease {
    pub release: String,
    pub revision: String,
}

impl OsRelease {
    /// Parse the shell-style `KEY='value'` file
    pub fn parse(text: &str) -> Option<Self> {
        let mut release = None;
        let mut revision = None;
        for line in text.lines() {
            let Some((key, value)) = line.trim().split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches(|c| c == '\'' || c == '"').to_string();
            match key {
                "DISTRIB_RELEASE" => release = Some(value),
                "DISTRIB_REVISION" => revision = Some(value),
                _ => {}
            }
        }
        Some(Self {
            release: release?,
            revision: revision.unwrap_or_default(),
        })
    }

    /// Whether this release is exactly `version`
    pub fn is(&self, version: &str) -> bool {
        self.release == version || self.revision == version
    }

    /// Whether `expected` appears in the release or revision
    pub fn contains(&self, expected: &str) -> bool {
        self.release.contains(expected) || self.revision.contains(expected)
    }
}

impl fmt::Display for OsRelease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.revision.is_empty() {
            write!(f, "{}", self.release)
        } else {
            write!(f, "{} ({})", self.release, self.revision)
        }
    }
}

/// Board identifier reported by the running firmware
pub async fn read_board(ssh: &mut dyn SshSession) -> Result<Option<String>> {
    let output = ssh.exec("cat /tmp/sysinfo/board_name").await?;
    if output.success() {
        if let Some(board) = output.first_line() {
            return Ok(Some(board.to_string()));
        }
    }

    let output = ssh.exec("ubus call system board").await?;
    if !output.success() {
        return Ok(None);
    }
    let board = serde_json::from_str::<serde_json::Value>(&output.stdout)
        .ok()
        .and_then(|v| v.get("board_name").and_then(|b| b.as_str()).map(str::to_string));
    Ok(board)
}

/// Installed release, if the file is readable
pub async fn read_release(ssh: &mut dyn SshSession) -> Result<Option<OsRelease>> {
    let output = ssh.exec("cat /etc/openwrt_release").await?;
    if !output.success() {
        return Ok(None);
    }
    Ok(OsRelease::parse(&output.stdout))
}

/// Available space on `/tmp` in KiB
pub async fn read_tmp_free_kb(ssh: &mut dyn SshSession) -> Result<Option<u64>> {
    let output = ssh.exec("df -k /tmp").await?;
    if !output.success() {
        return Ok(None);
    }
    Ok(parse_df_available(&output.stdout))
}

fn parse_df_available(text: &str) -> Option<u64> {
    let line = text.lines().rev().find(|l| !l.trim().is_empty())?;
    line.split_whitespace().nth(3)?.parse().ok()
}

/// Parse an OpenWrt release number into a comparable version
///
/// `23.05.5` becomes `23.5.5`, missing components are zero and a suffix like
/// `-rc1` is kept as a pre-release. Snapshots have no order.
pub fn parse_release_version(text: &str) -> Option<semver::Version> {
    let text = text.trim().trim_start_matches(['v', 'V']);
    let (core, pre) = match text.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (text, None),
    };

    let mut parts = core
        .split('.')
        .map(|p| p.parse::<u64>().ok())
        .collect::<Option<Vec<_>>>()?;
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    parts.resize(3, 0);

    let mut version = semver::Version::new(parts[0], parts[1], parts[2]);
    if let Some(pre) = pre {
        version.pre = semver::Prerelease::new(pre).ok()?;
    }
    Some(version)
}

/// Order of `target` relative to `installed`, when both are comparable
pub fn compare_versions(installed: &str, target: &str) -> Option<Ordering> {
    Some(parse_release_version(target)?.cmp(&parse_release_version(installed)?))
}

/// Evaluates guards against a live device over SSH
pub struct FlashGuardEngine<'a> {
    settings: &'a FlashSettings,
}

impl<'a> FlashGuardEngine<'a> {
    pub fn new(settings: &'a FlashSettings) -> Self {
        Self { settings }
    }

    /// Run the local guards: board, checksum, space and version order
    ///
    /// Returns early, with no outcomes, when `skip_if_installed` applies.
    pub async fn evaluate(
        &self,
        image: &FirmwareImage,
        request: &FlashRequest,
        options: &FlashOptions,
        ssh: &mut dyn SshSession,
    ) -> Result<FlashGuardResult> {
        let mut result = FlashGuardResult::default();
        let installed = read_release(ssh).await?;

        if options.skip_if_installed {
            if let (Some(installed), Some(wanted)) = (&installed, &request.expected_version) {
                if installed.is(wanted) {
                    tracing::info!(version = %wanted, "Requested version already installed");
                    result.already_installed = Some(wanted.clone());
                    return Ok(result);
                }
            }
        }

        self.check_board(image, ssh, &mut result).await?;
        self.check_checksum(image, request, &mut result);
        self.check_space(image, ssh, &mut result).await?;
        self.check_version_order(installed.as_ref(), request, options, &mut result);

        Ok(result)
    }

    async fn check_board(
        &self,
        image: &FirmwareImage,
        ssh: &mut dyn SshSession,
        result: &mut FlashGuardResult,
    ) -> Result<()> {
        let Some(expected) = image.board.as_deref().or(self.settings.expected_board.as_deref()) else {
            result.record(Guard::Board, GuardStatus::Skipped, "no expected board configured");
            return Ok(());
        };

        match read_board(ssh).await? {
            Some(board) if board == expected => {
                result.record(Guard::Board, GuardStatus::Passed, format!("board {}", board));
            }
            Some(board) => result.fail(
                Guard::Board,
                GuardFailureKind::BoardMismatch,
                format!("image is for '{}', device reports '{}'", expected, board),
            ),
            None => result.fail(
                Guard::Board,
                GuardFailureKind::BoardMismatch,
                format!("image is for '{}', device board could not be read", expected),
            ),
        }
        Ok(())
    }

    fn check_checksum(&self, image: &FirmwareImage, request: &FlashRequest, result: &mut FlashGuardResult) {
        match &request.expected_sha256 {
            Some(expected) if image.digest_matches(expected) => {
                result.record(Guard::Checksum, GuardStatus::Passed, format!("sha256 {}", image.sha256));
            }
            Some(expected) => result.fail(
                Guard::Checksum,
                GuardFailureKind::ChecksumMismatch,
                format!("expected {}, image has {}", expected.to_lowercase(), image.sha256),
            ),
            None => result.record(
                Guard::Checksum,
                GuardStatus::Skipped,
                format!("no digest supplied, image has {}", image.sha256),
            ),
        }
    }

    async fn check_space(
        &self,
        image: &FirmwareImage,
        ssh: &mut dyn SshSession,
        result: &mut FlashGuardResult,
    ) -> Result<()> {
        let required = image.size + self.settings.tmp_space_margin_mb * 1024 * 1024;
        match read_tmp_free_kb(ssh).await? {
            Some(free_kb) if free_kb * 1024 >= required => result.record(
                Guard::Space,
                GuardStatus::Passed,
                format!("{} KiB free on /tmp", free_kb),
            ),
            Some(free_kb) => result.fail(
                Guard::Space,
                GuardFailureKind::InsufficientSpace,
                format!(
                    "Insufficient space on /tmp: {} KiB free, {} KiB required",
                    free_kb,
                    required.div_ceil(1024)
                ),
            ),
            None => result.fail(
                Guard::Space,
                GuardFailureKind::InsufficientSpace,
                "could not determine free space on /tmp",
            ),
        }
        Ok(())
    }

    fn check_version_order(
        &self,
        installed: Option<&OsRelease>,
        request: &FlashRequest,
        options: &FlashOptions,
        result: &mut FlashGuardResult,
    ) {
        let (Some(installed), Some(target)) = (installed, &request.expected_version) else {
            result.record(Guard::VersionOrder, GuardStatus::Skipped, "no target version to compare");
            return;
        };

        match compare_versions(&installed.release, target) {
            Some(Ordering::Less) if !options.allow_downgrade => result.fail(
                Guard::VersionOrder,
                GuardFailureKind::DowngradeRejected,
                format!("{} is older than installed {}", target, installed.release),
            ),
            Some(Ordering::Less) => result.record(
                Guard::VersionOrder,
                GuardStatus::Passed,
                format!("downgrade {} -> {} allowed", installed.release, target),
            ),
            Some(_) => result.record(
                Guard::VersionOrder,
                GuardStatus::Passed,
                format!("{} -> {}", installed.release, target),
            ),
            None => result.record(
                Guard::VersionOrder,
                GuardStatus::Skipped,
                format!("cannot order '{}' against '{}'", target, installed.release),
            ),
        }
    }

    /// Compare the uploaded file's size and digest with the local image
    pub async fn verify_remote(
        &self,
        image: &FirmwareImage,
        ssh: &mut dyn SshSession,
        result: &mut FlashGuardResult,
    ) -> Result<()> {
        let remote = &self.settings.remote_path;

        let output = ssh.exec(&format!("wc -c < {}", remote)).await?;
        let remote_size = output.first_line().and_then(|l| l.parse::<u64>().ok());
        if remote_size != Some(image.size) {
            let reason = format!(
                "size mismatch: local {} bytes, remote {}",
                image.size,
                remote_size.map_or_else(|| "unreadable".to_string(), |s| format!("{} bytes", s))
            );
            result.fail(Guard::RemoteIntegrity, GuardFailureKind::RemoteIntegrityMismatch, &reason);
            return Err(Error::Transfer(reason));
        }

        let output = ssh.exec(&format!("sha256sum {}", remote)).await?;
        let remote_digest = output
            .first_line()
            .and_then(|l| l.split_whitespace().next())
            .map(str::to_lowercase);
        if remote_digest.as_deref() != Some(image.sha256.as_str()) {
            let reason = format!(
                "SHA256 mismatch: local {}, remote {}",
                image.sha256,
                remote_digest.as_deref().unwrap_or("unreadable")
            );
            result.fail(Guard::RemoteIntegrity, GuardFailureKind::RemoteIntegrityMismatch, &reason);
            return Err(Error::Transfer(reason));
        }

        result.record(Guard::RemoteIntegrity, GuardStatus::Passed, "size and sha256 match");
        Ok(())
    }

    /// Let the device's own sysupgrade check the uploaded image
    pub async fn validate_functional(
        &self,
        ssh: &mut dyn SshSession,
        result: &mut FlashGuardResult,
    ) -> Result<()> {
        let output = ssh.exec(&format!("sysupgrade -T {}", self.settings.remote_path)).await?;
        if output.success() {
            result.record(Guard::Functional, GuardStatus::Passed, "sysupgrade -T accepted the image");
            return Ok(());
        }

        let diagnostics = format!("{}\n{}", output.stdout.trim(), output.stderr.trim())
            .trim()
            .to_string();
        let reason = format!("sysupgrade -T exited with {}: {}", output.exit_code, diagnostics);
        result.fail(Guard::Functional, GuardFailureKind::FunctionalValidationFailed, &reason);
        Err(Error::guard(GuardFailureKind::FunctionalValidationFailed, reason))
    }

    /// Warn when a UBI board is given a non-UBI image
    pub fn ubi_advisory(&self, image: &FirmwareImage, result: &mut FlashGuardResult) {
        let board = image.board.as_deref().or(self.settings.expected_board.as_deref());
        match board {
            Some(board) if board.contains("-ubi") && !image.is_ubi => result.record(
                Guard::UbiAdvisory,
                GuardStatus::Advisory,
                format!("board {} is UBI-based but {} lacks the UBI marker", board, image.file_name()),
            ),
            _ => result.record(Guard::UbiAdvisory, GuardStatus::Passed, "layout consistent"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_versions_normalize() {
        assert_eq!(parse_release_version("23.05.5"), Some(semver::Version::new(23, 5, 5)));
        assert_eq!(parse_release_version("24.10"), Some(semver::Version::new(24, 10, 0)));
        assert!(parse_release_version("SNAPSHOT").is_none());
        assert_eq!(compare_versions("23.05.5", "22.03.7"), Some(Ordering::Less));
        assert_eq!(compare_versions("24.10.0-rc1", "24.10.0"), Some(Ordering::Greater));
        assert_eq!(compare_versions("SNAPSHOT", "23.05.5"), None);
    }

    #[test]
    fn test_os_release_parse() {
        let text = "DISTRIB_ID='OpenWrt'\nDISTRIB_RELEASE='23.05.5'\nDISTRIB_REVISION='r24106-10cc5fcd00'\n";
        let release = OsRelease::parse(text).unwrap();
        assert_eq!(release.release, "23.05.5");
        assert!(release.is("r24106-10cc5fcd00"));
        assert!(release.contains("23.05"));
        assert!(OsRelease::parse("garbage").is_none());
    }

    #[test]
    fn test_df_available_column() {
        let text = "Filesystem 1K-blocks Used Available Use% Mounted on\ntmpfs 245000 1000 12345 1% /tmp\n";
        assert_eq!(parse_df_available(text), Some(12345));
    }

    #[test]
    fn test_first_failure_in_order() {
        let mut result = FlashGuardResult::default();
        result.record(Guard::Board, GuardStatus::Passed, "ok");
        result.fail(Guard::Checksum, GuardFailureKind::ChecksumMismatch, "bad digest");
        result.fail(Guard::Space, GuardFailureKind::InsufficientSpace, "full");

        let failure = result.first_failure().unwrap();
        assert_eq!(failure.kind, GuardFailureKind::ChecksumMismatch);
        assert!(matches!(result.check(), Err(Error::Guard(_))));
    }
}
