//! Error types for dutctl
//!
//! Terminal failures carry the tier at which they happened and the last
//! transport-level symptom, so "never reached the bootloader" can be told
//! apart from "rebooted but SSH never came back".

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Stage of the lifecycle at which a failure was observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Power-on and console bring-up
    Boot,
    /// Waiting for SSH after network configuration
    AvailabilityWait,
    /// Serial console repair
    SerialRecovery,
    /// Bootloader / TFTP re-flash
    BootloaderRecovery,
    /// Sysupgrade and the reboot that follows it
    Flash,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boot => write!(f, "boot"),
            Self::AvailabilityWait => write!(f, "ssh availability wait"),
            Self::SerialRecovery => write!(f, "serial recovery"),
            Self::BootloaderRecovery => write!(f, "bootloader recovery"),
            Self::Flash => write!(f, "flash"),
        }
    }
}

/// Which flash guard rejected the image
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardFailureKind {
    BoardMismatch,
    ChecksumMismatch,
    InsufficientSpace,
    DowngradeRejected,
    RemoteIntegrityMismatch,
    FunctionalValidationFailed,
}

impl fmt::Display for GuardFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BoardMismatch => write!(f, "board mismatch"),
            Self::ChecksumMismatch => write!(f, "checksum mismatch"),
            Self::InsufficientSpace => write!(f, "insufficient space"),
            Self::DowngradeRejected => write!(f, "downgrade rejected"),
            Self::RemoteIntegrityMismatch => write!(f, "remote integrity mismatch"),
            Self::FunctionalValidationFailed => write!(f, "functional validation failed"),
        }
    }
}

/// A guard that stopped a flash attempt
#[derive(Error, Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[error("{kind}: {reason}")]
pub struct GuardFailure {
    pub kind: GuardFailureKind,
    pub reason: String,
}

/// Main error type for dutctl
#[derive(Error, Debug)]
pub enum Error {
    // === Flash Errors ===
    #[error("Flash guard failed ({0}). The device was not modified")]
    Guard(GuardFailure),

    #[error("Image transfer failed: {0}")]
    Transfer(String),

    #[error("Installed firmware '{found}' does not contain expected version '{expected}'")]
    VersionMismatch { expected: String, found: String },

    // === Reachability Errors ===
    #[error("Device did not come back within {timeout_secs}s during {tier}: {symptom}")]
    BootTimeout {
        tier: Tier,
        timeout_secs: u64,
        symptom: String,
    },

    #[error("SSH unavailable: {0}")]
    SshUnavailable(String),

    #[error("Serial recovery failed: {0}")]
    SerialRecoveryFailed(String),

    #[error("Bootloader prompt never reached: {0}")]
    BootloaderInterrupt(String),

    #[error("Recovery exhausted at {tier} after {attempts} attempt(s). Last symptom: {symptom}")]
    RecoveryExhausted {
        tier: Tier,
        attempts: u32,
        symptom: String,
    },

    // === Transport Errors ===
    #[error("Power control failed: {0}")]
    Power(String),

    #[error("Serial console error: {0}")]
    Serial(String),

    #[error("SSH connection to {host} failed: {reason}")]
    SshConnect { host: String, reason: String },

    #[error("Remote command '{command}' failed with exit code {code}: {stderr}")]
    SshCommand {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("Operation timed out after {}ms", .0.as_millis())]
    Timeout(std::time::Duration),

    // === State Errors ===
    #[error("Cannot transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    #[error("Device '{0}' is not defined in the configuration")]
    UnknownDevice(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a guard failure error
    pub fn guard(kind: GuardFailureKind, reason: impl Into<String>) -> Self {
        Self::Guard(GuardFailure {
            kind,
            reason: reason.into(),
        })
    }

    /// Create a boot timeout error
    pub fn boot_timeout(tier: Tier, timeout: std::time::Duration, symptom: impl Into<String>) -> Self {
        Self::BootTimeout {
            tier,
            timeout_secs: timeout.as_secs(),
            symptom: symptom.into(),
        }
    }

    /// Create an SSH connection error
    pub fn ssh_connect(host: &str, reason: impl Into<String>) -> Self {
        Self::SshConnect {
            host: host.to_string(),
            reason: reason.into(),
        }
    }

    /// Create an invalid transition error
    pub fn invalid_transition(from: impl fmt::Display, to: impl fmt::Display) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Stable code for structured diagnostics
    pub fn code(&self) -> &'static str {
        match self {
            Error::Guard(_) => "GUARD_FAILURE",
            Error::Transfer(_) => "TRANSFER_ERROR",
            Error::VersionMismatch { .. } => "VERSION_MISMATCH",
            Error::BootTimeout { .. } => "BOOT_TIMEOUT",
            Error::SshUnavailable(_) | Error::SshConnect { .. } => "SSH_UNAVAILABLE",
            Error::SerialRecoveryFailed(_) => "SERIAL_RECOVERY_FAILED",
            Error::BootloaderInterrupt(_) => "BOOTLOADER_INTERRUPT",
            Error::RecoveryExhausted { .. } => "RECOVERY_EXHAUSTED",
            Error::Timeout(_) => "TIMEOUT",
            Error::Config(_) | Error::ConfigParse(_) | Error::UnknownDevice(_) => "CONFIG_ERROR",
            _ => "INTERNAL_ERROR",
        }
    }

    /// Tier at which the failure happened, when it is a lifecycle failure
    pub fn tier(&self) -> Option<Tier> {
        match self {
            Error::Guard(_) | Error::Transfer(_) | Error::VersionMismatch { .. } => {
                Some(Tier::Flash)
            }
            Error::BootTimeout { tier, .. } | Error::RecoveryExhausted { tier, .. } => Some(*tier),
            Error::SshUnavailable(_) => Some(Tier::AvailabilityWait),
            Error::SerialRecoveryFailed(_) => Some(Tier::SerialRecovery),
            Error::BootloaderInterrupt(_) => Some(Tier::BootloaderRecovery),
            _ => None,
        }
    }
}

/// Serializable error summary for JSON output
#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorReport {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guard: Option<GuardFailureKind>,
}

impl From<&Error> for ErrorReport {
    fn from(e: &Error) -> Self {
        Self {
            code: e.code().to_string(),
            message: e.to_string(),
            tier: e.tier(),
            guard: match e {
                Error::Guard(failure) => Some(failure.kind),
                _ => None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_error_names_the_guard() {
        let err = Error::guard(GuardFailureKind::BoardMismatch, "expected a, device reports b");
        let report = ErrorReport::from(&err);
        assert_eq!(report.code, "GUARD_FAILURE");
        assert_eq!(report.guard, Some(GuardFailureKind::BoardMismatch));
        assert!(report.message.contains("board mismatch"));
    }

    #[test]
    fn test_terminal_errors_carry_tier() {
        let err = Error::RecoveryExhausted {
            tier: Tier::BootloaderRecovery,
            attempts: 3,
            symptom: "no autoboot banner".to_string(),
        };
        assert_eq!(err.tier(), Some(Tier::BootloaderRecovery));
        assert!(err.to_string().contains("no autoboot banner"));
    }

    #[test]
    fn test_serial_recovery_failure_report() {
        let err = Error::SerialRecoveryFailed("no shell on the serial console".to_string());
        let report = ErrorReport::from(&err);
        assert_eq!(report.code, "SERIAL_RECOVERY_FAILED");
        assert_eq!(report.tier, Some(Tier::SerialRecovery));
        assert_eq!(report.guard, None);
    }
}
