//! Device lifecycle state

use serde::Serialize;

/// Physical and logical state of the device under test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    /// Not observed yet in this session
    Unknown,
    PoweredOff,
    PoweredOn,
    BootloaderPrompt,
    LinuxShell,
    NetworkConfigured,
    SshReachable,
    Flashing,
    Rebooting,
    Recovering,
    Failed,
}

impl DeviceState {
    /// States a caller may ask `transition` for
    pub fn is_goal(&self) -> bool {
        matches!(self, Self::PoweredOff | Self::LinuxShell | Self::SshReachable)
    }

    /// Whether the device may be drawing power
    pub fn may_be_powered(&self) -> bool {
        !matches!(self, Self::PoweredOff)
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::PoweredOff => write!(f, "powered off"),
            Self::PoweredOn => write!(f, "powered on"),
            Self::BootloaderPrompt => write!(f, "bootloader prompt"),
            Self::LinuxShell => write!(f, "linux shell"),
            Self::NetworkConfigured => write!(f, "network configured"),
            Self::SshReachable => write!(f, "ssh reachable"),
            Self::Flashing => write!(f, "flashing"),
            Self::Rebooting => write!(f, "rebooting"),
            Self::Recovering => write!(f, "recovering"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One recorded state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: DeviceState,
    pub to: DeviceState,
    pub reason: String,
    /// Milliseconds since the session started
    pub at_ms: u64,
}
