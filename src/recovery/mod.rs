//! Recovery escalation
//!
//! When SSH does not come up the orchestrator walks a fixed ladder: wait for
//! SSH, repair over the serial console, then revive the device through the
//! bootloader. The ladder is an explicit transition table over
//! [`Escalation`]; every tier draws from its own bounded [`RecoveryCounter`]
//! and exhaustion is terminal.

pub mod bootloader;
pub mod serial;

use std::fmt;

use crate::common::config::RecoverySettings;
use crate::common::error::Tier;

pub use bootloader::BootloaderRecoveryAgent;
pub use serial::SerialRecoveryAgent;

/// Position on the recovery ladder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Escalation {
    AwaitingSsh,
    SerialRepair,
    BootloaderRecovery { attempt: u32 },
    Reachable,
    Exhausted { tier: Tier, symptom: String },
}

impl fmt::Display for Escalation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AwaitingSsh => write!(f, "awaiting ssh"),
            Self::SerialRepair => write!(f, "serial repair"),
            Self::BootloaderRecovery { attempt } => write!(f, "bootloader recovery #{}", attempt),
            Self::Reachable => write!(f, "reachable"),
            Self::Exhausted { tier, .. } => write!(f, "exhausted at {}", tier),
        }
    }
}

/// Result of running the step for the current position
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Succeeded,
    /// Failed, with the last transport-level symptom
    Failed(String),
}

/// What the ladder is allowed to do
#[derive(Debug, Clone, Copy)]
pub struct RecoveryPolicy {
    pub bootloader_enabled: bool,
    /// A persistent image is available to flash after a RAM boot
    pub has_firmware_image: bool,
}

impl RecoveryPolicy {
    pub fn from_settings(settings: &RecoverySettings) -> Self {
        Self {
            bootloader_enabled: settings.enable_uboot_recovery,
            has_firmware_image: settings.firmware_image.is_some(),
        }
    }
}

/// Bounded attempt counter for one recovery tier
#[derive(Debug, Clone)]
pub struct RecoveryCounter {
    tier: Tier,
    used: u32,
    max: u32,
}

impl RecoveryCounter {
    pub fn new(tier: Tier, max: u32) -> Self {
        Self { tier, used: 0, max }
    }

    /// Take one attempt, or return false once the maximum is reached
    pub fn try_acquire(&mut self) -> bool {
        if self.used >= self.max {
            tracing::debug!(tier = %self.tier, max = self.max, "Recovery tier exhausted");
            return false;
        }
        self.used += 1;
        true
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn max(&self) -> u32 {
        self.max
    }
}

/// Per-tier counters for a session
#[derive(Debug, Clone)]
pub struct RecoveryCounters {
    pub serial: RecoveryCounter,
    pub bootloader: RecoveryCounter,
}

impl RecoveryCounters {
    pub fn from_settings(settings: &RecoverySettings) -> Self {
        Self {
            serial: RecoveryCounter::new(Tier::SerialRecovery, settings.max_serial_attempts),
            bootloader: RecoveryCounter::new(Tier::BootloaderRecovery, settings.max_recovery_attempts),
        }
    }

    /// Attempts spent at `tier`
    pub fn attempts(&self, tier: Tier) -> u32 {
        match tier {
            Tier::SerialRecovery => self.serial.used(),
            Tier::BootloaderRecovery => self.bootloader.used(),
            _ => 0,
        }
    }
}

impl Escalation {
    /// Next position on the ladder given the outcome of the current one
    pub fn next(
        self,
        outcome: StepOutcome,
        policy: &RecoveryPolicy,
        counters: &mut RecoveryCounters,
    ) -> Escalation {
        let symptom = match outcome {
            StepOutcome::Succeeded => {
                return match self {
                    Self::Exhausted { .. } => self,
                    _ => Self::Reachable,
                };
            }
            StepOutcome::Failed(symptom) => symptom,
        };

        match self {
            Self::AwaitingSsh => {
                if counters.serial.try_acquire() {
                    Self::SerialRepair
                } else {
                    bootloader_or_exhausted(Tier::AvailabilityWait, symptom, policy, counters)
                }
            }
            Self::SerialRepair => bootloader_or_exhausted(Tier::SerialRecovery, symptom, policy, counters),
            Self::BootloaderRecovery { .. } => {
                bootloader_or_exhausted(Tier::BootloaderRecovery, symptom, policy, counters)
            }
            terminal @ (Self::Reachable | Self::Exhausted { .. }) => terminal,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Reachable | Self::Exhausted { .. })
    }
}

fn bootloader_or_exhausted(
    tier: Tier,
    symptom: String,
    policy: &RecoveryPolicy,
    counters: &mut RecoveryCounters,
) -> Escalation {
    if !policy.bootloader_enabled {
        return Escalation::Exhausted { tier, symptom };
    }
    if !policy.has_firmware_image {
        return Escalation::Exhausted {
            tier,
            symptom: format!("{}; bootloader recovery has no firmware image configured", symptom),
        };
    }
    if counters.bootloader.try_acquire() {
        Escalation::BootloaderRecovery {
            attempt: counters.bootloader.used(),
        }
    } else {
        Escalation::Exhausted {
            tier: Tier::BootloaderRecovery,
            symptom,
        }
    }
}
