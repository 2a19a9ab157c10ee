//! Top-level device state machine

use std::path::PathBuf;
use std::time::Duration;

use tokio::time::Instant;

use super::sequencer::{PowerOnMode, PowerSequencer};
use super::state::{DeviceState, Transition};
use crate::common::config::{secs, DeviceConfig, DeviceProfile};
use crate::common::error::Tier;
use crate::common::{Error, Result};
use crate::flash::{self, guards, FlashOptions, FlashOutcome, FlashReport, FlashRequest};
use crate::monitor::SshAvailabilityMonitor;
use crate::network::{ConfigLink, NetworkConfigurator};
use crate::recovery::{
    BootloaderRecoveryAgent, Escalation, RecoveryCounters, RecoveryPolicy, SerialRecoveryAgent,
    StepOutcome,
};
use crate::transport::{
    console, serial, CommandIsolator, CommandPower, Credentials, OpenSshSession, PowerControl,
    SerialConsole, SerialIsolator, SshSession, SshTarget,
};

/// Enter presses that wake "Please press Enter to activate this console."
const CONSOLE_POKES: usize = 6;
const CONSOLE_POKE_DELAY: Duration = Duration::from_millis(200);
const SHELL_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const SHELL_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Every transport to one device
pub struct Transports {
    pub power: Box<dyn PowerControl>,
    pub isolator: Option<Box<dyn SerialIsolator>>,
    pub serial: Box<dyn SerialConsole>,
    pub ssh: Box<dyn SshSession>,
}

impl Transports {
    /// Build the concrete transports described by the configuration
    pub async fn from_config(config: &DeviceConfig) -> Result<Self> {
        let isolator = config
            .isolator
            .as_ref()
            .map(|c| Box::new(CommandIsolator::new(c)) as Box<dyn SerialIsolator>);
        Ok(Self {
            power: Box::new(CommandPower::new(&config.power)),
            isolator,
            serial: serial::open(&config.serial).await?,
            ssh: Box::new(OpenSshSession::new()?),
        })
    }
}

/// Drives one device from whatever state it is in to a requested goal
pub struct DeviceLifecycle {
    name: String,
    profile: DeviceProfile,
    target: SshTarget,
    power: PowerSequencer,
    serial: Box<dyn SerialConsole>,
    ssh: Box<dyn SshSession>,
    monitor: SshAvailabilityMonitor,
    counters: RecoveryCounters,
    state: DeviceState,
    history: Vec<Transition>,
    started: Instant,
}

impl DeviceLifecycle {
    pub fn new(
        name: impl Into<String>,
        target: SshTarget,
        profile: DeviceProfile,
        transports: Transports,
    ) -> Self {
        let power = PowerSequencer::new(transports.power, transports.isolator, &profile.boot);
        Self {
            name: name.into(),
            target,
            power,
            serial: transports.serial,
            ssh: transports.ssh,
            monitor: SshAvailabilityMonitor::from_settings(&profile.network),
            counters: RecoveryCounters::from_settings(&profile.recovery),
            state: DeviceState::Unknown,
            history: Vec::new(),
            started: Instant::now(),
            profile,
        }
    }

    /// Open the configured transports and start a session
    pub async fn open(name: &str, config: &DeviceConfig) -> Result<Self> {
        let transports = Transports::from_config(config).await?;
        let target = SshTarget::new(config.host.clone(), Credentials::from(&config.ssh));
        Ok(Self::new(name, target, config.profile.clone(), transports))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn counters(&self) -> &RecoveryCounters {
        &self.counters
    }

    fn set_state(&mut self, to: DeviceState, reason: &str) {
        if to == self.state {
            return;
        }
        tracing::info!(device = %self.name, from = %self.state, to = %to, reason, "State transition");
        self.history.push(Transition {
            from: self.state,
            to,
            reason: reason.to_string(),
            at_ms: self.started.elapsed().as_millis() as u64,
        });
        self.state = to;
    }

    fn symptom(&self, fallback: &str) -> String {
        self.monitor.last_symptom().unwrap_or(fallback).to_string()
    }

    /// Drive the device to `goal`
    ///
    /// Supported goals are `PoweredOff`, `LinuxShell` and `SshReachable`.
    #[tracing::instrument(skip(self), fields(device = %self.name))]
    pub async fn transition(&mut self, goal: DeviceState) -> Result<()> {
        match goal {
            DeviceState::PoweredOff => self.ensure_off().await,
            DeviceState::LinuxShell => {
                if self.goal_already_met(goal).await {
                    return Ok(());
                }
                self.boot_to_shell().await
            }
            DeviceState::SshReachable => {
                if self.goal_already_met(goal).await {
                    return Ok(());
                }
                self.reach_ssh().await
            }
            other => Err(Error::invalid_transition(self.state, other)),
        }
    }

    /// Probe the goal before touching power
    async fn goal_already_met(&mut self, goal: DeviceState) -> bool {
        if !self.profile.boot.smart_state_detection || !self.state.may_be_powered() {
            return false;
        }
        let fast = secs(self.profile.boot.fast_check_timeout);

        let met = match goal {
            DeviceState::LinuxShell => console::probe_shell(&mut *self.serial, fast).await,
            DeviceState::SshReachable => {
                tokio::time::timeout(fast, self.monitor.probe(&mut *self.ssh, &self.target))
                    .await
                    .unwrap_or(false)
            }
            _ => false,
        };
        if met {
            tracing::info!(device = %self.name, goal = %goal, "Goal already satisfied, skipping power actions");
            self.set_state(goal, "detected without power action");
        }
        met
    }

    async fn boot_to_shell(&mut self) -> Result<()> {
        if self.state.may_be_powered() {
            self.power.cycle(PowerOnMode::WaitForBoot).await?;
        } else {
            self.power.power_on(PowerOnMode::WaitForBoot).await?;
        }
        self.set_state(DeviceState::PoweredOn, "power applied");
        self.await_shell().await
    }

    async fn await_shell(&mut self) -> Result<()> {
        console::poke(&mut *self.serial, CONSOLE_POKES, CONSOLE_POKE_DELAY).await;

        let timeout = secs(self.profile.boot.connection_timeout);
        let deadline = Instant::now() + timeout;
        loop {
            if console::probe_shell(&mut *self.serial, SHELL_PROBE_TIMEOUT).await {
                self.set_state(DeviceState::LinuxShell, "shell answered on console");
                return Ok(());
            }
            if Instant::now() >= deadline {
                self.set_state(DeviceState::Failed, "no shell on console");
                return Err(Error::boot_timeout(
                    Tier::Boot,
                    timeout,
                    "no shell echo on the serial console",
                ));
            }
            tokio::time::sleep(SHELL_POLL_INTERVAL).await;
        }
    }

    async fn reach_ssh(&mut self) -> Result<()> {
        let has_shell = match self.state {
            DeviceState::LinuxShell | DeviceState::NetworkConfigured => true,
            _ => match self.boot_to_shell().await {
                Ok(()) => true,
                Err(Error::BootTimeout { symptom, .. }) => {
                    tracing::warn!(device = %self.name, %symptom, "Boot failed, escalating");
                    false
                }
                Err(e) => return Err(e),
            },
        };

        if has_shell {
            self.configure_network().await;
        }
        self.run_escalation().await
    }

    /// Persistent DHCP, over SSH when it already answers
    async fn configure_network(&mut self) {
        let fast = secs(self.profile.boot.fast_check_timeout);
        let ssh_up = tokio::time::timeout(fast, self.monitor.probe(&mut *self.ssh, &self.target))
            .await
            .unwrap_or(false);

        let configurator = NetworkConfigurator::new(&self.profile.network);
        let link = if ssh_up {
            ConfigLink::Ssh(&mut *self.ssh)
        } else {
            ConfigLink::Serial(&mut *self.serial)
        };
        let result = configurator.ensure_persistent_dhcp(link).await;
        match result {
            Ok(()) => self.set_state(DeviceState::NetworkConfigured, "persistent DHCP configured"),
            Err(e) => tracing::warn!(device = %self.name, error = %e, "Network configuration failed"),
        }
    }

    /// Walk the recovery ladder until SSH answers or every tier is spent
    async fn run_escalation(&mut self) -> Result<()> {
        let policy = RecoveryPolicy::from_settings(&self.profile.recovery);
        let mut step = Escalation::AwaitingSsh;

        loop {
            tracing::debug!(device = %self.name, step = %step, "Recovery ladder");
            let outcome = match &step {
                Escalation::AwaitingSsh => {
                    let window = self.profile.ssh_window();
                    if self.monitor.wait_reachable(&mut *self.ssh, &self.target, window).await {
                        StepOutcome::Succeeded
                    } else {
                        StepOutcome::Failed(self.symptom("SSH did not come up"))
                    }
                }
                Escalation::SerialRepair => {
                    self.set_state(DeviceState::Recovering, "serial repair");
                    let agent = SerialRecoveryAgent::new(&self.profile);
                    match agent
                        .repair(&mut *self.serial, &mut *self.ssh, &self.target, &mut self.monitor)
                        .await
                    {
                        Ok(()) => StepOutcome::Succeeded,
                        Err(e) => StepOutcome::Failed(e.to_string()),
                    }
                }
                Escalation::BootloaderRecovery { attempt } => {
                    tracing::warn!(
                        device = %self.name,
                        attempt,
                        max = self.counters.bootloader.max(),
                        "Bootloader recovery"
                    );
                    self.set_state(DeviceState::Recovering, "bootloader recovery");
                    match self.configured_firmware() {
                        Ok(firmware) => match self.bootloader_cycle(firmware).await {
                            Ok(_) => StepOutcome::Succeeded,
                            Err(e) => StepOutcome::Failed(e.to_string()),
                        },
                        Err(e) => StepOutcome::Failed(e.to_string()),
                    }
                }
                Escalation::Reachable => {
                    self.set_state(DeviceState::SshReachable, "SSH verified");
                    return Ok(());
                }
                Escalation::Exhausted { tier, symptom } => {
                    self.set_state(DeviceState::Failed, "recovery exhausted");
                    return Err(Error::RecoveryExhausted {
                        tier: *tier,
                        attempts: self.counters.attempts(*tier),
                        symptom: symptom.clone(),
                    });
                }
            };
            step = step.next(outcome, &policy, &mut self.counters);
        }
    }

    fn configured_firmware(&self) -> Result<PathBuf> {
        self.profile.recovery.firmware_image.clone().ok_or_else(|| {
            Error::Config("bootloader recovery needs recovery.firmware_image".to_string())
        })
    }

    /// One bootloader recovery cycle, recording intermediate states
    async fn bootloader_cycle(&mut self, firmware: PathBuf) -> Result<FlashReport> {
        let profile = self.profile.clone();
        let agent = BootloaderRecoveryAgent::new(&profile);

        let image = agent.enter_bootloader(&mut self.power, &mut *self.serial).await?;
        self.set_state(DeviceState::BootloaderPrompt, "autoboot interrupted");

        agent
            .boot_recovery_image(
                &mut *self.serial,
                &mut *self.ssh,
                &self.target,
                &mut self.monitor,
                image.as_deref(),
            )
            .await?;
        self.set_state(DeviceState::Flashing, "RAM image reachable, re-flashing");

        let report = agent
            .reflash(&mut *self.ssh, &self.target, &mut self.monitor, &firmware)
            .await?;
        self.set_state(DeviceState::Recovering, "re-flashed and back on SSH");
        Ok(report)
    }

    /// Guarantee the device is physically powered down
    #[tracing::instrument(skip(self), fields(device = %self.name))]
    pub async fn ensure_off(&mut self) -> Result<()> {
        self.ssh.disconnect().await;
        self.power.power_off().await?;
        self.set_state(DeviceState::PoweredOff, "power cut");
        Ok(())
    }

    /// Graceful `poweroff` when SSH answers, then cut power regardless
    #[tracing::instrument(skip(self), fields(device = %self.name))]
    pub async fn cleanup_and_shutdown(&mut self) -> Result<()> {
        if self.state.may_be_powered() {
            let fast = secs(self.profile.boot.fast_check_timeout);
            let reachable = tokio::time::timeout(fast, self.monitor.probe(&mut *self.ssh, &self.target))
                .await
                .unwrap_or(false);
            if reachable {
                if let Err(e) = self.ssh.exec("poweroff").await {
                    tracing::debug!(error = %e, "Connection closed by poweroff");
                }
                tokio::time::sleep(secs(self.profile.boot.shutdown_grace)).await;
            } else {
                tracing::debug!(device = %self.name, "SSH not reachable, cutting power directly");
            }
        }
        self.ensure_off().await
    }

    /// Power-cycle and wait for a shell, without probing first
    #[tracing::instrument(skip(self), fields(device = %self.name))]
    pub async fn force_power_cycle(&mut self) -> Result<()> {
        self.ssh.disconnect().await;
        self.power.cycle(PowerOnMode::WaitForBoot).await?;
        self.set_state(DeviceState::PoweredOn, "forced power cycle");
        self.await_shell().await
    }

    /// Flash `request.image`, wait for the reboot and verify the result
    #[tracing::instrument(skip(self, request), fields(device = %self.name, image = %request.image.display()))]
    pub async fn flash(&mut self, request: &FlashRequest) -> Result<FlashReport> {
        self.transition(DeviceState::SshReachable).await?;
        self.set_state(DeviceState::Flashing, "flash requested");

        let options = FlashOptions::for_request(&self.profile.flash, request);
        let result = flash::run_guarded(&mut *self.ssh, &self.profile.flash, request, &options).await;
        let mut report = match result {
            Ok(report) => report,
            Err(e) => {
                self.set_state(DeviceState::SshReachable, "flash aborted before sysupgrade");
                return Err(e);
            }
        };

        if !matches!(report.outcome, FlashOutcome::Flashed { .. }) {
            self.set_state(DeviceState::SshReachable, "nothing flashed");
            return Ok(report);
        }

        self.set_state(DeviceState::Rebooting, "sysupgrade issued");
        self.reestablish_after_flash().await?;
        self.set_state(DeviceState::SshReachable, "back after sysupgrade");

        let installed = guards::read_release(&mut *self.ssh).await?;
        if let Some(expected) = &request.expected_version {
            if !installed.as_ref().is_some_and(|r| r.contains(expected)) {
                return Err(Error::VersionMismatch {
                    expected: expected.clone(),
                    found: installed.map_or_else(|| "unknown".to_string(), |r| r.to_string()),
                });
            }
        }
        tracing::info!(device = %self.name, installed = ?installed, "Flash verified");
        report.installed = installed;
        Ok(report)
    }

    /// Wait for SSH after sysupgrade, pushing DHCP over serial if the
    /// configuration was reset
    async fn reestablish_after_flash(&mut self) -> Result<()> {
        let verify = secs(self.profile.flash.verify_boot_timeout);
        let deadline = Instant::now() + verify;
        let first_window = self.profile.ssh_window().min(verify);

        if self.monitor.wait_reachable(&mut *self.ssh, &self.target, first_window).await {
            return Ok(());
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if !remaining.is_zero() && console::probe_shell(&mut *self.serial, SHELL_PROBE_TIMEOUT).await {
            tracing::info!(device = %self.name, "Rebooted without SSH, configuring DHCP over serial");
            let configurator = NetworkConfigurator::new(&self.profile.network);
            if let Err(e) = configurator
                .ensure_persistent_dhcp(ConfigLink::Serial(&mut *self.serial))
                .await
            {
                tracing::warn!(error = %e, "DHCP configuration after flash failed");
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if self.monitor.wait_reachable(&mut *self.ssh, &self.target, remaining).await {
                return Ok(());
            }
        }

        Err(Error::boot_timeout(
            Tier::Flash,
            verify,
            self.symptom("SSH did not return after sysupgrade"),
        ))
    }

    /// Run bootloader recovery directly, bypassing the lower tiers
    #[tracing::instrument(skip(self), fields(device = %self.name))]
    pub async fn recover(&mut self, firmware: Option<PathBuf>) -> Result<FlashReport> {
        let firmware = match firmware {
            Some(path) => path,
            None => self.configured_firmware()?,
        };
        if !self.counters.bootloader.try_acquire() {
            return Err(Error::RecoveryExhausted {
                tier: Tier::BootloaderRecovery,
                attempts: self.counters.bootloader.used(),
                symptom: "no bootloader recovery attempts left in this session".to_string(),
            });
        }

        self.set_state(DeviceState::Recovering, "manual bootloader recovery");
        match self.bootloader_cycle(firmware).await {
            Ok(report) => {
                self.set_state(DeviceState::SshReachable, "recovered");
                Ok(report)
            }
            Err(e) => {
                self.set_state(DeviceState::Failed, "bootloader recovery failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{DeviceSim, Event, MockDevice, LAN_ADDRESS};

    fn lifecycle(device: &MockDevice, profile: DeviceProfile) -> DeviceLifecycle {
        DeviceLifecycle::new(
            "dut",
            SshTarget::new(LAN_ADDRESS, Credentials::default()),
            profile,
            device.transports(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_boot_from_off_reaches_shell() {
        let device = MockDevice::new(DeviceSim::default());
        let mut dut = lifecycle(&device, DeviceProfile::default());
        dut.ensure_off().await.unwrap();

        dut.transition(DeviceState::LinuxShell).await.unwrap();

        assert_eq!(dut.state(), DeviceState::LinuxShell);
        let states: Vec<DeviceState> = dut.history().iter().map(|t| t.to).collect();
        assert_eq!(
            states,
            vec![DeviceState::PoweredOff, DeviceState::PoweredOn, DeviceState::LinuxShell]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_smart_detection_skips_power() {
        let device = MockDevice::new(DeviceSim::running());
        let mut dut = lifecycle(&device, DeviceProfile::default());

        dut.transition(DeviceState::SshReachable).await.unwrap();

        assert_eq!(dut.state(), DeviceState::SshReachable);
        assert_eq!(device.count(&Event::PowerOn), 0);
        assert_eq!(device.count(&Event::PowerOff), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_power_cycle_ignores_smart_detection() {
        let device = MockDevice::new(DeviceSim::running());
        let mut dut = lifecycle(&device, DeviceProfile::default());

        dut.force_power_cycle().await.unwrap();

        assert_eq!(dut.state(), DeviceState::LinuxShell);
        assert_eq!(device.count(&Event::PowerOff), 1);
        assert_eq!(device.count(&Event::PowerOn), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_boot_timeout_when_no_shell() {
        let device = MockDevice::new(DeviceSim {
            bootable: false,
            ..DeviceSim::default()
        });
        let mut dut = lifecycle(&device, DeviceProfile::default());
        dut.ensure_off().await.unwrap();

        let err = dut.transition(DeviceState::LinuxShell).await.unwrap_err();
        assert!(matches!(err, Error::BootTimeout { tier: Tier::Boot, .. }));
        assert_eq!(dut.state(), DeviceState::Failed);
    }

    #[tokio::test]
    async fn test_invalid_goal() {
        let device = MockDevice::new(DeviceSim::running());
        let mut dut = lifecycle(&device, DeviceProfile::default());
        let err = dut.transition(DeviceState::Flashing).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_powers_off_gracefully_then_cuts_power() {
        let device = MockDevice::new(DeviceSim::running());
        let mut dut = lifecycle(&device, DeviceProfile::default());

        dut.cleanup_and_shutdown().await.unwrap();

        assert!(device.ssh_commands().contains(&"poweroff".to_string()));
        assert_eq!(device.events().last(), Some(&Event::PowerOff));
        assert_eq!(dut.state(), DeviceState::PoweredOff);
    }
}
