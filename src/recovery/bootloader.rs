//! Revive an unbootable device through the bootloader
//!
//! The device is power-cycled with the console attached, the autoboot
//! countdown is interrupted, a RAM-resident image is pulled over TFTP and
//! booted, and from that environment the persistent firmware is flashed
//! again with configuration discarded and downgrades allowed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;

use crate::common::config::{secs, DeviceProfile};
use crate::common::error::Tier;
use crate::common::{Error, Result};
use crate::flash::{self, FlashOptions, FlashReport, FlashRequest};
use crate::lifecycle::sequencer::{PowerOnMode, PowerSequencer};
use crate::monitor::SshAvailabilityMonitor;
use crate::network::{ConfigLink, NetworkConfigurator};
use crate::transport::{console, SerialConsole, SshSession, SshTarget};

/// Time allowed for the prompt once the interrupt sequence is sent
const PROMPT_AFTER_INTERRUPT: Duration = Duration::from_secs(10);
const SHELL_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const SHELL_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct BootloaderRecoveryAgent<'a> {
    profile: &'a DeviceProfile,
}

impl<'a> BootloaderRecoveryAgent<'a> {
    pub fn new(profile: &'a DeviceProfile) -> Self {
        Self { profile }
    }

    /// Copy the RAM image into the TFTP root; returns the name to request
    pub async fn stage_image(&self) -> Result<Option<String>> {
        let recovery = &self.profile.recovery;
        let Some(source) = &recovery.recovery_image else {
            return Ok(None);
        };
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::Config(format!("recovery image '{}' has no file name", source.display())))?;

        if let Some(root) = &recovery.tftp_root {
            let staged = root.join(&name);
            if staged != *source {
                tokio::fs::copy(source, &staged).await.map_err(|e| {
                    Error::Config(format!(
                        "failed to stage {} into {}: {}",
                        source.display(),
                        root.display(),
                        e
                    ))
                })?;
                tracing::info!(image = %name, tftp_root = %root.display(), "Staged recovery image");
            }
        }
        Ok(Some(name))
    }

    /// Bootloader commands with `{image}` expanded
    pub fn init_commands(&self, image: Option<&str>) -> Vec<String> {
        self.profile
            .uboot
            .init_commands
            .iter()
            .map(|cmd| match image {
                Some(image) => cmd.replace("{image}", image),
                None => cmd.clone(),
            })
            .collect()
    }

    /// Run one full recovery cycle and flash `firmware`
    pub async fn recover(
        &self,
        power: &mut PowerSequencer,
        serial: &mut dyn SerialConsole,
        ssh: &mut dyn SshSession,
        target: &SshTarget,
        monitor: &mut SshAvailabilityMonitor,
        firmware: &Path,
    ) -> Result<FlashReport> {
        let image = self.enter_bootloader(power, serial).await?;
        self.boot_recovery_image(serial, ssh, target, monitor, image.as_deref())
            .await?;
        self.reflash(ssh, target, monitor, firmware).await
    }

    /// Stage the RAM image, power-cycle and stop at the bootloader prompt
    ///
    /// Returns the staged image name.
    pub async fn enter_bootloader(
        &self,
        power: &mut PowerSequencer,
        serial: &mut dyn SerialConsole,
    ) -> Result<Option<String>> {
        let image = self.stage_image().await?;
        power.cycle(PowerOnMode::Immediate).await?;
        self.interrupt_autoboot(serial).await?;
        Ok(image)
    }

    /// Load and boot the RAM image, then get SSH to it
    pub async fn boot_recovery_image(
        &self,
        serial: &mut dyn SerialConsole,
        ssh: &mut dyn SshSession,
        target: &SshTarget,
        monitor: &mut SshAvailabilityMonitor,
        image: Option<&str>,
    ) -> Result<()> {
        self.boot_ram_image(serial, image).await?;
        self.wait_for_shell(serial).await?;
        self.obtain_ssh(serial, ssh, target, monitor).await
    }

    /// Flash the persistent image from the RAM environment and wait for it
    pub async fn reflash(
        &self,
        ssh: &mut dyn SshSession,
        target: &SshTarget,
        monitor: &mut SshAvailabilityMonitor,
        firmware: &Path,
    ) -> Result<FlashReport> {
        let request = FlashRequest::new(PathBuf::from(firmware));
        let report = flash::run_guarded(ssh, &self.profile.flash, &request, &FlashOptions::recovery()).await?;

        let verify = secs(self.profile.flash.verify_boot_timeout);
        if !monitor.wait_reachable(ssh, target, verify).await {
            return Err(Error::boot_timeout(
                Tier::BootloaderRecovery,
                verify,
                monitor.last_symptom().unwrap_or("SSH did not return after re-flash"),
            ));
        }
        tracing::info!("Bootloader recovery complete");
        Ok(report)
    }

    async fn interrupt_autoboot(&self, serial: &mut dyn SerialConsole) -> Result<()> {
        let uboot = &self.profile.uboot;

        let banner = serial
            .read_until(uboot.autoboot.as_bytes(), secs(uboot.prompt_timeout))
            .await?;
        if !banner.is_match() {
            return Err(Error::BootloaderInterrupt(format!(
                "no autoboot banner within {}s",
                uboot.prompt_timeout
            )));
        }

        for _ in 0..uboot.interrupt_count {
            serial.write(uboot.interrupt.as_bytes()).await?;
            tokio::time::sleep(Duration::from_millis(uboot.interrupt_delay_ms)).await;
        }

        let prompt = serial
            .read_until(uboot.prompt.as_bytes(), PROMPT_AFTER_INTERRUPT)
            .await?;
        if !prompt.is_match() {
            return Err(Error::BootloaderInterrupt(format!(
                "prompt '{}' not seen after interrupt: {}",
                uboot.prompt,
                prompt.text().trim()
            )));
        }
        tracing::info!("Reached bootloader prompt");
        Ok(())
    }

    async fn boot_ram_image(&self, serial: &mut dyn SerialConsole, image: Option<&str>) -> Result<()> {
        let uboot = &self.profile.uboot;
        let timeout = secs(uboot.command_timeout);

        for command in self.init_commands(image) {
            tracing::debug!(%command, "Bootloader command");
            console::send_line(serial, &command).await?;
            // Echo first, so prompts printed before the command are skipped
            let echoed = serial.read_until(command.as_bytes(), timeout).await?;
            let done = if echoed.is_match() {
                serial.read_until(uboot.prompt.as_bytes(), timeout).await?.is_match()
            } else {
                false
            };
            if !done {
                return Err(Error::boot_timeout(
                    Tier::BootloaderRecovery,
                    timeout,
                    format!("'{}' did not return to the bootloader prompt", command),
                ));
            }
        }

        console::send_line(serial, &uboot.boot_command).await
    }

    async fn wait_for_shell(&self, serial: &mut dyn SerialConsole) -> Result<()> {
        let wait = secs(self.profile.recovery.uboot_boot_wait);
        let deadline = Instant::now() + wait;

        loop {
            console::poke(serial, 1, Duration::from_millis(200)).await;
            if console::probe_shell(serial, SHELL_PROBE_TIMEOUT).await {
                tracing::info!("RAM image is up");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::boot_timeout(
                    Tier::BootloaderRecovery,
                    wait,
                    "RAM image never produced a shell",
                ));
            }
            tokio::time::sleep(SHELL_POLL_INTERVAL).await;
        }
    }

    async fn obtain_ssh(
        &self,
        serial: &mut dyn SerialConsole,
        ssh: &mut dyn SshSession,
        target: &SshTarget,
        monitor: &mut SshAvailabilityMonitor,
    ) -> Result<()> {
        let window = self.profile.ssh_window();
        if monitor.wait_reachable(ssh, target, window).await {
            return Ok(());
        }

        tracing::info!("RAM image has no SSH, configuring DHCP over serial");
        let configurator = NetworkConfigurator::new(&self.profile.network);
        if let Err(e) = configurator.ensure_persistent_dhcp(ConfigLink::Serial(serial)).await {
            tracing::warn!(error = %e, "DHCP configuration over serial failed");
        }
        if monitor.wait_reachable(ssh, target, window).await {
            return Ok(());
        }

        Err(Error::boot_timeout(
            Tier::BootloaderRecovery,
            window,
            monitor.last_symptom().unwrap_or("RAM image never became reachable over SSH"),
        ))
    }
}
