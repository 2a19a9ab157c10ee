//! SSH repair over the serial console
//!
//! Used when the device boots but its LAN never comes up. Every step is
//! attempted even if the previous one failed; only the final SSH check
//! decides the outcome.

use std::time::Duration;

use tokio::time::Instant;

use crate::common::config::{secs, DeviceProfile};
use crate::common::{Error, Result};
use crate::monitor::SshAvailabilityMonitor;
use crate::network::NetworkConfigurator;
use crate::transport::{console, SerialConsole, SshSession, SshTarget};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(15);
const NETWORK_RESTART_TIMEOUT: Duration = Duration::from_secs(45);
const UDHCPC_TIMEOUT: Duration = Duration::from_secs(30);
const ADDRESS_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct SerialRecoveryAgent<'a> {
    profile: &'a DeviceProfile,
}

impl<'a> SerialRecoveryAgent<'a> {
    pub fn new(profile: &'a DeviceProfile) -> Self {
        Self { profile }
    }

    /// Try to bring SSH back
    ///
    /// Fails with `Error::SerialRecoveryFailed` carrying the last symptom
    /// when SSH still does not answer afterwards.
    pub async fn repair(
        &self,
        serial: &mut dyn SerialConsole,
        ssh: &mut dyn SshSession,
        target: &SshTarget,
        monitor: &mut SshAvailabilityMonitor,
    ) -> Result<()> {
        let profile = self.profile;
        let network = &profile.network;
        tracing::info!(device = %network.lan_device, "Starting serial recovery");

        if let Err(e) = console::drain(serial, Duration::from_secs(1)).await {
            tracing::warn!(error = %e, "Console drain failed");
        }
        if !console::probe_shell(serial, COMMAND_TIMEOUT).await {
            tracing::warn!("Serial console has no shell, cannot repair");
            return Err(Error::SerialRecoveryFailed(
                "no shell on the serial console".to_string(),
            ));
        }

        let configurator = NetworkConfigurator::new(network);
        for step in configurator.script() {
            self.run(serial, &step.command, COMMAND_TIMEOUT).await;
        }
        self.run(serial, "/etc/init.d/network restart", NETWORK_RESTART_TIMEOUT).await;

        let mut has_address = self.wait_for_address(serial, secs(network.post_dhcp_wait)).await;
        if !has_address {
            tracing::warn!(
                wait_secs = network.post_dhcp_wait,
                "No address after network restart, running udhcpc"
            );
            let udhcpc = format!("udhcpc -i {} -n -q -t 5", network.lan_device);
            self.run(serial, &udhcpc, UDHCPC_TIMEOUT).await;
            has_address = self.has_address(serial).await;
        }
        if !has_address {
            tracing::warn!(device = %network.lan_device, "Still no address on LAN");
        }

        self.run(serial, "/etc/init.d/dropbear restart", COMMAND_TIMEOUT).await;

        if monitor.wait_reachable(ssh, target, profile.ssh_window()).await {
            tracing::info!("Serial recovery restored SSH");
            return Ok(());
        }

        let ssh_symptom = monitor.last_symptom().unwrap_or("unknown");
        Err(Error::SerialRecoveryFailed(if has_address {
            format!("SSH still unreachable after serial repair: {}", ssh_symptom)
        } else {
            format!("no address on {} after udhcpc: {}", network.lan_device, ssh_symptom)
        }))
    }

    /// Run a command, logging instead of failing
    async fn run(&self, serial: &mut dyn SerialConsole, command: &str, timeout: Duration) -> bool {
        match console::run_command(serial, command, timeout).await {
            Ok(output) if output.success() => true,
            Ok(output) => {
                tracing::warn!(command, code = output.exit_code, output = %output.stdout, "Recovery step failed");
                false
            }
            Err(e) => {
                tracing::warn!(command, error = %e, "Recovery step did not complete");
                false
            }
        }
    }

    async fn has_address(&self, serial: &mut dyn SerialConsole) -> bool {
        let command = format!("ip -4 addr show dev {}", self.profile.network.lan_device);
        match console::run_command(serial, &command, COMMAND_TIMEOUT).await {
            Ok(output) => output.stdout.contains("inet "),
            Err(e) => {
                tracing::debug!(error = %e, "Address query failed");
                false
            }
        }
    }

    async fn wait_for_address(&self, serial: &mut dyn SerialConsole, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        loop {
            if self.has_address(serial).await {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(ADDRESS_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::FirmwareFamily;
    use crate::transport::mock::{DeviceSim, Event, MockDevice, Stage, LAN_ADDRESS};
    use crate::transport::Credentials;

    fn profile() -> DeviceProfile {
        let mut profile = DeviceProfile::default();
        profile.network.firmware = FirmwareFamily::OpenWrt;
        profile
    }

    fn lan_down() -> DeviceSim {
        DeviceSim {
            ssh_up: false,
            address: None,
            uci_proto: "static".to_string(),
            ..DeviceSim::running()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_repair_restores_ssh_after_network_restart() {
        let device = MockDevice::new(lan_down());
        let profile = profile();
        let agent = SerialRecoveryAgent::new(&profile);
        let mut monitor = SshAvailabilityMonitor::from_settings(&profile.network);
        let target = SshTarget::new(LAN_ADDRESS, Credentials::default());

        agent
            .repair(&mut device.serial(), &mut device.ssh(), &target, &mut monitor)
            .await
            .unwrap();

        assert_eq!(device.with(|sim| sim.uci_proto.clone()), "dhcp");
        let events = device.events();
        assert!(events.contains(&Event::SerialCommand("/etc/init.d/dropbear restart".to_string())));
        assert!(!events.iter().any(|e| matches!(e, Event::SerialCommand(c) if c.starts_with("udhcpc"))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repair_falls_back_to_udhcpc() {
        let device = MockDevice::new(DeviceSim {
            address_on_network_restart: false,
            ..lan_down()
        });
        let profile = profile();
        let agent = SerialRecoveryAgent::new(&profile);
        let mut monitor = SshAvailabilityMonitor::from_settings(&profile.network);
        let target = SshTarget::new(LAN_ADDRESS, Credentials::default());

        agent
            .repair(&mut device.serial(), &mut device.ssh(), &target, &mut monitor)
            .await
            .unwrap();
        assert!(device
            .events()
            .contains(&Event::SerialCommand("udhcpc -i br-lan -n -q -t 5".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repair_fails_without_shell() {
        let device = MockDevice::new(DeviceSim {
            stage: Stage::Hung,
            ..lan_down()
        });
        let profile = profile();
        let agent = SerialRecoveryAgent::new(&profile);
        let mut monitor = SshAvailabilityMonitor::from_settings(&profile.network);
        let target = SshTarget::new(LAN_ADDRESS, Credentials::default());

        let err = agent
            .repair(&mut device.serial(), &mut device.ssh(), &target, &mut monitor)
            .await
            .unwrap_err();
        match err {
            Error::SerialRecoveryFailed(symptom) => assert_eq!(symptom, "no shell on the serial console"),
            other => panic!("Expected serial recovery failure, got {other:?}"),
        }
    }
}
