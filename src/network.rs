//! Persistent DHCP on the LAN interface
//!
//! Lab devices are reached through the testbed's DHCP server, so whatever
//! static address the firmware ships with is replaced. The mesh
//! auto-configuration service is disabled first, otherwise it rewrites the
//! network config on the next boot.

use std::time::Duration;

use crate::common::config::{secs, NetworkSettings};
use crate::common::{Error, Result};
use crate::transport::{console, SerialConsole, SshSession};

/// Per-command limit on the console
const SERIAL_COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

/// `/etc/init.d/network restart` can take a while on slow devices
const NETWORK_RESTART_TIMEOUT: Duration = Duration::from_secs(45);

/// Channel used to push the configuration
pub enum ConfigLink<'a> {
    Ssh(&'a mut dyn SshSession),
    Serial(&'a mut dyn SerialConsole),
}

/// One command of the configuration script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub command: String,
    /// A failure aborts the sequence
    pub required: bool,
}

impl Step {
    fn required(command: String) -> Self {
        Self {
            command,
            required: true,
        }
    }

    fn optional(command: String) -> Self {
        Self {
            command,
            required: false,
        }
    }
}

pub struct NetworkConfigurator<'a> {
    settings: &'a NetworkSettings,
}

impl<'a> NetworkConfigurator<'a> {
    pub fn new(settings: &'a NetworkSettings) -> Self {
        Self { settings }
    }

    /// Stop and disable the mesh service when it is installed
    pub fn disable_mesh_command(&self) -> String {
        let script = format!("/etc/init.d/{}", self.settings.mesh_service);
        format!(
            "if [ -x {0} ]; then {0} stop; {0} disable; fi",
            script
        )
    }

    /// The UCI edits that switch the LAN to DHCP
    pub fn dhcp_steps(&self) -> Vec<Step> {
        let iface = &self.settings.lan_interface;
        vec![
            Step::required(format!("uci set network.{}.proto=dhcp", iface)),
            Step::optional(format!("uci -q delete network.{}.ipaddr", iface)),
            Step::optional(format!("uci -q delete network.{}.netmask", iface)),
            Step::required("uci commit network".to_string()),
            Step::optional("sync".to_string()),
        ]
    }

    /// The full script: mesh service first, then the UCI edits
    pub fn script(&self) -> Vec<Step> {
        let mut steps = vec![Step::optional(self.disable_mesh_command())];
        steps.extend(self.dhcp_steps());
        steps
    }

    /// Make DHCP on the LAN interface survive reboots
    pub async fn ensure_persistent_dhcp(&self, link: ConfigLink<'_>) -> Result<()> {
        match link {
            ConfigLink::Ssh(ssh) => self.via_ssh(ssh).await,
            ConfigLink::Serial(serial) => self.via_serial(serial).await,
        }
    }

    async fn via_ssh(&self, ssh: &mut dyn SshSession) -> Result<()> {
        let query = format!("uci -q get network.{}.proto", self.settings.lan_interface);
        let current = ssh.exec(&query).await?;
        if current.first_line() == Some("dhcp") {
            tracing::debug!(interface = %self.settings.lan_interface, "LAN already uses DHCP");
            return Ok(());
        }

        for step in self.script() {
            let output = ssh.exec(&step.command).await?;
            if step.required && !output.success() {
                return Err(Error::SshCommand {
                    command: step.command,
                    code: output.exit_code,
                    stderr: output.stderr.trim().to_string(),
                });
            }
        }
        tracing::info!(interface = %self.settings.lan_interface, "Configured persistent DHCP over SSH");
        Ok(())
    }

    async fn via_serial(&self, serial: &mut dyn SerialConsole) -> Result<()> {
        if let Err(first) = self.serial_sequence(serial).await {
            tracing::warn!(error = %first, "Network configuration over serial failed, retrying");
            tokio::time::sleep(secs(self.settings.network_config_retry_wait)).await;
            self.serial_sequence(serial).await?;
        }

        match console::run_command(serial, "/etc/init.d/network restart", NETWORK_RESTART_TIMEOUT).await {
            Ok(output) if output.success() => {}
            Ok(output) => tracing::warn!(code = output.exit_code, "network restart returned non-zero"),
            Err(e) => tracing::warn!(error = %e, "network restart did not complete"),
        }
        tracing::info!(interface = %self.settings.lan_interface, "Configured persistent DHCP over serial");
        Ok(())
    }

    async fn serial_sequence(&self, serial: &mut dyn SerialConsole) -> Result<()> {
        console::drain(serial, Duration::from_secs(1)).await?;
        for step in self.script() {
            let output = console::run_command(serial, &step.command, SERIAL_COMMAND_TIMEOUT).await?;
            if step.required && !output.success() {
                return Err(Error::Serial(format!(
                    "'{}' exited with {}: {}",
                    step.command, output.exit_code, output.stdout
                )));
            }
        }
        Ok(())
    }
}
