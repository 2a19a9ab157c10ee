//! Configuration file handling
//!
//! A config file describes the testbed: for every device, how to reach its
//! power relay, serial console and SSH server, plus the `DeviceProfile` that
//! parameterises the lifecycle algorithm for that device model.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::paths::config_path;
use super::{Error, Result};

/// Main configuration structure
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Devices under test, keyed by name
    #[serde(default)]
    pub devices: HashMap<String, DeviceConfig>,
}

/// Wiring and profile for one device
#[derive(Debug, Deserialize, Clone)]
pub struct DeviceConfig {
    /// Address the device is reachable at once its LAN is up
    pub host: String,

    /// SSH credentials
    #[serde(default)]
    pub ssh: SshConfig,

    /// Power relay commands
    pub power: PowerConfig,

    /// Serial console endpoint
    pub serial: SerialConfig,

    /// Serial isolation relay (models that need it)
    pub isolator: Option<IsolatorConfig>,

    /// Per-model behaviour
    #[serde(default)]
    pub profile: DeviceProfile,
}

/// SSH connection settings
#[derive(Debug, Deserialize, Clone)]
pub struct SshConfig {
    #[serde(default = "default_ssh_user")]
    pub user: String,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Private key passed with `-i`
    pub identity_file: Option<PathBuf>,

    /// Seconds before a connection attempt is abandoned
    #[serde(default = "default_ssh_connect_timeout")]
    pub connect_timeout: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            port: default_ssh_port(),
            identity_file: None,
            connect_timeout: default_ssh_connect_timeout(),
        }
    }
}

fn default_ssh_user() -> String {
    "root".to_string()
}
fn default_ssh_port() -> u16 {
    22
}
fn default_ssh_connect_timeout() -> u64 {
    5
}

/// Shell commands that switch the relay feeding the device
#[derive(Debug, Deserialize, Clone)]
pub struct PowerConfig {
    pub on_command: String,
    pub off_command: String,
}

/// Shell commands that switch the serial isolation relay
#[derive(Debug, Deserialize, Clone)]
pub struct IsolatorConfig {
    pub connect_command: String,
    pub disconnect_command: String,
}

/// Where the serial console lives
#[derive(Debug, Deserialize, Clone)]
pub struct SerialConfig {
    /// Local tty, already configured for the right baud rate
    pub device: Option<PathBuf>,
    /// Network serial server (ser2net style `host:port`)
    pub tcp: Option<String>,
}

/// Firmware family running on the device
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
pub enum FirmwareFamily {
    /// LibreMesh: slower start-up because of the mesh daemons
    #[serde(rename = "libremesh", alias = "lime")]
    LibreMesh,
    /// Vanilla OpenWrt
    #[default]
    #[serde(rename = "openwrt", alias = "vanilla")]
    OpenWrt,
}

/// Per-device-model configuration, read-only for a session
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DeviceProfile {
    #[serde(default)]
    pub flash: FlashSettings,

    #[serde(default)]
    pub boot: BootSettings,

    #[serde(default)]
    pub network: NetworkSettings,

    #[serde(default)]
    pub recovery: RecoverySettings,

    #[serde(default)]
    pub uboot: UBootSettings,
}

impl DeviceProfile {
    /// SSH availability window for the configured firmware family
    pub fn ssh_window(&self) -> Duration {
        match self.network.firmware {
            FirmwareFamily::LibreMesh => secs(self.network.ssh_wait_libremesh),
            FirmwareFamily::OpenWrt => secs(self.network.ssh_wait_openwrt),
        }
    }
}

/// Sysupgrade and guard settings
#[derive(Debug, Deserialize, Clone)]
pub struct FlashSettings {
    /// Board id the images are built for, e.g. `linksys,e8450-ubi`
    pub expected_board: Option<String>,

    #[serde(default)]
    pub keep_config: bool,

    #[serde(default)]
    pub allow_downgrade: bool,

    /// Seconds to wait for SSH after sysupgrade
    #[serde(default = "default_verify_boot_timeout")]
    pub verify_boot_timeout: u64,

    /// Free space required on /tmp beyond the image size, in MiB
    #[serde(default = "default_tmp_space_margin")]
    pub tmp_space_margin_mb: u64,

    #[serde(default = "default_remote_path")]
    pub remote_path: String,

    #[serde(default)]
    pub skip_if_installed: bool,
}

impl Default for FlashSettings {
    fn default() -> Self {
        Self {
            expected_board: None,
            keep_config: false,
            allow_downgrade: false,
            verify_boot_timeout: default_verify_boot_timeout(),
            tmp_space_margin_mb: default_tmp_space_margin(),
            remote_path: default_remote_path(),
            skip_if_installed: false,
        }
    }
}

fn default_verify_boot_timeout() -> u64 {
    120
}
fn default_tmp_space_margin() -> u64 {
    2
}
fn default_remote_path() -> String {
    "/tmp/sysupgrade.bin".to_string()
}

/// Power-on and console settings, in seconds
#[derive(Debug, Deserialize, Clone)]
pub struct BootSettings {
    /// Disconnect serial while power changes (GL-iNet quirk)
    #[serde(default)]
    pub requires_serial_disconnect: bool,

    #[serde(default = "default_boot_wait")]
    pub boot_wait: u64,

    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,

    /// Probe the goal before touching power
    #[serde(default = "default_true")]
    pub smart_state_detection: bool,

    #[serde(default = "default_fast_check_timeout")]
    pub fast_check_timeout: u64,

    /// Off time during a power cycle
    #[serde(default = "default_isolation_off_delay")]
    pub isolation_off_delay: u64,

    /// Settle time after the serial line is reconnected
    #[serde(default = "default_serial_settle")]
    pub serial_settle: u64,

    /// Grace period after `poweroff` before cutting power
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,
}

impl Default for BootSettings {
    fn default() -> Self {
        Self {
            requires_serial_disconnect: false,
            boot_wait: default_boot_wait(),
            connection_timeout: default_connection_timeout(),
            smart_state_detection: true,
            fast_check_timeout: default_fast_check_timeout(),
            isolation_off_delay: default_isolation_off_delay(),
            serial_settle: default_serial_settle(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_boot_wait() -> u64 {
    20
}
fn default_connection_timeout() -> u64 {
    60
}
fn default_fast_check_timeout() -> u64 {
    3
}
fn default_isolation_off_delay() -> u64 {
    3
}
fn default_serial_settle() -> u64 {
    8
}
fn default_shutdown_grace() -> u64 {
    10
}

/// LAN configuration and SSH availability settings
#[derive(Debug, Deserialize, Clone)]
pub struct NetworkSettings {
    #[serde(default)]
    pub firmware: FirmwareFamily,

    /// UCI interface section
    #[serde(default = "default_lan_interface")]
    pub lan_interface: String,

    /// Kernel device backing the interface
    #[serde(default = "default_lan_device")]
    pub lan_device: String,

    /// Init script of the mesh auto-configuration service
    #[serde(default = "default_mesh_service")]
    pub mesh_service: String,

    #[serde(default = "default_ssh_wait_libremesh")]
    pub ssh_wait_libremesh: u64,

    #[serde(default = "default_ssh_wait_openwrt")]
    pub ssh_wait_openwrt: u64,

    #[serde(default = "default_ssh_poll_interval")]
    pub ssh_poll_interval: u64,

    #[serde(default = "default_post_dhcp_wait")]
    pub post_dhcp_wait: u64,

    #[serde(default = "default_network_config_retry_wait")]
    pub network_config_retry_wait: u64,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            firmware: FirmwareFamily::default(),
            lan_interface: default_lan_interface(),
            lan_device: default_lan_device(),
            mesh_service: default_mesh_service(),
            ssh_wait_libremesh: default_ssh_wait_libremesh(),
            ssh_wait_openwrt: default_ssh_wait_openwrt(),
            ssh_poll_interval: default_ssh_poll_interval(),
            post_dhcp_wait: default_post_dhcp_wait(),
            network_config_retry_wait: default_network_config_retry_wait(),
        }
    }
}

fn default_lan_interface() -> String {
    "lan".to_string()
}
fn default_lan_device() -> String {
    "br-lan".to_string()
}
fn default_mesh_service() -> String {
    "lime-config".to_string()
}
fn default_ssh_wait_libremesh() -> u64 {
    180
}
fn default_ssh_wait_openwrt() -> u64 {
    60
}
fn default_ssh_poll_interval() -> u64 {
    5
}
fn default_post_dhcp_wait() -> u64 {
    30
}
fn default_network_config_retry_wait() -> u64 {
    5
}

/// Recovery ladder settings
#[derive(Debug, Deserialize, Clone)]
pub struct RecoverySettings {
    #[serde(default)]
    pub enable_uboot_recovery: bool,

    /// Bootloader recovery cycles per session
    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,

    /// Serial repair runs per session
    #[serde(default = "default_max_serial_attempts")]
    pub max_serial_attempts: u32,

    /// Directory served by the host TFTP server
    pub tftp_root: Option<PathBuf>,

    /// RAM-resident image copied into `tftp_root` before recovery
    pub recovery_image: Option<PathBuf>,

    /// Persistent image flashed once the RAM image is up
    pub firmware_image: Option<PathBuf>,

    #[serde(default = "default_uboot_boot_wait")]
    pub uboot_boot_wait: u64,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            enable_uboot_recovery: false,
            max_recovery_attempts: default_max_recovery_attempts(),
            max_serial_attempts: default_max_serial_attempts(),
            tftp_root: None,
            recovery_image: None,
            firmware_image: None,
            uboot_boot_wait: default_uboot_boot_wait(),
        }
    }
}

fn default_max_recovery_attempts() -> u32 {
    3
}
fn default_max_serial_attempts() -> u32 {
    1
}
fn default_uboot_boot_wait() -> u64 {
    120
}

/// Bootloader interaction parameters
#[derive(Debug, Deserialize, Clone)]
pub struct UBootSettings {
    #[serde(default = "default_uboot_prompt")]
    pub prompt: String,

    /// Banner printed while the bootloader counts down
    #[serde(default = "default_uboot_autoboot")]
    pub autoboot: String,

    /// Sequence sent to stop the countdown
    #[serde(default = "default_uboot_interrupt")]
    pub interrupt: String,

    #[serde(default = "default_uboot_interrupt_count")]
    pub interrupt_count: u32,

    #[serde(default = "default_uboot_interrupt_delay")]
    pub interrupt_delay_ms: u64,

    /// Commands that load the RAM image; `{image}` expands to its file name
    #[serde(default)]
    pub init_commands: Vec<String>,

    #[serde(default = "default_uboot_boot_command")]
    pub boot_command: String,

    /// Seconds to wait for the banner after power-on
    #[serde(default = "default_uboot_prompt_timeout")]
    pub prompt_timeout: u64,

    /// Seconds each init command may take (TFTP transfers are slow)
    #[serde(default = "default_uboot_command_timeout")]
    pub command_timeout: u64,
}

impl Default for UBootSettings {
    fn default() -> Self {
        Self {
            prompt: default_uboot_prompt(),
            autoboot: default_uboot_autoboot(),
            interrupt: default_uboot_interrupt(),
            interrupt_count: default_uboot_interrupt_count(),
            interrupt_delay_ms: default_uboot_interrupt_delay(),
            init_commands: Vec::new(),
            boot_command: default_uboot_boot_command(),
            prompt_timeout: default_uboot_prompt_timeout(),
            command_timeout: default_uboot_command_timeout(),
        }
    }
}

fn default_uboot_prompt() -> String {
    "=>".to_string()
}
fn default_uboot_autoboot() -> String {
    "Hit any key to stop autoboot".to_string()
}
fn default_uboot_interrupt() -> String {
    "\n".to_string()
}
fn default_uboot_interrupt_count() -> u32 {
    10
}
fn default_uboot_interrupt_delay() -> u64 {
    100
}
fn default_uboot_boot_command() -> String {
    "bootm".to_string()
}
fn default_uboot_prompt_timeout() -> u64 {
    60
}
fn default_uboot_command_timeout() -> u64 {
    60
}

/// Seconds from configuration to a `Duration`
pub fn secs(value: u64) -> Duration {
    Duration::from_secs(value)
}

impl Config {
    /// Load configuration from `path`, or from the default config file
    ///
    /// Returns default configuration if no file exists at the default path
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_file(path);
        }
        if let Some(path) = config_path() {
            if path.exists() {
                return Self::load_file(&path);
            }
        }
        Ok(Self::default())
    }

    fn load_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| Error::ConfigParse(e.to_string()))?;
        for (name, device) in &config.devices {
            device
                .validate()
                .map_err(|e| Error::Config(format!("device '{}': {}", name, e)))?;
        }
        Ok(config)
    }

    /// Get device configuration by name
    pub fn device(&self, name: &str) -> Result<&DeviceConfig> {
        self.devices
            .get(name)
            .ok_or_else(|| Error::UnknownDevice(name.to_string()))
    }
}

impl DeviceConfig {
    fn validate(&self) -> std::result::Result<(), String> {
        match (&self.serial.device, &self.serial.tcp) {
            (Some(_), Some(_)) => return Err("serial: set either 'device' or 'tcp', not both".into()),
            (None, None) => return Err("serial: one of 'device' or 'tcp' is required".into()),
            _ => {}
        }
        if self.profile.boot.requires_serial_disconnect && self.isolator.is_none() {
            return Err("requires_serial_disconnect is set but no [isolator] is configured".into());
        }
        if self.profile.recovery.enable_uboot_recovery && self.profile.recovery.max_recovery_attempts == 0 {
            return Err("enable_uboot_recovery needs max_recovery_attempts >= 1".into());
        }
        Ok(())
    }
}
