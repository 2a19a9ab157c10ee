//! Simulated router for tests
//!
//! A `MockDevice` models one OpenWrt box behind a relay: U-Boot with an
//! autoboot countdown, a Linux shell on the console, a LAN that may or may not
//! come up, dropbear, `/tmp` and sysupgrade. Every transport handle shares the
//! same `DeviceSim`, and every interaction is appended to an event log that
//! tests assert on. Time-dependent behaviour (the autoboot window) follows
//! `tokio::time`, so tests run with a paused clock.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use super::serial::find;
use super::{
    CommandOutput, Credentials, PowerControl, ReadOutcome, SerialConsole, SerialIsolator,
    SshSession,
};
use crate::common::{Error, Result};

/// How long the bootloader waits for an interrupt before booting
pub const AUTOBOOT_WINDOW: Duration = Duration::from_secs(3);

/// Address the simulated LAN obtains via DHCP
pub const LAN_ADDRESS: &str = "192.168.20.182";

const SHELL_PROMPT: &str = "root@OpenWrt:/# ";
const UBOOT_PROMPT: &str = "MT7622> ";
const BANNER: &str = "\r\nU-Boot 2022.07-OpenWrt (Oct 18 2025)\r\nHit any key to stop autoboot:  3 \r\n";

/// What the console is currently attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Off,
    /// Bootloader counting down
    Banner,
    BootloaderPrompt,
    Linux,
    /// Powered but never produced a shell
    Hung,
}

/// Observable interactions with the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    PowerOn,
    PowerOff,
    SerialConnect,
    SerialDisconnect,
    SshConnect { ok: bool },
    Exec(String),
    SerialCommand(String),
    BootloaderCommand(String),
    Upload { remote: String },
    Flash(String),
}

/// Device behaviour knobs and state
#[derive(Debug, Clone)]
pub struct DeviceSim {
    pub board: String,
    pub release: String,
    pub revision: String,
    pub tmp_free_kb: u64,
    /// Persistent firmware boots to a shell
    pub bootable: bool,
    /// LAN and dropbear come up on their own after boot
    pub ssh_after_boot: bool,
    pub address_on_network_restart: bool,
    pub address_on_udhcpc: bool,
    /// Dropbear restart brings SSH back once an address exists
    pub ssh_repairable: bool,
    /// Connect attempts refused even though SSH is up
    pub ssh_connect_failures: u32,
    pub functional_ok: bool,
    pub corrupt_uploads: bool,
    pub upload_fails: bool,
    pub bootloader_responds: bool,
    pub ramboot_ok: bool,
    /// Sysupgrade leaves a bootable firmware behind
    pub flash_ok: bool,
    /// Release reported after a successful flash
    pub flashed_release: Option<String>,
    pub mesh_service_enabled: bool,
    pub uci_proto: String,
    /// Bytes emitted on the console before every command response
    pub console_noise: Vec<u8>,

    pub powered: bool,
    pub stage: Stage,
    pub ssh_up: bool,
    pub address: Option<String>,
    pub serial_connected: bool,
    pub events: Vec<Event>,

    /// Internal simulation state, never set by tests
    pub runtime: SimRuntime,
}

/// Connection, console and filesystem state of a running simulation
#[derive(Debug, Clone, Default)]
pub struct SimRuntime {
    ssh_connected: bool,
    powered_at: Option<Instant>,
    banner_pending: bool,
    console: Vec<u8>,
    line: Vec<u8>,
    uploads: HashMap<String, Vec<u8>>,
}

impl Default for DeviceSim {
    fn default() -> Self {
        Self {
            board: "linksys,e8450-ubi".to_string(),
            release: "23.05.5".to_string(),
            revision: "r24106-10cc5fcd00".to_string(),
            tmp_free_kb: 200_000,
            bootable: true,
            ssh_after_boot: true,
            address_on_network_restart: true,
            address_on_udhcpc: true,
            ssh_repairable: true,
            ssh_connect_failures: 0,
            functional_ok: true,
            corrupt_uploads: false,
            upload_fails: false,
            bootloader_responds: true,
            ramboot_ok: true,
            flash_ok: true,
            flashed_release: None,
            mesh_service_enabled: false,
            uci_proto: "static".to_string(),
            console_noise: Vec::new(),
            powered: false,
            stage: Stage::Off,
            ssh_up: false,
            address: None,
            serial_connected: true,
            events: Vec::new(),
            runtime: SimRuntime::default(),
        }
    }
}

impl DeviceSim {
    /// A device that is already up with a reachable LAN
    pub fn running() -> Self {
        Self {
            powered: true,
            stage: Stage::Linux,
            ssh_up: true,
            address: Some(LAN_ADDRESS.to_string()),
            uci_proto: "dhcp".to_string(),
            ..Self::default()
        }
    }

    /// Advance time-driven behaviour and emit pending console output
    fn settle(&mut self) {
        if self.stage == Stage::Banner {
            if self.runtime.banner_pending && self.serial_connected && self.bootloader_responds {
                self.emit(BANNER.as_bytes());
                self.runtime.banner_pending = false;
            }
            let elapsed = self.runtime.powered_at.map(|t| t.elapsed()).unwrap_or_default();
            if elapsed >= AUTOBOOT_WINDOW {
                self.boot_linux();
            }
        }
    }

    fn boot_linux(&mut self) {
        self.runtime.banner_pending = false;
        if self.bootable {
            self.stage = Stage::Linux;
            self.ssh_up = self.ssh_after_boot;
            self.address = self.ssh_after_boot.then(|| LAN_ADDRESS.to_string());
            self.emit(b"\r\nPlease press Enter to activate this console.\r\n");
        } else {
            self.stage = Stage::Hung;
        }
    }

    fn power_on(&mut self) {
        if self.powered {
            return;
        }
        self.powered = true;
        self.stage = Stage::Banner;
        self.runtime.powered_at = Some(Instant::now());
        self.runtime.banner_pending = true;
        self.ssh_up = false;
        self.address = None;
        self.settle();
    }

    fn power_off(&mut self) {
        self.powered = false;
        self.stage = Stage::Off;
        self.ssh_up = false;
        self.runtime.ssh_connected = false;
        self.address = None;
        self.runtime.banner_pending = false;
        self.runtime.line.clear();
    }

    /// Reboot into whatever is on flash
    fn reboot(&mut self) {
        self.ssh_up = false;
        self.runtime.ssh_connected = false;
        self.address = None;
        self.stage = Stage::Banner;
        self.runtime.powered_at = Some(Instant::now());
        self.runtime.banner_pending = true;
    }

    fn emit(&mut self, data: &[u8]) {
        if self.serial_connected {
            self.runtime.console.extend_from_slice(data);
        }
    }

    fn serial_write(&mut self, data: &[u8]) {
        self.settle();
        if !self.serial_connected {
            return;
        }
        match self.stage {
            Stage::Banner => {
                if data.contains(&b'\n') || data.contains(&b' ') {
                    self.stage = Stage::BootloaderPrompt;
                    self.runtime.banner_pending = false;
                    self.emit(format!("\r\n{}", UBOOT_PROMPT).as_bytes());
                }
            }
            Stage::BootloaderPrompt | Stage::Linux => {
                for &byte in data {
                    if byte == b'\n' {
                        let line = String::from_utf8_lossy(&self.runtime.line).to_string();
                        self.runtime.line.clear();
                        self.console_line(line.trim_end_matches('\r'));
                    } else {
                        self.runtime.line.push(byte);
                    }
                }
            }
            Stage::Off | Stage::Hung => {}
        }
    }

    fn console_line(&mut self, line: &str) {
        match self.stage {
            Stage::BootloaderPrompt => {
                if line.trim().is_empty() {
                    self.emit(format!("\r\n{}", UBOOT_PROMPT).as_bytes());
                    return;
                }
                self.events.push(Event::BootloaderCommand(line.to_string()));
                if line.starts_with("boot") {
                    if self.ramboot_ok {
                        self.stage = Stage::Linux;
                        self.ssh_up = true;
                        self.address = Some(LAN_ADDRESS.to_string());
                        self.emit(b"\r\nStarting kernel ...\r\n\r\nPlease press Enter to activate this console.\r\n");
                    } else {
                        self.stage = Stage::Hung;
                        self.emit(b"\r\nWrong Image Format for bootm command\r\n");
                    }
                } else {
                    self.emit(format!("{}\r\nBytes transferred = 6291456\r\n{}", line, UBOOT_PROMPT).as_bytes());
                }
            }
            Stage::Linux => {
                let Some(idx) = line.find("; printf") else {
                    self.emit(format!("\r\n{}", SHELL_PROMPT).as_bytes());
                    return;
                };
                let command = line[..idx].to_string();
                let seq = line
                    .split("__DUT_RC ")
                    .nth(1)
                    .and_then(|rest| rest.split_whitespace().next())
                    .unwrap_or("0")
                    .to_string();
                self.events.push(Event::SerialCommand(command.clone()));
                let reply = self.shell(&command);
                let noise = self.console_noise.clone();
                self.emit(format!("{}\r\n", line).as_bytes());
                self.emit(&noise);
                self.emit(reply.stdout.as_bytes());
                self.emit(reply.stderr.as_bytes());
                self.emit(format!("\r\n__DUT_RC_{}={}__END\r\n{}", seq, reply.exit_code, SHELL_PROMPT).as_bytes());
                if reply.reboots {
                    self.reboot();
                }
            }
            _ => {}
        }
    }

    /// Execute one shell command against the simulated system
    fn shell(&mut self, command: &str) -> Reply {
        let cmd = command.trim();
        let ok = |stdout: String| Reply {
            stdout,
            ..Reply::default()
        };

        if cmd == "true" || cmd == "sync" {
            return Reply::default();
        }
        if let Some(text) = cmd.strip_prefix("echo ") {
            return ok(format!("{}\n", text.trim_matches('\'').trim_matches('"')));
        }
        if cmd.contains("/tmp/sysinfo/board_name") {
            return ok(format!("{}\n", self.board));
        }
        if cmd.starts_with("ubus call system board") {
            return ok(serde_json::json!({ "board_name": self.board }).to_string());
        }
        if cmd == "cat /etc/openwrt_release" {
            return ok(format!(
                "DISTRIB_ID='OpenWrt'\nDISTRIB_RELEASE='{}'\nDISTRIB_REVISION='{}'\n",
                self.release, self.revision
            ));
        }
        if cmd.starts_with("df -k") {
            return ok(format!(
                "Filesystem 1K-blocks Used Available Use% Mounted on\ntmpfs 245000 1000 {} 1% /tmp\n",
                self.tmp_free_kb
            ));
        }
        if let Some(path) = cmd.strip_prefix("wc -c < ") {
            return match self.runtime.uploads.get(path.trim()) {
                Some(data) => ok(format!("{}\n", data.len())),
                None => Reply::failed("No such file or directory"),
            };
        }
        if let Some(path) = cmd.strip_prefix("sha256sum ") {
            let path = path.trim();
            return match self.runtime.uploads.get(path) {
                Some(data) => ok(format!("{}  {}\n", hex::encode(Sha256::digest(data)), path)),
                None => Reply::failed("No such file or directory"),
            };
        }
        if cmd.starts_with("sysupgrade -T") {
            return if self.functional_ok {
                Reply::default()
            } else {
                Reply {
                    stderr: "Image check 'platform_check_image' failed.\n".to_string(),
                    exit_code: 1,
                    ..Reply::default()
                }
            };
        }
        if cmd.starts_with("sysupgrade") {
            self.events.push(Event::Flash(cmd.to_string()));
            self.bootable = self.flash_ok;
            if let Some(release) = self.flashed_release.clone() {
                self.release = release;
            }
            return Reply {
                stdout: "Commencing upgrade. Closing all shell sessions.\n".to_string(),
                drops_connection: true,
                reboots: true,
                ..Reply::default()
            };
        }
        if cmd.starts_with("uci -q get network.") {
            return ok(format!("{}\n", self.uci_proto));
        }
        if cmd.starts_with("uci set network.") && cmd.contains(".proto=") {
            self.uci_proto = cmd
                .rsplit('=')
                .next()
                .unwrap_or_default()
                .trim_matches('\'')
                .to_string();
            return Reply::default();
        }
        if cmd.contains("/etc/init.d/") && cmd.contains(" disable") && !cmd.contains("dropbear") {
            self.mesh_service_enabled = false;
            return Reply::default();
        }
        if cmd.starts_with("/etc/init.d/network restart") {
            if self.address_on_network_restart {
                self.address = Some(LAN_ADDRESS.to_string());
            }
            return Reply::default();
        }
        if cmd.starts_with("ip -4 addr show") {
            return match &self.address {
                Some(addr) => ok(format!("    inet {}/24 brd 192.168.20.255 scope global br-lan\n", addr)),
                None => Reply::default(),
            };
        }
        if cmd.starts_with("udhcpc") {
            if self.address_on_udhcpc {
                self.address = Some(LAN_ADDRESS.to_string());
                return ok(format!("udhcpc: lease of {} obtained\n", LAN_ADDRESS));
            }
            return Reply::failed("udhcpc: no lease, failing");
        }
        if cmd.starts_with("/etc/init.d/dropbear restart") {
            if self.address.is_some() && self.ssh_repairable {
                self.ssh_up = true;
            }
            return Reply::default();
        }
        if cmd == "poweroff" {
            self.stage = Stage::Hung;
            self.ssh_up = false;
            return Reply {
                drops_connection: true,
                ..Reply::default()
            };
        }
        Reply::default()
    }
}

#[derive(Debug, Default)]
struct Reply {
    stdout: String,
    stderr: String,
    exit_code: i32,
    drops_connection: bool,
    reboots: bool,
}

impl Reply {
    fn failed(stderr: &str) -> Self {
        Self {
            stderr: format!("{}\n", stderr),
            exit_code: 1,
            ..Self::default()
        }
    }
}

/// Shared handle to a simulated device
#[derive(Clone, Default)]
pub struct MockDevice {
    sim: Arc<Mutex<DeviceSim>>,
}

impl MockDevice {
    pub fn new(sim: DeviceSim) -> Self {
        Self {
            sim: Arc::new(Mutex::new(sim)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceSim> {
        match self.sim.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Inspect or modify the simulation
    pub fn with<R>(&self, f: impl FnOnce(&mut DeviceSim) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn events(&self) -> Vec<Event> {
        self.lock().events.clone()
    }

    /// Remote commands run over SSH, in order
    pub fn ssh_commands(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Exec(cmd) => Some(cmd),
                _ => None,
            })
            .collect()
    }

    pub fn uploads(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Upload { .. }))
            .count()
    }

    pub fn flashes(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Flash(cmd) => Some(cmd),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, event: &Event) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }

    pub fn power(&self) -> MockPower {
        MockPower(self.clone())
    }

    pub fn serial(&self) -> MockSerial {
        MockSerial(self.clone())
    }

    pub fn ssh(&self) -> MockSsh {
        MockSsh(self.clone())
    }

    pub fn isolator(&self) -> MockIsolator {
        MockIsolator(self.clone())
    }

    /// Boxed handles ready for a `DeviceLifecycle`
    pub fn transports(&self) -> crate::lifecycle::Transports {
        crate::lifecycle::Transports {
            power: Box::new(self.power()),
            isolator: Some(Box::new(self.isolator())),
            serial: Box::new(self.serial()),
            ssh: Box::new(self.ssh()),
        }
    }
}

/// Relay of the simulated device
pub struct MockPower(MockDevice);

#[async_trait]
impl PowerControl for MockPower {
    async fn on(&mut self) -> Result<()> {
        self.0.with(|sim| {
            sim.events.push(Event::PowerOn);
            sim.power_on();
        });
        Ok(())
    }

    async fn off(&mut self) -> Result<()> {
        self.0.with(|sim| {
            sim.events.push(Event::PowerOff);
            sim.power_off();
        });
        Ok(())
    }
}

/// Serial isolation relay of the simulated device
pub struct MockIsolator(MockDevice);

#[async_trait]
impl SerialIsolator for MockIsolator {
    async fn connect(&mut self) -> Result<()> {
        self.0.with(|sim| {
            sim.events.push(Event::SerialConnect);
            sim.serial_connected = true;
            sim.settle();
        });
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.0.with(|sim| {
            sim.events.push(Event::SerialDisconnect);
            sim.serial_connected = false;
            sim.runtime.console.clear();
        });
        Ok(())
    }
}

/// Console of the simulated device
pub struct MockSerial(MockDevice);

impl MockSerial {
    fn take_match(&self, pattern: &[u8]) -> Option<Vec<u8>> {
        self.0.with(|sim| {
            sim.settle();
            let pos = find(&sim.runtime.console, pattern)?;
            let rest = sim.runtime.console.split_off(pos + pattern.len());
            Some(std::mem::replace(&mut sim.runtime.console, rest))
        })
    }
}

#[async_trait]
impl SerialConsole for MockSerial {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.0.with(|sim| sim.serial_write(data));
        Ok(())
    }

    async fn read_until(&mut self, pattern: &[u8], timeout: Duration) -> Result<ReadOutcome> {
        if let Some(matched) = self.take_match(pattern) {
            return Ok(ReadOutcome::Matched(matched));
        }
        tokio::time::sleep(timeout).await;
        if let Some(matched) = self.take_match(pattern) {
            return Ok(ReadOutcome::Matched(matched));
        }
        Ok(ReadOutcome::TimedOut(
            self.0.with(|sim| std::mem::take(&mut sim.runtime.console)),
        ))
    }
}

/// SSH server of the simulated device
pub struct MockSsh(MockDevice);

#[async_trait]
impl SshSession for MockSsh {
    async fn connect(&mut self, host: &str, _credentials: &Credentials) -> Result<()> {
        self.0.with(|sim| {
            sim.settle();
            let reachable = sim.powered && sim.ssh_up && sim.stage == Stage::Linux;
            let refused = reachable && sim.ssh_connect_failures > 0;
            if refused {
                sim.ssh_connect_failures -= 1;
            }
            let ok = reachable && !refused;
            sim.events.push(Event::SshConnect { ok });
            sim.runtime.ssh_connected = ok;
            if ok {
                Ok(())
            } else if refused {
                Err(Error::ssh_connect(host, "Connection refused"))
            } else {
                Err(Error::ssh_connect(host, "No route to host"))
            }
        })
    }

    async fn exec(&mut self, command: &str) -> Result<CommandOutput> {
        self.0.with(|sim| {
            sim.settle();
            if !sim.runtime.ssh_connected || !sim.ssh_up {
                return Err(Error::ssh_connect(LAN_ADDRESS, "Connection closed"));
            }
            sim.events.push(Event::Exec(command.to_string()));
            let reply = sim.shell(command);
            if reply.reboots {
                sim.reboot();
            }
            if reply.drops_connection {
                sim.runtime.ssh_connected = false;
                return Err(Error::ssh_connect(LAN_ADDRESS, "Connection closed by remote host"));
            }
            Ok(CommandOutput {
                stdout: reply.stdout,
                stderr: reply.stderr,
                exit_code: reply.exit_code,
            })
        })
    }

    async fn upload(&mut self, local: &Path, remote: &str) -> Result<()> {
        let data = std::fs::read(local)?;
        self.0.with(|sim| {
            if !sim.runtime.ssh_connected || !sim.ssh_up {
                return Err(Error::SshUnavailable("not connected".to_string()));
            }
            if sim.upload_fails {
                return Err(Error::Transfer("scp: connection reset".to_string()));
            }
            let mut data = data;
            if sim.corrupt_uploads {
                if let Some(last) = data.last_mut() {
                    *last ^= 0xff;
                }
            }
            sim.events.push(Event::Upload {
                remote: remote.to_string(),
            });
            sim.runtime.uploads.insert(remote.to_string(), data);
            Ok(())
        })
    }

    async fn disconnect(&mut self) {
        self.0.with(|sim| sim.runtime.ssh_connected = false);
    }
}
