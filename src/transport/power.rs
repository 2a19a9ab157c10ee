//! Relay control through external commands
//!
//! Lab relays are usually driven by a small script (an Arduino relay board,
//! a USB relay, a PDU CLI). The configured command is run with `sh -c`; a
//! non-zero exit status is a failure.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use super::{PowerControl, SerialIsolator};
use crate::common::config::{IsolatorConfig, PowerConfig};
use crate::common::{Error, Result};

/// Power line switched by shell commands
#[derive(Debug, Clone)]
pub struct CommandPower {
    on_command: String,
    off_command: String,
}

impl CommandPower {
    pub fn new(config: &PowerConfig) -> Self {
        Self {
            on_command: config.on_command.clone(),
            off_command: config.off_command.clone(),
        }
    }
}

#[async_trait]
impl PowerControl for CommandPower {
    async fn on(&mut self) -> Result<()> {
        tracing::debug!(command = %self.on_command, "Power on");
        run_shell(&self.on_command).await.map_err(Error::Power)
    }

    async fn off(&mut self) -> Result<()> {
        tracing::debug!(command = %self.off_command, "Power off");
        run_shell(&self.off_command).await.map_err(Error::Power)
    }
}

/// Serial isolation relay switched by shell commands
#[derive(Debug, Clone)]
pub struct CommandIsolator {
    connect_command: String,
    disconnect_command: String,
}

impl CommandIsolator {
    pub fn new(config: &IsolatorConfig) -> Self {
        Self {
            connect_command: config.connect_command.clone(),
            disconnect_command: config.disconnect_command.clone(),
        }
    }
}

#[async_trait]
impl SerialIsolator for CommandIsolator {
    async fn connect(&mut self) -> Result<()> {
        tracing::debug!(command = %self.connect_command, "Serial line connect");
        run_shell(&self.connect_command).await.map_err(Error::Serial)
    }

    async fn disconnect(&mut self) -> Result<()> {
        tracing::debug!(command = %self.disconnect_command, "Serial line disconnect");
        run_shell(&self.disconnect_command).await.map_err(Error::Serial)
    }
}

/// Run `command` through the shell, returning stderr on failure
async fn run_shell(command: &str) -> std::result::Result<(), String> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| format!("failed to run '{}': {}", command, e))?;

    if output.status.success() {
        Ok(())
    } else {
        Err(format!(
            "'{}' exited with {:?}: {}",
            command,
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}
