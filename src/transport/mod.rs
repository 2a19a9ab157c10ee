//! Transports to the device under test
//!
//! The lifecycle code only ever talks to a device through these traits.
//! Concrete implementations are injected when the orchestrator is built:
//! relay commands for power, a tty or TCP stream for the console, the
//! OpenSSH client for SSH, and an in-memory simulated router for tests.

pub mod console;
pub mod mock;
pub mod power;
pub mod serial;
pub mod ssh;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::common::config::SshConfig;
use crate::common::Result;

pub use power::{CommandIsolator, CommandPower};
pub use serial::StreamConsole;
pub use ssh::OpenSshSession;

/// Relay-controlled power line
///
/// No acknowledgment beyond command issuance; the actual power state is
/// inferred from subsequent boot behaviour.
#[async_trait]
pub trait PowerControl: Send {
    async fn on(&mut self) -> Result<()>;
    async fn off(&mut self) -> Result<()>;
}

/// Relay that connects or disconnects the serial line
#[async_trait]
pub trait SerialIsolator: Send {
    async fn connect(&mut self) -> Result<()>;
    async fn disconnect(&mut self) -> Result<()>;
}

/// Result of a pattern read on the console
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes up to and including the pattern
    Matched(Vec<u8>),
    /// Everything read before the timeout elapsed
    TimedOut(Vec<u8>),
}

impl ReadOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Matched(_))
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Matched(b) | Self::TimedOut(b) => b,
        }
    }

    /// Console text, with malformed byte sequences replaced
    pub fn text(&self) -> String {
        String::from_utf8_lossy(self.bytes()).into_owned()
    }
}

/// Bidirectional byte transport to the device console
#[async_trait]
pub trait SerialConsole: Send {
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Read until `pattern` is seen or `timeout` elapses
    ///
    /// Bytes after the pattern stay buffered for the next read.
    async fn read_until(&mut self, pattern: &[u8], timeout: Duration) -> Result<ReadOutcome>;
}

/// Output of a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// First non-empty stdout line, trimmed
    pub fn first_line(&self) -> Option<&str> {
        self.stdout.lines().map(str::trim).find(|l| !l.is_empty())
    }
}

/// SSH credentials
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    pub port: u16,
    pub identity_file: Option<PathBuf>,
    pub connect_timeout: Duration,
}

impl From<&SshConfig> for Credentials {
    fn from(config: &SshConfig) -> Self {
        Self {
            user: config.user.clone(),
            port: config.port,
            identity_file: config.identity_file.clone(),
            connect_timeout: Duration::from_secs(config.connect_timeout),
        }
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::from(&SshConfig::default())
    }
}

/// Where SSH should connect
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub credentials: Credentials,
}

impl SshTarget {
    pub fn new(host: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            host: host.into(),
            credentials,
        }
    }
}

/// Remote command execution and file upload over an authenticated channel
#[async_trait]
pub trait SshSession: Send {
    async fn connect(&mut self, host: &str, credentials: &Credentials) -> Result<()>;

    async fn exec(&mut self, command: &str) -> Result<CommandOutput>;

    async fn upload(&mut self, local: &Path, remote: &str) -> Result<()>;

    /// Forget the current connection
    async fn disconnect(&mut self) {}
}
