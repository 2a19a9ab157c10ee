//! SSH session backed by the OpenSSH client binaries
//!
//! OpenWrt ships dropbear without an SFTP server, so uploads use the legacy
//! SCP protocol (`scp -O`). Host keys change on every reflash; they are not
//! recorded.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::{CommandOutput, Credentials, SshSession};
use crate::common::{Error, Result};

/// Exit status ssh uses for its own (transport) failures
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Upper bound for a single remote command
const EXEC_TIMEOUT: Duration = Duration::from_secs(120);

/// Upper bound for an image upload
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// SSH session driving `ssh` and `scp`
pub struct OpenSshSession {
    ssh: PathBuf,
    scp: PathBuf,
    target: Option<(String, Credentials)>,
}

impl OpenSshSession {
    /// Locate the OpenSSH client binaries in PATH
    pub fn new() -> Result<Self> {
        let ssh = which::which("ssh")
            .map_err(|e| Error::Config(format!("ssh client not found in PATH: {}", e)))?;
        let scp = which::which("scp")
            .map_err(|e| Error::Config(format!("scp not found in PATH: {}", e)))?;
        Ok(Self {
            ssh,
            scp,
            target: None,
        })
    }

    fn common_options(credentials: &Credentials) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", credentials.connect_timeout.as_secs().max(1)),
        ];
        if let Some(identity) = &credentials.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args
    }

    fn ssh_command(&self, host: &str, credentials: &Credentials, remote: &str) -> Command {
        let mut cmd = Command::new(&self.ssh);
        cmd.args(Self::common_options(credentials))
            .arg("-p")
            .arg(credentials.port.to_string())
            .arg(format!("{}@{}", credentials.user, host))
            .arg(remote)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn connected(&self) -> Result<(&str, &Credentials)> {
        self.target
            .as_ref()
            .map(|(host, creds)| (host.as_str(), creds))
            .ok_or_else(|| Error::SshUnavailable("no SSH connection established".to_string()))
    }
}

#[async_trait]
impl SshSession for OpenSshSession {
    async fn connect(&mut self, host: &str, credentials: &Credentials) -> Result<()> {
        let limit = credentials.connect_timeout + Duration::from_secs(5);
        let output = tokio::time::timeout(limit, self.ssh_command(host, credentials, "true").output())
            .await
            .map_err(|_| Error::ssh_connect(host, "connection attempt timed out"))?
            .map_err(|e| Error::ssh_connect(host, e.to_string()))?;

        if !output.status.success() {
            self.target = None;
            return Err(Error::ssh_connect(
                host,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        self.target = Some((host.to_string(), credentials.clone()));
        Ok(())
    }

    async fn exec(&mut self, command: &str) -> Result<CommandOutput> {
        let (host, credentials) = self.connected()?;
        tracing::debug!(host, command, "SSH exec");

        let output = tokio::time::timeout(
            EXEC_TIMEOUT,
            self.ssh_command(host, credentials, command).output(),
        )
        .await
        .map_err(|_| Error::Timeout(EXEC_TIMEOUT))??;

        let exit_code = output.status.code().unwrap_or(SSH_TRANSPORT_FAILURE);
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if exit_code == SSH_TRANSPORT_FAILURE {
            let host = host.to_string();
            self.target = None;
            return Err(Error::ssh_connect(&host, stderr.trim().to_string()));
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
            exit_code,
        })
    }

    async fn upload(&mut self, local: &Path, remote: &str) -> Result<()> {
        let (host, credentials) = self.connected()?;
        tracing::debug!(host, local = %local.display(), remote, "SCP upload");

        let mut cmd = Command::new(&self.scp);
        cmd.arg("-O")
            .args(Self::common_options(credentials))
            .arg("-P")
            .arg(credentials.port.to_string())
            .arg(local)
            .arg(format!("{}@{}:{}", credentials.user, host, remote))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(UPLOAD_TIMEOUT, cmd.output())
            .await
            .map_err(|_| Error::Transfer(format!("upload to {} timed out", remote)))?
            .map_err(|e| Error::Transfer(format!("failed to run scp: {}", e)))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(Error::Transfer(format!(
                "scp to {}:{} failed: {}",
                host,
                remote,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    async fn disconnect(&mut self) {
        self.target = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_options_include_identity() {
        let credentials = Credentials {
            identity_file: Some(PathBuf::from("/home/lab/.ssh/id_ed25519")),
            ..Credentials::default()
        };
        let args = OpenSshSession::common_options(&credentials);
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ConnectTimeout=5".to_string()));
        assert_eq!(args[args.len() - 2], "-i");
    }
}
