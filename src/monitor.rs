//! SSH availability polling

use std::time::Duration;

use tokio::time::Instant;

use crate::common::config::{secs, NetworkSettings};
use crate::transport::{SshSession, SshTarget};

/// Token echoed back to prove the session works end to end
const READY_MARKER: &str = "dutctl-ready";

/// Polls until SSH accepts a connection and runs a command
///
/// Never fails; the reason the last attempt did not succeed is kept for
/// diagnostics.
pub struct SshAvailabilityMonitor {
    poll_interval: Duration,
    last_symptom: Option<String>,
}

impl SshAvailabilityMonitor {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            last_symptom: None,
        }
    }

    pub fn from_settings(settings: &NetworkSettings) -> Self {
        Self::new(secs(settings.ssh_poll_interval))
    }

    pub fn last_symptom(&self) -> Option<&str> {
        self.last_symptom.as_deref()
    }

    /// One connect and echo round-trip
    pub async fn probe(&mut self, ssh: &mut dyn SshSession, target: &SshTarget) -> bool {
        if let Err(e) = ssh.connect(&target.host, &target.credentials).await {
            self.last_symptom = Some(e.to_string());
            return false;
        }

        match ssh.exec(&format!("echo {}", READY_MARKER)).await {
            Ok(output) if output.stdout.contains(READY_MARKER) => {
                self.last_symptom = None;
                true
            }
            Ok(output) => {
                self.last_symptom = Some(format!(
                    "echo round-trip returned {} with unexpected output '{}'",
                    output.exit_code,
                    output.stdout.trim()
                ));
                false
            }
            Err(e) => {
                self.last_symptom = Some(e.to_string());
                false
            }
        }
    }

    /// Poll until reachable or `timeout` elapses
    pub async fn wait_reachable(
        &mut self,
        ssh: &mut dyn SshSession,
        target: &SshTarget,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if self.probe(ssh, target).await {
                tracing::info!(host = %target.host, attempts, "SSH reachable");
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    host = %target.host,
                    attempts,
                    timeout_secs = timeout.as_secs(),
                    symptom = self.last_symptom().unwrap_or("unknown"),
                    "SSH not reachable"
                );
                return false;
            }
            tracing::debug!(host = %target.host, attempts, symptom = ?self.last_symptom, "Waiting for SSH");
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{DeviceSim, Event, MockDevice, LAN_ADDRESS};
    use crate::transport::Credentials;

    fn target() -> SshTarget {
        SshTarget::new(LAN_ADDRESS, Credentials::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_connect_succeeds() {
        let device = MockDevice::new(DeviceSim {
            ssh_connect_failures: 2,
            ..DeviceSim::running()
        });
        let mut ssh = device.ssh();
        let mut monitor = SshAvailabilityMonitor::new(Duration::from_secs(5));

        assert!(monitor.wait_reachable(&mut ssh, &target(), Duration::from_secs(60)).await);
        assert_eq!(device.count(&Event::SshConnect { ok: false }), 2);
        assert!(monitor.last_symptom().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_timeout_with_symptom() {
        let device = MockDevice::new(DeviceSim {
            ssh_up: false,
            ..DeviceSim::running()
        });
        let mut ssh = device.ssh();
        let mut monitor = SshAvailabilityMonitor::new(Duration::from_secs(5));

        let start = Instant::now();
        assert!(!monitor.wait_reachable(&mut ssh, &target(), Duration::from_secs(60)).await);
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert!(monitor.last_symptom().unwrap().contains("No route to host"));
        assert_eq!(device.count(&Event::SshConnect { ok: false }), 13);
    }
}
