//! Upload and apply a validated image

use super::guards::{FlashGuardEngine, FlashGuardResult};
use super::{FirmwareImage, FlashOptions, FlashOutcome};
use crate::common::config::FlashSettings;
use crate::common::{Error, Result};
use crate::transport::SshSession;

/// Build the sysupgrade invocation for `options`
pub fn sysupgrade_command(remote_path: &str, options: &FlashOptions) -> String {
    let mut command = String::from("sysupgrade");
    if !options.keep_config {
        command.push_str(" -n");
    }
    if options.allow_downgrade {
        command.push_str(" -F");
    }
    command.push(' ');
    command.push_str(remote_path);
    command
}

/// Uploads an image, runs the post-upload guards and issues sysupgrade
pub struct SysupgradeExecutor<'a> {
    settings: &'a FlashSettings,
}

impl<'a> SysupgradeExecutor<'a> {
    pub fn new(settings: &'a FlashSettings) -> Self {
        Self { settings }
    }

    /// Apply `image`
    ///
    /// Success means the flash command was issued, not that the device came
    /// back; reachability after the reboot is checked by the caller.
    pub async fn apply(
        &self,
        image: &FirmwareImage,
        options: &FlashOptions,
        ssh: &mut dyn SshSession,
        guards: &mut FlashGuardResult,
    ) -> Result<FlashOutcome> {
        let remote = &self.settings.remote_path;
        let engine = FlashGuardEngine::new(self.settings);

        tracing::info!(image = %image.file_name(), size = image.size, remote = %remote, "Uploading image");
        ssh.upload(&image.path, remote).await?;

        engine.verify_remote(image, ssh, guards).await?;
        engine.validate_functional(ssh, guards).await?;
        engine.ubi_advisory(image, guards);

        if options.validate_only {
            tracing::info!("Validate-only: image accepted, not flashing");
            if let Err(e) = ssh.exec(&format!("rm -f {}", remote)).await {
                tracing::debug!(error = %e, "Could not remove uploaded image");
            }
            return Ok(FlashOutcome::ValidatedOnly);
        }

        let command = sysupgrade_command(remote, options);
        tracing::info!(%command, "Starting sysupgrade");
        match ssh.exec(&command).await {
            Ok(output) if !output.success() => {
                return Err(Error::SshCommand {
                    command,
                    code: output.exit_code,
                    stderr: output.stderr.trim().to_string(),
                });
            }
            Ok(_) => {}
            // The device closes every session once the upgrade starts
            Err(e) => tracing::debug!(error = %e, "Connection dropped during sysupgrade"),
        }
        ssh.disconnect().await;

        Ok(FlashOutcome::Flashed { command })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysupgrade_flags() {
        let options = FlashOptions::default();
        assert_eq!(sysupgrade_command("/tmp/sysupgrade.bin", &options), "sysupgrade -n /tmp/sysupgrade.bin");

        let options = FlashOptions {
            keep_config: true,
            allow_downgrade: true,
            ..FlashOptions::default()
        };
        assert_eq!(sysupgrade_command("/tmp/fw.bin", &options), "sysupgrade -F /tmp/fw.bin");
    }
}
