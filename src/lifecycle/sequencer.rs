//! Power transitions with optional serial isolation
//!
//! Some models (GL-iNet) back-power through the serial adapter or refuse to
//! boot with the console attached, so the serial line is disconnected while
//! power changes and reconnected afterwards.

use std::time::Duration;

use crate::common::config::{secs, BootSettings};
use crate::common::Result;
use crate::transport::{PowerControl, SerialIsolator};

/// How long to wait after applying power
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerOnMode {
    /// Return after `boot_wait`, with the console attached and settled
    WaitForBoot,
    /// Return right after power-on with the console attached, so the
    /// bootloader banner can be caught
    Immediate,
}

/// Sole owner of the power relay and the serial isolator
pub struct PowerSequencer {
    power: Box<dyn PowerControl>,
    isolator: Option<Box<dyn SerialIsolator>>,
    isolate: bool,
    boot_wait: Duration,
    off_delay: Duration,
    serial_settle: Duration,
}

impl PowerSequencer {
    pub fn new(
        power: Box<dyn PowerControl>,
        isolator: Option<Box<dyn SerialIsolator>>,
        settings: &BootSettings,
    ) -> Self {
        let isolate = settings.requires_serial_disconnect && isolator.is_some();
        Self {
            power,
            isolator,
            isolate,
            boot_wait: secs(settings.boot_wait),
            off_delay: secs(settings.isolation_off_delay),
            serial_settle: secs(settings.serial_settle),
        }
    }

    pub fn isolates(&self) -> bool {
        self.isolate
    }

    async fn disconnect_serial(&mut self) -> Result<()> {
        match self.isolator.as_mut() {
            Some(isolator) if self.isolate => isolator.disconnect().await,
            _ => Ok(()),
        }
    }

    async fn connect_serial(&mut self) -> Result<()> {
        match self.isolator.as_mut() {
            Some(isolator) if self.isolate => isolator.connect().await,
            _ => Ok(()),
        }
    }

    /// Apply power to a device that is known to be off
    pub async fn power_on(&mut self, mode: PowerOnMode) -> Result<()> {
        self.disconnect_serial().await?;
        self.apply_power().await?;
        self.after_power_on(mode).await
    }

    pub async fn power_off(&mut self) -> Result<()> {
        self.power.off().await
    }

    /// Cut power, wait, and power on again
    pub async fn cycle(&mut self, mode: PowerOnMode) -> Result<()> {
        tracing::info!(isolated = self.isolate, "Power cycling device");
        self.power.off().await?;
        self.disconnect_serial().await?;
        tokio::time::sleep(self.off_delay).await;
        self.apply_power().await?;
        self.after_power_on(mode).await
    }

    /// Switch power on; the serial line is reattached if that fails
    async fn apply_power(&mut self) -> Result<()> {
        let Err(e) = self.power.on().await else {
            return Ok(());
        };
        if let Err(reconnect) = self.connect_serial().await {
            tracing::warn!(error = %reconnect, "Failed to reconnect serial after power-on failure");
        }
        Err(e)
    }

    async fn after_power_on(&mut self, mode: PowerOnMode) -> Result<()> {
        match mode {
            PowerOnMode::Immediate => self.connect_serial().await,
            PowerOnMode::WaitForBoot => {
                tracing::debug!(boot_wait_secs = self.boot_wait.as_secs(), "Waiting for boot");
                tokio::time::sleep(self.boot_wait).await;
                if self.isolate {
                    self.connect_serial().await?;
                    tokio::time::sleep(self.serial_settle).await;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Error;
    use crate::transport::mock::{DeviceSim, Event, MockDevice};
    use async_trait::async_trait;

    struct StuckRelay;

    #[async_trait]
    impl PowerControl for StuckRelay {
        async fn on(&mut self) -> Result<()> {
            Err(Error::Power("relay did not switch".to_string()))
        }

        async fn off(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn isolated_settings() -> BootSettings {
        BootSettings {
            requires_serial_disconnect: true,
            ..BootSettings::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_isolated_cycle_order() {
        let device = MockDevice::new(DeviceSim::running());
        let mut sequencer = PowerSequencer::new(
            Box::new(device.power()),
            Some(Box::new(device.isolator())),
            &isolated_settings(),
        );

        sequencer.cycle(PowerOnMode::WaitForBoot).await.unwrap();

        assert_eq!(
            device.events(),
            vec![
                Event::PowerOff,
                Event::SerialDisconnect,
                Event::PowerOn,
                Event::SerialConnect,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_isolation_serial_is_untouched() {
        let device = MockDevice::new(DeviceSim::default());
        let mut sequencer = PowerSequencer::new(
            Box::new(device.power()),
            Some(Box::new(device.isolator())),
            &BootSettings::default(),
        );

        sequencer.power_on(PowerOnMode::Immediate).await.unwrap();
        assert!(!sequencer.isolates());
        assert_eq!(device.events(), vec![Event::PowerOn]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_power_on_reconnects_serial() {
        let device = MockDevice::new(DeviceSim::running());
        let mut sequencer = PowerSequencer::new(
            Box::new(StuckRelay),
            Some(Box::new(device.isolator())),
            &isolated_settings(),
        );

        let err = sequencer.cycle(PowerOnMode::WaitForBoot).await.unwrap_err();
        assert!(matches!(err, Error::Power(_)));
        assert_eq!(
            device.events(),
            vec![Event::SerialDisconnect, Event::SerialConnect]
        );

        let err = sequencer.power_on(PowerOnMode::Immediate).await.unwrap_err();
        assert!(matches!(err, Error::Power(_)));
        assert_eq!(device.events().last(), Some(&Event::SerialConnect));
    }
}
