//! Serial console over a byte stream
//!
//! Works with a local tty (already configured with `stty`) or a network
//! serial server such as ser2net.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;

use super::{ReadOutcome, SerialConsole};
use crate::common::config::SerialConfig;
use crate::common::{Error, Result};

/// Console backed by any async byte stream
pub struct StreamConsole<S> {
    stream: S,
    /// Bytes read past the last match
    pending: Vec<u8>,
    name: String,
}

impl<S> StreamConsole<S> {
    pub fn new(stream: S, name: impl Into<String>) -> Self {
        Self {
            stream,
            pending: Vec::new(),
            name: name.into(),
        }
    }
}

impl StreamConsole<tokio::fs::File> {
    /// Open a tty device
    pub async fn open_device(path: &Path) -> Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .await
            .map_err(|e| Error::Serial(format!("failed to open {}: {}", path.display(), e)))?;
        Ok(Self::new(file, path.display().to_string()))
    }
}

impl StreamConsole<TcpStream> {
    /// Connect to a network serial server
    pub async fn open_tcp(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::Serial(format!("failed to connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream, addr))
    }
}

/// Open the console described by the configuration
pub async fn open(config: &SerialConfig) -> Result<Box<dyn SerialConsole>> {
    match (&config.device, &config.tcp) {
        (Some(path), _) => Ok(Box::new(StreamConsole::open_device(path).await?)),
        (None, Some(addr)) => Ok(Box::new(StreamConsole::open_tcp(addr).await?)),
        (None, None) => Err(Error::Config("no serial endpoint configured".to_string())),
    }
}

#[async_trait]
impl<S> SerialConsole for StreamConsole<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        tracing::trace!(console = %self.name, data = %String::from_utf8_lossy(data), "Console write");
        self.stream
            .write_all(data)
            .await
            .map_err(|e| Error::Serial(format!("{}: write failed: {}", self.name, e)))?;
        self.stream
            .flush()
            .await
            .map_err(|e| Error::Serial(format!("{}: flush failed: {}", self.name, e)))
    }

    async fn read_until(&mut self, pattern: &[u8], timeout: Duration) -> Result<ReadOutcome> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 1024];

        loop {
            if let Some(pos) = find(&self.pending, pattern) {
                let rest = self.pending.split_off(pos + pattern.len());
                let matched = std::mem::replace(&mut self.pending, rest);
                return Ok(ReadOutcome::Matched(matched));
            }

            match tokio::time::timeout_at(deadline, self.stream.read(&mut buf)).await {
                Err(_) => return Ok(ReadOutcome::TimedOut(std::mem::take(&mut self.pending))),
                Ok(Ok(0)) => {
                    return Err(Error::Serial(format!("{}: console closed", self.name)));
                }
                Ok(Ok(n)) => {
                    tracing::trace!(
                        console = %self.name,
                        data = %String::from_utf8_lossy(&buf[..n]),
                        "Console read"
                    );
                    self.pending.extend_from_slice(&buf[..n]);
                }
                Ok(Err(e)) => {
                    return Err(Error::Serial(format!("{}: read failed: {}", self.name, e)));
                }
            }
        }
    }
}

/// Position of `needle` in `haystack`
pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_until_keeps_bytes_after_match() {
        let (host, mut device) = tokio::io::duplex(1024);
        let mut console = StreamConsole::new(host, "duplex");

        device
            .write_all(b"U-Boot 2022.01\nHit any key to stop autoboot:  3 \n")
            .await
            .unwrap();

        let first = console
            .read_until(b"stop autoboot", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(first.is_match());
        assert!(first.text().starts_with("U-Boot"));

        let rest = console.read_until(b"\n", Duration::from_secs(1)).await.unwrap();
        assert_eq!(rest.text(), ":  3 \n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_until_times_out_with_partial_output() {
        let (host, mut device) = tokio::io::duplex(1024);
        let mut console = StreamConsole::new(host, "duplex");

        device.write_all(b"Starting kernel ...").await.unwrap();

        let outcome = console
            .read_until(b"MT7622>", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome, ReadOutcome::TimedOut(b"Starting kernel ...".to_vec()));
    }

    #[tokio::test]
    async fn test_closed_console_is_an_error() {
        let (host, device) = tokio::io::duplex(64);
        let mut console = StreamConsole::new(host, "duplex");
        drop(device);

        let err = console.read_until(b"#", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::Serial(_)));
    }

    #[test]
    fn test_find() {
        assert_eq!(find(b"abcdef", b"cd"), Some(2));
        assert_eq!(find(b"abc", b"x"), None);
        assert_eq!(find(b"ab", b"abc"), None);
    }
}
