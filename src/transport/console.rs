//! Console primitives on top of `SerialConsole`
//!
//! Commands sent over the console are framed with a completion marker so
//! their exit status can be recovered from the byte stream:
//! ```text
//! <command>; printf '%s_%s=%s%s\n' __DUT_RC <seq> "$?" __END
//! ...output...
//! __DUT_RC_<seq>=<status>__END
//! ```
//! The echoed command line never contains `__DUT_RC_<seq>=` itself, so the
//! marker only matches once the shell has actually run the command. Every
//! call uses a fresh sequence number; the late marker of a command that timed
//! out is skipped together with its output.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::{CommandOutput, ReadOutcome, SerialConsole};
use crate::common::{Error, Result};

const RC_PREFIX: &str = "__DUT_RC";
const END_MARKER: &[u8] = b"__END";
const LINE_DELIMITER: &[u8] = b"\n";

/// Time allowed for the status digits once the marker has been seen
const STATUS_TIMEOUT: Duration = Duration::from_secs(2);

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Send a line terminated by a newline
pub async fn send_line(serial: &mut dyn SerialConsole, line: &str) -> Result<()> {
    let mut data = Vec::with_capacity(line.len() + 1);
    data.extend_from_slice(line.as_bytes());
    data.extend_from_slice(LINE_DELIMITER);
    serial.write(&data).await
}

/// Discard asynchronous console noise
///
/// Sends a delimiter, reads until the next delimiter or `timeout`, discards
/// what was read and sends a delimiter again so the shell prints a fresh
/// prompt. Kernel log lines interleaved with prompts end up in the discarded
/// read instead of the next command's output.
pub async fn drain(serial: &mut dyn SerialConsole, timeout: Duration) -> Result<()> {
    serial.write(LINE_DELIMITER).await?;
    let discarded = serial.read_until(LINE_DELIMITER, timeout).await?;
    tracing::trace!(bytes = discarded.bytes().len(), "Drained console");
    serial.write(LINE_DELIMITER).await
}

/// Run a shell command over the console and collect its output
///
/// Output is decoded lossily, so malformed bytes from the console never abort
/// the caller. Times out with `Error::Timeout` when the completion marker is
/// not seen.
pub async fn run_command(
    serial: &mut dyn SerialConsole,
    command: &str,
    timeout: Duration,
) -> Result<CommandOutput> {
    let seq = NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let framed = format!(
        "{}; printf '%s_%s=%s%s\\n' {} {} \"$?\" __END",
        command, RC_PREFIX, seq
    );
    let marker = format!("{}_{}=", RC_PREFIX, seq);
    let echo = format!("{} {} ", RC_PREFIX, seq);
    send_line(serial, &framed).await?;

    let body = match serial.read_until(marker.as_bytes(), timeout).await? {
        ReadOutcome::Matched(bytes) => bytes,
        ReadOutcome::TimedOut(bytes) => {
            tracing::debug!(
                command,
                seq,
                output = %String::from_utf8_lossy(&bytes),
                "Console command did not complete"
            );
            return Err(Error::Timeout(timeout));
        }
    };

    let status = serial.read_until(END_MARKER, STATUS_TIMEOUT).await?;
    let exit_code = parse_status(status.bytes()).ok_or_else(|| {
        Error::Serial(format!("malformed completion marker: {}", status.text()))
    })?;

    let body = &body[..body.len() - marker.len()];
    Ok(CommandOutput {
        stdout: strip_echo(&String::from_utf8_lossy(body), &echo),
        stderr: String::new(),
        exit_code,
    })
}

/// Check whether a live shell answers on the console
pub async fn probe_shell(serial: &mut dyn SerialConsole, timeout: Duration) -> bool {
    if drain(serial, Duration::from_millis(500)).await.is_err() {
        return false;
    }
    matches!(run_command(serial, "true", timeout).await, Ok(output) if output.success())
}

/// Wake a console sitting at "Please press Enter to activate this console."
pub async fn poke(serial: &mut dyn SerialConsole, presses: usize, delay: Duration) {
    for _ in 0..presses {
        if let Err(e) = serial.write(LINE_DELIMITER).await {
            tracing::debug!(error = %e, "Console poke failed");
        }
        tokio::time::sleep(delay).await;
    }
}

fn parse_status(bytes: &[u8]) -> Option<i32> {
    let text = String::from_utf8_lossy(bytes);
    let digits = text.trim_end_matches("__END").trim();
    digits.parse().ok()
}

/// Drop everything up to the echoed command line, and prompt remnants
fn strip_echo(text: &str, echo: &str) -> String {
    let mut lines: Vec<&str> = text.lines().collect();
    if let Some(pos) = lines.iter().rposition(|l| l.contains(echo)) {
        lines.drain(..=pos);
    }
    lines
        .into_iter()
        .map(|l| l.trim_end_matches('\r'))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
