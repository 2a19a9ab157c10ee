//! Logging and tracing configuration
//!
//! Logs go to stderr so stdout stays clean for `--json` output. A session log
//! file in the data directory can be enabled for long recovery runs.

use std::path::PathBuf;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use super::paths;

/// Default filter when `RUST_LOG` is unset
const DEFAULT_FILTER: &str = "dutctl=info,warn";

/// Initialize tracing for the CLI (stderr logging)
///
/// Logs are controlled by the `RUST_LOG` environment variable.
/// Default level is INFO for this crate, WARN for dependencies.
pub fn init_cli(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("dutctl=debug,warn")
        } else {
            EnvFilter::new(DEFAULT_FILTER)
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .init();
}

/// Initialize tracing with an additional session log file
///
/// The file lives at `<data dir>/logs/session.log` and records spans with
/// full detail. Falls back to stderr-only logging when the file cannot be
/// opened. Returns the log file path on success.
pub fn init_with_file(verbose: bool) -> Option<PathBuf> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("dutctl=trace,info")
        } else {
            EnvFilter::new("dutctl=debug,info")
        }
    });

    let log_file = paths::log_dir().and_then(|dir| {
        std::fs::create_dir_all(&dir).ok()?;
        Some(dir.join("session.log"))
    });

    if let Some(path) = &log_file {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                let file_layer = fmt::layer()
                    .with_writer(file)
                    .with_ansi(false)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);

                let stderr_layer = fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .compact();

                tracing_subscriber::registry()
                    .with(filter)
                    .with(file_layer)
                    .with(stderr_layer)
                    .init();

                return Some(path.clone());
            }
            Err(e) => {
                eprintln!("Warning: Could not open log file: {}", e);
            }
        }
    }

    // Fallback: stderr only
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();

    None
}
