//! Log policy
//!
//! Installs the global subscriber: compact output on stderr plus, when a
//! state directory is known, a daily-rotated file next to it. The file
//! writer is non-blocking; [`LogPolicy::shutdown`] flushes it within a
//! deadline.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "meshd.log";

/// Filter directive for a `--verbose` level
pub fn level_for(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Owns the file writer; dropping it without `shutdown` still flushes
#[derive(Debug, Default)]
pub struct LogPolicy {
    guard: Option<WorkerGuard>,
    file_dir: Option<PathBuf>,
}

impl LogPolicy {
    /// Install the global subscriber. `RUST_LOG` overrides `verbose`.
    pub fn init(verbose: u8, log_dir: Option<&Path>) -> Result<Self> {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level_for(verbose)));

        let mut file_error = None;
        let (file_layer, guard, file_dir) = match log_dir {
            Some(dir) => match std::fs::create_dir_all(dir) {
                Ok(()) => {
                    let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
                    let (writer, guard) = tracing_appender::non_blocking(appender);
                    let layer = fmt::layer().with_ansi(false).with_writer(writer);
                    (Some(layer), Some(guard), Some(dir.to_path_buf()))
                }
                Err(e) => {
                    file_error = Some(format!("creating log dir {}: {}", dir.display(), e));
                    (None, None, None)
                }
            },
            None => (None, None, None),
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .compact()
                    .with_writer(std::io::stderr),
            )
            .with(file_layer)
            .try_init()
            .context("installing log subscriber")?;

        if let Some(e) = file_error {
            warn!("File logging disabled: {}", e);
        }
        if let Some(dir) = &file_dir {
            debug!("Logging to {}", dir.display());
        }
        Ok(Self { guard, file_dir })
    }

    /// Policy that owns nothing, for when logging is set up elsewhere
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn file_dir(&self) -> Option<&Path> {
        self.file_dir.as_deref()
    }

    /// Flush buffered lines, giving up after `deadline`.
    ///
    /// Returns whether the flush completed in time.
    pub fn shutdown(mut self, deadline: Duration) -> bool {
        let Some(guard) = self.guard.take() else {
            return true;
        };
        let (tx, rx) = crossbeam_channel::bounded(1);
        let spawned = std::thread::Builder::new()
            .name("log-flush".to_string())
            .spawn(move || {
                // Dropping the guard blocks until the worker drains
                drop(guard);
                let _ = tx.send(());
            });
        match spawned {
            Ok(_) => rx.recv_timeout(deadline).is_ok(),
            Err(_) => false,
        }
    }
}
