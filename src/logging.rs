//! Tracing setup: a console layer on stderr and the plain-text execution log.
//!
//! The console honours `RUST_LOG` and stays at `warn` otherwise, since the
//! operator-facing progress lines are printed directly. The execution log
//! records at the configured level and always has every remote call.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

pub struct LogOptions<'a> {
    /// Level for the execution log file.
    pub level: &'a str,
    /// Emit console events as JSON lines.
    pub json: bool,
    /// Execution log file; none for commands that do not touch the fleet.
    pub file: Option<PathBuf>,
}

/// `<dir>/upgrade_<network>_<stamp>.log`
pub fn execution_log_path(dir: &Path, network: &str, started: DateTime<Utc>) -> PathBuf {
    dir.join(format!(
        "upgrade_{}_{}.log",
        network,
        started.format("%Y%m%d_%H%M%S")
    ))
}

pub fn init(opts: LogOptions<'_>) -> Result<()> {
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let (plain, json) = if opts.json {
        (
            None,
            Some(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_filter(console_filter),
            ),
        )
    } else {
        (
            Some(
                fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .with_filter(console_filter),
            ),
            None,
        )
    };

    let file_layer = match &opts.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating log directory {}", parent.display()))?;
            }
            let file = File::create(path)
                .with_context(|| format!("creating execution log {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(EnvFilter::new(opts.level)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(plain)
        .with(json)
        .with(file_layer)
        .try_init()
        .context("installing tracing subscriber")?;
    Ok(())
}
