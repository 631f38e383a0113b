//! `tracing` setup shared by the three binaries.
//!
//! Events go to stderr and to a plain-text log file opened in append mode.
//! Keep the returned guard alive for the whole process or buffered lines
//! are lost on exit.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const CLI_LOG_FILE: &str = "output_web_runner.log";
pub const SERVER_LOG_FILE: &str = "web_runner_server.log";

const DEFAULT_FILTER: &str = "info,headless_chrome=warn,tungstenite=warn";

pub fn init_logging(log_file: impl AsRef<Path>) -> Result<WorkerGuard> {
    let log_file = log_file.as_ref();
    let dir = match log_file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => Path::new(".").to_path_buf(),
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create log directory: {}", dir.display()))?;
    let file_name = log_file
        .file_name()
        .with_context(|| format!("log path has no file name: {}", log_file.display()))?;

    let appender = rolling::never(&dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| anyhow::anyhow!("tracing setup failed: {e}"))?;

    Ok(guard)
}
