//! Logging system configuration and initialization
//!
//! - Console output plus an optional log file (plain or JSON)
//! - `RUST_LOG` overrides the configured level
//! - HTTP/HTML-parser internals capped unless the level is `trace`
//! - An existing log file is rotated aside with a timestamp on startup

#![allow(clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use once_cell::sync::OnceCell;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub use crate::infrastructure::config::LoggingConfig;

// Keeps the non-blocking file writer alive for the whole process
static LOG_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Dependency targets that flood debug output
const NOISY_TARGETS: &[(&str, &str)] = &[
    ("reqwest", "info"),
    ("hyper", "warn"),
    ("hyper_util", "warn"),
    ("h2", "warn"),
    ("rustls", "warn"),
    ("html5ever", "warn"),
    ("selectors", "warn"),
    ("tokio", "info"),
];

/// Effective log directory: configured, or `<output_dir>/logs`
#[must_use]
pub fn log_directory(config: &LoggingConfig, output_dir: &Path) -> PathBuf {
    config
        .log_dir
        .clone()
        .unwrap_or_else(|| output_dir.join("logs"))
}

/// Filter directives for `level` (used when `RUST_LOG` is unset)
pub fn build_filter(level: &str) -> Result<EnvFilter> {
    let mut filter = EnvFilter::try_new(level).with_context(|| format!("Invalid log level: {level}"))?;
    if !level.to_lowercase().contains("trace") {
        for (target, cap) in NOISY_TARGETS {
            let directive = format!("{target}={cap}")
                .parse()
                .with_context(|| format!("Invalid log directive for {target}"))?;
            filter = filter.add_directive(directive);
        }
    }
    Ok(filter)
}

/// Rename an existing log file to `<stem>.<timestamp>.log`
fn rotate_existing_log_file(log_dir: &Path, log_file_name: &str) -> Result<()> {
    let log_file_path = log_dir.join(log_file_name);
    if !log_file_path.exists() {
        return Ok(());
    }

    let metadata = std::fs::metadata(&log_file_path)
        .map_err(|e| anyhow!("Failed to get log file metadata: {}", e))?;
    let file_time = metadata
        .modified()
        .unwrap_or_else(|_| std::time::SystemTime::now());
    let stamp: chrono::DateTime<chrono::Local> = file_time.into();

    let stem = log_file_name.trim_end_matches(".log");
    let rotated = log_dir.join(format!("{}.{}.log", stem, stamp.format("%Y%m%dT%H%M%S")));
    std::fs::rename(&log_file_path, &rotated).map_err(|e| {
        anyhow!(
            "Failed to rotate log file {} to {}: {}",
            log_file_path.display(),
            rotated.display(),
            e
        )
    })?;
    Ok(())
}

/// Initialize logging with the given configuration
///
/// Call once per process; a second call fails because the global subscriber
/// is already set.
pub fn init_logging_with_config(config: &LoggingConfig, log_dir: &Path) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => build_filter(&config.level)?,
    };

    let console_layer = config.console_output.then(|| {
        fmt::layer()
            .with_writer(std::io::stdout)
            .with_target(false)
            .boxed()
    });

    let file_layer = if config.file_output {
        std::fs::create_dir_all(log_dir)
            .map_err(|e| anyhow!("Failed to create log directory {:?}: {}", log_dir, e))?;
        rotate_existing_log_file(log_dir, &config.file_name)?;

        let (writer, guard) = non_blocking(rolling::never(log_dir, &config.file_name));
        LOG_GUARD
            .set(guard)
            .map_err(|_| anyhow!("Logging already initialized"))?;

        let layer = fmt::layer().with_writer(writer).with_ansi(false);
        Some(if config.json_format {
            layer.json().with_target(true).with_thread_ids(true).boxed()
        } else {
            layer.with_target(true).boxed()
        })
    } else {
        None
    };

    if console_layer.is_none() && file_layer.is_none() {
        return Err(anyhow!("No logging output configured"));
    }

    Registry::default()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))?;

    info!("Logging system initialized");
    info!("Log level: {}", config.level);
    if config.file_output {
        info!("Log file: {:?}", log_dir.join(&config.file_name));
    }
    Ok(())
}

/// Log runtime information for diagnostics
pub fn log_system_info() {
    info!("=== FMCSA Enrich ===");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Operating system: {} ({})", std::env::consts::OS, std::env::consts::ARCH);
    if let Ok(current_dir) = std::env::current_dir() {
        info!("Working directory: {:?}", current_dir);
    }
}
