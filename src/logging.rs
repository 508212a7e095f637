//! Tracing subscriber setup.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "agentmesh.log";

/// Install the global subscriber: a daily log file plus optional stderr output.
///
/// Hold the returned guard until exit; dropping it stops the background
/// file writer.
pub fn init(config: &LoggingConfig) -> Result<(WorkerGuard, PathBuf)> {
    let log_dir = match &config.directory {
        Some(dir) => dir.clone(),
        None => default_log_dir()?,
    };
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = if config.json {
        fmt::layer().json().with_writer(writer).boxed()
    } else {
        fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_thread_ids(true)
            .with_line_number(true)
            .boxed()
    };
    let console_layer = config
        .console
        .then(|| fmt::layer().with_writer(std::io::stderr).with_target(false));

    tracing_subscriber::registry()
        .with(build_filter(config)?)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .context("A global tracing subscriber is already installed")?;

    tracing::debug!(dir = %log_dir.display(), json = config.json, "Logging initialized");
    Ok((guard, log_dir))
}

/// `RUST_LOG` when set, the configured directives otherwise.
fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.trim().is_empty() => parse_filter(&directives),
        _ => parse_filter(&config.filter),
    }
}

fn parse_filter(directives: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(directives).with_context(|| format!("Invalid log filter '{}'", directives))
}

fn default_log_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("com", "agentmesh", "agentmesh")
        .ok_or_else(|| anyhow::anyhow!("Could not determine a data directory for logs"))?;
    Ok(dirs.data_dir().join("logs"))
}

/// Console-only subscriber for tests. Safe to call from every test.
#[cfg(test)]
pub fn init_test() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_test_writer())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        assert!(parse_filter(&LoggingConfig::default().filter).is_ok());
        assert!(parse_filter("warn,agentmesh::bus=trace").is_ok());
    }

    #[test]
    fn test_malformed_filter_rejected() {
        let err = parse_filter("agentmesh=loud").unwrap_err();
        assert!(err.to_string().contains("agentmesh=loud"));
    }
}
