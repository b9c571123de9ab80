use anyhow::{Context, Result};
use std::io;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::{LogFormat, LoggingConfig};

/// Directives appended to the configured level so the HTTP stack stays quiet.
const QUIET_DEPENDENCIES: &str = "hyper=warn,hyper_util=warn,h2=warn,tower=warn";

/// Filter from `RUST_LOG`, or from the configured level when it is unset.
///
/// # Errors
/// When the configured level is not a valid filter directive.
pub fn build_filter(level: &str) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(format!("{level},{QUIET_DEPENDENCIES}"))
        .with_context(|| format!("invalid log level '{level}'"))
}

/// Install the global subscriber: console output plus an optional file sink.
///
/// The returned guard flushes the file writer when dropped; keep it alive for
/// the life of the process.
///
/// # Errors
/// When the level is invalid, the log file cannot be set up, or a global
/// subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = build_filter(&config.level)?;

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    layers.push(match config.format {
        LogFormat::Text => fmt::layer().with_writer(io::stderr).boxed(),
        LogFormat::Json => fmt::layer().json().with_writer(io::stderr).boxed(),
    });

    let mut guard = None;
    if let Some(path) = &config.file {
        let file_name = path
            .file_name()
            .with_context(|| format!("log file '{}' has no file name", path.display()))?;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| std::path::Path::new("."));
        std::fs::create_dir_all(dir)
            .with_context(|| format!("cannot create log directory '{}'", dir.display()))?;

        let appender = tracing_appender::rolling::never(dir, file_name);
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        layers.push(match config.format {
            LogFormat::Text => fmt::layer().with_writer(writer).with_ansi(false).boxed(),
            LogFormat::Json => fmt::layer().json().with_writer(writer).boxed(),
        });
        guard = Some(file_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("a global tracing subscriber is already installed")?;
    Ok(guard)
}

/// Level for `-v` counts: 1 → debug, 2+ → trace; `None` keeps the configured level.
#[must_use]
pub fn verbosity_level(verbose: u8) -> Option<&'static str> {
    match verbose {
        0 => None,
        1 => Some("debug"),
        _ => Some("trace"),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn configured_level_applies_without_rust_log() {
        temp_env::with_var("RUST_LOG", None::<&str>, || {
            let filter = build_filter("debug").unwrap();
            assert!(filter.to_string().contains("debug"));
            assert!(filter.to_string().contains("hyper=warn"));
        });
    }

    #[test]
    fn rust_log_wins_over_configuration() {
        temp_env::with_var("RUST_LOG", Some("weft_runtime=trace"), || {
            let filter = build_filter("info").unwrap();
            assert_eq!(filter.to_string(), "weft_runtime=trace");
        });
    }

    #[test]
    fn invalid_level_is_rejected() {
        temp_env::with_var("RUST_LOG", None::<&str>, || {
            assert!(build_filter("lo=ud=er").is_err());
        });
    }

    #[test]
    fn verbosity_steps() {
        assert_eq!(verbosity_level(0), None);
        assert_eq!(verbosity_level(1), Some("debug"));
        assert_eq!(verbosity_level(4), Some("trace"));
    }
}
