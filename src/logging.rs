// src/logging.rs

//! Tracing subscriber setup
//!
//! A console layer and an optional rolling file layer share one `EnvFilter`.
//! `RUST_LOG` overrides the configured level when set.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::layer::{Identity, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::{FileLogConfig, LogFormat, LogRotation, LoggingConfig};
use crate::error::{Error, Result, ResultExt};

/// Keeps the non-blocking file writer alive; drop it last on shutdown
#[derive(Debug, Default)]
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

impl LoggingGuard {
    pub fn has_file_output(&self) -> bool {
        self._file_guard.is_some()
    }
}

fn build_filter(level: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level)
            .map_err(|e| Error::config(format!("Invalid log level '{}': {}", level, e))),
    }
}

fn console_layer<S>(config: &LoggingConfig) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    if !config.console.enabled {
        return Identity::new().boxed();
    }

    let base = fmt::layer()
        .with_ansi(config.console.colored)
        .with_target(true);

    match config.format {
        LogFormat::Json => base.json().boxed(),
        LogFormat::Pretty => base.pretty().boxed(),
        LogFormat::Compact => base.compact().boxed(),
    }
}

fn file_layer<S>(
    file_config: &FileLogConfig,
    format: LogFormat,
) -> (Box<dyn Layer<S> + Send + Sync>, WorkerGuard)
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let directory = &file_config.directory;
    let file_name = &file_config.file_name;
    let appender = match file_config.rotation {
        LogRotation::Hourly => rolling::hourly(directory, file_name),
        LogRotation::Daily => rolling::daily(directory, file_name),
        LogRotation::Never => rolling::never(directory, file_name),
    };

    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    let base = fmt::layer().with_ansi(false).with_writer(non_blocking);

    let layer = match format {
        LogFormat::Json => base.json().boxed(),
        LogFormat::Pretty => base.pretty().boxed(),
        LogFormat::Compact => base.compact().boxed(),
    };

    (layer, guard)
}

/// Installs the global subscriber
///
/// Fails when a global subscriber is already set or the level does not parse.
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingGuard> {
    let filter = build_filter(&config.level)?;

    let (file, guard) = match &config.file {
        Some(file_config) => {
            std::fs::create_dir_all(&file_config.directory).with_context(|| {
                format!(
                    "Failed to create log directory {}",
                    file_config.directory.display()
                )
            })?;
            let (layer, guard) = file_layer(file_config, config.format);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    Registry::default()
        .with(filter)
        .with(console_layer(config))
        .with(file)
        .try_init()
        .map_err(|e| Error::config(format!("Failed to install tracing subscriber: {}", e)))?;

    Ok(LoggingGuard { _file_guard: guard })
}
