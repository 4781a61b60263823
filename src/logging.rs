//! Logging initialization
//!
//! Console output in the configured format, optionally teed to a file
//! through a non-blocking appender. `RUST_LOG` overrides the level.

use crate::config::{LogFormat, LogLevel};
use crate::{Error, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Build the env filter for `level`, honouring `RUST_LOG` first
pub fn env_filter(level: LogLevel) -> EnvFilter {
    let level: tracing::Level = level.into();
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},leafline={}", level, level).to_lowercase())
    })
}

fn console_layer(format: LogFormat) -> BoxedLayer {
    match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        LogFormat::Plain => fmt::layer().with_target(false).boxed(),
    }
}

/// Install the global subscriber
///
/// The returned guard must live as long as file logging is wanted.
pub fn init_logging(
    level: LogLevel,
    format: LogFormat,
    file: Option<&Path>,
) -> Result<Option<WorkerGuard>> {
    let mut layers: Vec<BoxedLayer> = vec![console_layer(format)];
    let mut guard = None;

    if let Some(path) = file {
        let directory = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let file_name = path
            .file_name()
            .ok_or_else(|| Error::config(format!("Invalid log file: {}", path.display())))?;

        std::fs::create_dir_all(directory)?;
        let appender = tracing_appender::rolling::never(directory, file_name);
        let (writer, worker_guard) = tracing_appender::non_blocking(appender);
        guard = Some(worker_guard);

        layers.push(
            fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(writer)
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter(level))
        .try_init()
        .map_err(|e| Error::internal("logging", e.to_string()))?;

    Ok(guard)
}
