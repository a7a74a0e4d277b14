use std::{fs, io, path::PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer as _, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _,
};

use crate::env::{ensure_parent, HarnessEnv};

const DEFAULT_FILTER: &str = "info";

#[derive(Clone, Debug, Default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive; `RUST_LOG` wins when set.
    pub filter: Option<String>,
    pub json: bool,
    /// Also write every event to `~/.interchaintest/logs/<name>`.
    pub log_file_name: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to create log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to install tracing subscriber: {0}")]
    Install(#[from] tracing_subscriber::util::TryInitError),
}

/// Keeps the file writer alive; dropping it flushes buffered log lines.
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Creates `~/.interchaintest/logs/<name>` (truncating it) and returns its path.
pub fn create_log_file(name: &str) -> Result<(fs::File, PathBuf), LoggingError> {
    let path = HarnessEnv::load().default_log_path(name);
    let file = ensure_parent(&path)
        .and_then(|()| fs::File::create(&path))
        .map_err(|source| LoggingError::LogFile {
            path: path.clone(),
            source,
        })?;
    Ok((file, path))
}

pub fn init_logging(settings: &LoggingSettings) -> Result<LoggingGuard, LoggingError> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(settings.filter.as_deref().unwrap_or(DEFAULT_FILTER))
        })
    };

    let stdout_layer = if settings.json {
        fmt::layer().json().with_filter(filter()).boxed()
    } else {
        fmt::layer().with_test_writer().with_filter(filter()).boxed()
    };

    let (file_layer, file_guard) = match &settings.log_file_name {
        Some(name) => {
            let (file, _) = create_log_file(name)?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(filter())
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .try_init()?;

    Ok(LoggingGuard { _file: file_guard })
}

/// Best-effort logging for tests; a second call is a no-op.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        )
        .with_test_writer()
        .try_init();
}
