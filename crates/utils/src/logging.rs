//! provides logging helpers

use std::path::Path;

use tracing::Subscriber;
use tracing_appender::non_blocking::NonBlocking;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

use crate::LoggingError;

/// Environment variable holding the path of the application log file.
/// When unset, logs go to stderr.
pub const LOG_PATH_ENV_VAR: &str = "LOG_PATH";

/// A formatting layer together with the guard that keeps its writer alive.
pub struct FmtLayer<S> {
    pub layer: Box<dyn Layer<S> + Send + Sync + 'static>,
    pub guard: Option<WorkerGuard>,
}

/// Creates a non-blocking writer for a daily rotated file.
///
/// The parent directory is used as the log directory and the file name as the
/// prefix of the rotated files.
pub fn rolling_writer(
    path: &Path,
    max_files: usize,
) -> Result<(NonBlocking, WorkerGuard), LoggingError> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| LoggingError::NoFileName(path.to_path_buf()))?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(file_name)
        .max_log_files(max_files)
        .build(dir)
        .map_err(|source| LoggingError::Appender {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(tracing_appender::non_blocking(appender))
}

/// Builds the fmt layer for application logs: stderr by default, a rotated
/// file when `log_path` is given.
pub fn get_fmt_layer<S>(log_path: Option<&Path>) -> Result<FmtLayer<S>, LoggingError>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    match log_path {
        None => Ok(FmtLayer {
            layer: layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .boxed(),
            guard: None,
        }),
        Some(path) => {
            let (writer, guard) = rolling_writer(path, 7)?;
            Ok(FmtLayer {
                layer: layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(true)
                    .boxed(),
                guard: Some(guard),
            })
        }
    }
}

/// initiate the global tracing subscriber
pub fn init() {
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();

    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter);

    registry().with(fmt_layer).init();
}
