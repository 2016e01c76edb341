pub mod logging;
pub mod version;

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Log path `{0}` has no file name")]
    NoFileName(PathBuf),

    #[error("Failed to create rolling file appender for `{path}`: {source}")]
    Appender {
        path: PathBuf,
        #[source]
        source: tracing_appender::rolling::InitError,
    },
}
