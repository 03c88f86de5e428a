use ffdispatch::core::io::xyz::XyzError;
use ffdispatch::engine::error::DispatchError;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Malformed configuration file '{path}': {source}", path = path.display())]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Cannot read configuration frame from '{path}': {source}", path = path.display())]
    Frame {
        path: PathBuf,
        #[source]
        source: XyzError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    Argument(String),

    /// Failures of process-wide setup: logger, error hooks, thread pool.
    #[error(transparent)]
    Setup(#[from] anyhow::Error),
}
