use std::path::PathBuf;

use burn::record::RecorderError;
use kiln_config::ConfigError;
use kiln_core::ModelError;
use kiln_data::DataError;

#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error("checkpoint record error: {0}")]
    Record(#[from] RecorderError),
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid checkpoint state {path}: {message}")]
    State { path: PathBuf, message: String },
    #[error("no complete checkpoint found at {0}")]
    NoCheckpoint(PathBuf),
    #[error("checkpoint {0} is incomplete (missing optimizer or state file)")]
    IncompleteCheckpoint(PathBuf),
    #[error("invalid learning-rate schedule: {0}")]
    Schedule(String),
    #[error("no training device available")]
    NoDevice,
    #[error("{0}")]
    Callback(String),
}

impl TrainError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
