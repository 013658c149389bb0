use std::path::PathBuf;

use burn::record::RecorderError;

/// Errors that can occur when building, loading or saving a model.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid model metadata in {path}: {message}")]
    Metadata { path: PathBuf, message: String },
    #[error("failed to read or write weights: {0}")]
    Record(#[from] RecorderError),
    #[error("vocabulary has {found} tokens but the model expects {expected}")]
    VocabMismatch { expected: usize, found: usize },
    #[error("token '{0}' is already in the vocabulary")]
    DuplicateToken(String),
    #[error("unknown token '{0}'")]
    UnknownToken(String),
    #[error("accelerator '{0}' is not available in this build")]
    UnsupportedAccelerator(String),
}

impl ModelError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
