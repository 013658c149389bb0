use crate::PURE_FP16_MESSAGE;

/// Errors that can occur when loading or validating a run configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("{}", PURE_FP16_MESSAGE)]
    PureHalfPrecision,
    #[error("no model path given: pass --model_path or set trainer.model_path")]
    MissingModelPath,
    #[error("invalid config: {0}")]
    Invalid(String),
}
