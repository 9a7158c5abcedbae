use thiserror::Error;

/// Errors surfaced by network construction, loss selection, data loading and checkpointing.
#[derive(Debug, Error)]
pub enum UnetError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid region box: {0}")]
    InvalidRegion(String),

    #[error("checkpoint mismatch: {0}")]
    CheckpointMismatch(String),

    #[error("no training data found under {0}")]
    NoTrainingData(String),

    #[error("loss `{0}` is not implemented")]
    UnsupportedLoss(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("recorder error: {0}")]
    Recorder(String),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

impl From<serde_json::Error> for UnetError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for UnetError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, UnetError>;
