use thiserror::Error;

pub type AdPodResult<T> = Result<T, AdPodError>;

#[derive(Error, Debug)]
pub enum AdPodError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Ad pod validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
