use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unknown embedding model: {name}")]
    ModelNotFound { name: String },

    #[error("no embedding model produces {width}-dimensional vectors")]
    NoCandidate { width: usize },

    #[error("invalid data: {0}")]
    InvalidData(String),
}

pub type Result<T> = std::result::Result<T, Error>;
