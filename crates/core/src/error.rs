use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unsupported file format: {extension:?}")]
    UnsupportedFormat { extension: String },

    #[error("failed to extract text from {}: {cause}", path.display())]
    Extraction { path: PathBuf, cause: String },

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),
}

impl IngestError {
    pub fn extraction(path: &std::path::Path, cause: impl ToString) -> Self {
        Self::Extraction {
            path: path.to_path_buf(),
            cause: cause.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("persistence error at {}: {cause}", path.display())]
    Persistence { path: PathBuf, cause: String },

    #[error("chunk store holds {chunks} chunks but vector index holds {rows} rows")]
    CorruptionDetected { chunks: usize, rows: usize },

    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("chunk index {index} out of range for store of length {len}")]
    OutOfRange { index: usize, len: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl RetrievalError {
    pub fn persistence(path: &std::path::Path, cause: impl ToString) -> Self {
        Self::Persistence {
            path: path.to_path_buf(),
            cause: cause.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("missing api key: set {0}")]
    MissingApiKey(String),

    #[error("generator returned an empty answer")]
    EmptyAnswer,
}
