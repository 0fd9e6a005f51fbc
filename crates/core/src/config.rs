use crate::chunking::ChunkingConfig;
use crate::error::RetrievalError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_EMBEDDING_MODEL: &str = "sentence-transformers/all-MiniLM-L6-v2";
pub const DEFAULT_DATA_DIR: &str = "data/processed";
pub const CHUNKS_FILE_NAME: &str = "chunks.json";
pub const VECTORS_FILE_NAME: &str = "vectors.bin";

/// What to do when persisted state cannot be trusted at startup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CorruptionPolicy {
    /// Quarantine the unreadable file, log loudly and start empty.
    /// Misaligned structures are truncated to the shorter length.
    #[default]
    FailSoft,
    /// Refuse to start.
    FailFast,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalConfig {
    pub embedding_model: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub top_k: usize,
    pub data_dir: PathBuf,
    pub embed_batch_size: usize,
    pub corruption_policy: CorruptionPolicy,
    pub model_cache_dir: Option<PathBuf>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            chunk_size: 1_000,
            chunk_overlap: 200,
            top_k: 5,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            embed_batch_size: 32,
            corruption_policy: CorruptionPolicy::FailSoft,
            model_cache_dir: None,
        }
    }
}

impl RetrievalConfig {
    pub fn validate(&self) -> Result<(), RetrievalError> {
        self.chunking().validate()?;
        if self.top_k == 0 {
            return Err(RetrievalError::InvalidArgument(
                "top_k must be greater than zero".to_string(),
            ));
        }
        if self.embed_batch_size == 0 {
            return Err(RetrievalError::InvalidArgument(
                "embed_batch_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn chunking(&self) -> ChunkingConfig {
        ChunkingConfig {
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
        }
    }

    pub fn chunks_path(&self) -> PathBuf {
        self.data_dir.join(CHUNKS_FILE_NAME)
    }

    pub fn vectors_path(&self) -> PathBuf {
        self.data_dir.join(VECTORS_FILE_NAME)
    }
}
