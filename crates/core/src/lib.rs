pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
#[cfg(test)]
mod fixtures;
pub mod generation;
pub mod index;
pub mod ingest;
pub mod models;
pub mod orchestrator;
pub mod session;
pub mod store;
pub mod traits;

pub use chunking::{clean_text, split_text, ChunkingConfig};
pub use config::{CorruptionPolicy, RetrievalConfig, DEFAULT_DATA_DIR, DEFAULT_EMBEDDING_MODEL};
#[cfg(feature = "fastembed")]
pub use embeddings::SentenceEmbedder;
pub use embeddings::{embed_in_batches, embedder_from_config, Embedder, Embedding, HashingEmbedder};
pub use error::{GenerationError, IngestError, RetrievalError};
pub use extractor::{extract_document, DocumentExtractor, DocxExtractor, PdfExtractor};
pub use generation::{ExtractiveGenerator, GeminiGenerator};
pub use index::{Neighbor, VectorIndex};
pub use ingest::{discover_documents, expand_inputs, ingest_paths, IngestionReport, SkippedFile};
pub use models::{Chunk, ChunkMetadata, DocumentKind, SearchResult, TextUnit};
pub use orchestrator::RetrievalManager;
pub use session::{ask, retrieve, Answer, ChatMessage, ChatSession, Retrieved, Role, NO_CONTEXT_ANSWER};
pub use store::{ChunkStore, LoadOutcome};
pub use traits::AnswerGenerator;
