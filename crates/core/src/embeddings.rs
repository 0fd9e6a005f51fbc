use crate::config::RetrievalConfig;
use crate::error::RetrievalError;
use tracing::debug;

pub const DEFAULT_HASHING_DIMENSIONS: usize = 128;
pub const HASHING_MODEL_PREFIX: &str = "hashing-trigram";

pub type Embedding = Vec<f32>;

/// Turns texts into fixed-dimension vectors. Implementations must be
/// deterministic: the same text always yields the same vector.
pub trait Embedder: Send {
    fn model_name(&self) -> &str;
    fn dimension(&self) -> usize;
    fn embed(&mut self, texts: &[String]) -> Result<Vec<Embedding>, RetrievalError>;
}

impl<E: Embedder + ?Sized> Embedder for Box<E> {
    fn model_name(&self) -> &str {
        (**self).model_name()
    }

    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn embed(&mut self, texts: &[String]) -> Result<Vec<Embedding>, RetrievalError> {
        (**self).embed(texts)
    }
}

/// Character trigram feature hashing into an L2-normalized vector. Needs no
/// model download, which makes it the offline and test backend.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
    name: String,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        let dimensions = dimensions.max(1);
        Self {
            dimensions,
            name: format!("{HASHING_MODEL_PREFIX}-{dimensions}"),
        }
    }

    fn embed_one(&self, text: &str) -> Embedding {
        let mut vector = vec![0f32; self.dimensions];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let mut hash = 1469598103934665603u64;
            for c in window {
                let mut buffer = [0u8; 4];
                for byte in c.encode_utf8(&mut buffer).bytes() {
                    hash ^= byte as u64;
                    hash = hash.wrapping_mul(1099511628211);
                }
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_HASHING_DIMENSIONS)
    }
}

impl Embedder for HashingEmbedder {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn dimension(&self) -> usize {
        self.dimensions
    }

    fn embed(&mut self, texts: &[String]) -> Result<Vec<Embedding>, RetrievalError> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }
}

#[cfg(feature = "fastembed")]
pub use sentence::SentenceEmbedder;

#[cfg(feature = "fastembed")]
mod sentence {
    use super::{Embedder, Embedding};
    use crate::error::RetrievalError;
    use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
    use std::path::Path;
    use tracing::info;

    /// Pretrained sentence-embedding model run locally through ONNX.
    pub struct SentenceEmbedder {
        model: TextEmbedding,
        model_id: String,
        dimension: usize,
    }

    impl SentenceEmbedder {
        /// Loads the model and probes it once so that a broken download or an
        /// unknown identifier fails here rather than on first use.
        pub fn new(model_id: &str, cache_dir: Option<&Path>) -> Result<Self, RetrievalError> {
            let resolved = resolve_model(model_id)?;
            let mut options = InitOptions::new(resolved).with_show_download_progress(true);
            if let Some(dir) = cache_dir {
                options = options.with_cache_dir(dir.to_path_buf());
            }

            let mut model = TextEmbedding::try_new(options).map_err(|error| {
                RetrievalError::Embedding(format!("failed to load model {model_id}: {error}"))
            })?;

            let probe = model
                .embed(vec!["dimension probe"], None)
                .map_err(|error| RetrievalError::Embedding(error.to_string()))?;
            let dimension = probe
                .first()
                .map(Vec::len)
                .filter(|dimension| *dimension > 0)
                .ok_or_else(|| {
                    RetrievalError::Embedding(format!("model {model_id} returned no embedding"))
                })?;

            info!(model = model_id, dimension, "embedding model loaded");
            Ok(Self {
                model,
                model_id: model_id.to_string(),
                dimension,
            })
        }
    }

    impl Embedder for SentenceEmbedder {
        fn model_name(&self) -> &str {
            &self.model_id
        }

        fn dimension(&self) -> usize {
            self.dimension
        }

        fn embed(&mut self, texts: &[String]) -> Result<Vec<Embedding>, RetrievalError> {
            self.model
                .embed(texts.to_vec(), None)
                .map_err(|error| RetrievalError::Embedding(error.to_string()))
        }
    }

    fn resolve_model(model_id: &str) -> Result<EmbeddingModel, RetrievalError> {
        let short_name = model_id.rsplit('/').next().unwrap_or(model_id);
        let known = match short_name.to_ascii_lowercase().as_str() {
            "all-minilm-l6-v2" | "all-minilm-l6-v2-onnx" => Some(EmbeddingModel::AllMiniLML6V2),
            "all-minilm-l12-v2" => Some(EmbeddingModel::AllMiniLML12V2),
            "bge-small-en-v1.5" => Some(EmbeddingModel::BGESmallENV15),
            "bge-base-en-v1.5" => Some(EmbeddingModel::BGEBaseENV15),
            "bge-large-en-v1.5" => Some(EmbeddingModel::BGELargeENV15),
            _ => None,
        };

        if let Some(model) = known {
            return Ok(model);
        }

        TextEmbedding::list_supported_models()
            .into_iter()
            .find(|info| info.model_code.eq_ignore_ascii_case(model_id))
            .map(|info| info.model)
            .ok_or_else(|| RetrievalError::Embedding(format!("unknown embedding model {model_id}")))
    }
}

/// Embeds in sub-batches of `batch_size` to cap peak memory. Output is
/// identical to a single call; row counts and widths are checked.
pub fn embed_in_batches<E: Embedder + ?Sized>(
    embedder: &mut E,
    texts: &[String],
    batch_size: usize,
) -> Result<Vec<Embedding>, RetrievalError> {
    let dimension = embedder.dimension();
    let mut vectors = Vec::with_capacity(texts.len());

    for (batch_no, batch) in texts.chunks(batch_size.max(1)).enumerate() {
        debug!(batch = batch_no, size = batch.len(), "embedding batch");
        let embedded = embedder.embed(batch)?;

        if embedded.len() != batch.len() {
            return Err(RetrievalError::Embedding(format!(
                "model {} returned {} vectors for {} texts",
                embedder.model_name(),
                embedded.len(),
                batch.len()
            )));
        }

        if let Some(bad) = embedded.iter().find(|vector| vector.len() != dimension) {
            return Err(RetrievalError::DimensionMismatch {
                expected: dimension,
                actual: bad.len(),
            });
        }

        vectors.extend(embedded);
    }

    Ok(vectors)
}

fn hashing_dimensions(model_id: &str) -> Option<usize> {
    let rest = model_id.strip_prefix(HASHING_MODEL_PREFIX)?;
    if rest.is_empty() {
        return Some(DEFAULT_HASHING_DIMENSIONS);
    }
    rest.strip_prefix('-')?.parse().ok().filter(|dims| *dims > 0)
}

/// Builds the embedding backend named by `config.embedding_model`.
pub fn embedder_from_config(config: &RetrievalConfig) -> Result<Box<dyn Embedder>, RetrievalError> {
    if let Some(dimensions) = hashing_dimensions(&config.embedding_model) {
        return Ok(Box::new(HashingEmbedder::new(dimensions)));
    }

    #[cfg(feature = "fastembed")]
    {
        let embedder =
            SentenceEmbedder::new(&config.embedding_model, config.model_cache_dir.as_deref())?;
        Ok(Box::new(embedder))
    }

    #[cfg(not(feature = "fastembed"))]
    {
        Err(RetrievalError::Embedding(format!(
            "model {} requires the `fastembed` feature",
            config.embedding_model
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ShortEmbedder;

    impl Embedder for ShortEmbedder {
        fn model_name(&self) -> &str {
            "short"
        }

        fn dimension(&self) -> usize {
            4
        }

        fn embed(&mut self, texts: &[String]) -> Result<Vec<Embedding>, RetrievalError> {
            Ok(texts.iter().skip(1).map(|_| vec![0.0; 4]).collect())
        }
    }

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn embedder_is_deterministic() -> Result<(), RetrievalError> {
        let mut embedder = HashingEmbedder::default();
        let input = texts(&["Hydraulic pressure and flow"]);
        let first = embedder.embed(&input)?;
        let second = embedder.embed(&input)?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn embedder_outputs_expected_length_and_unit_norm() -> Result<(), RetrievalError> {
        let mut embedder = HashingEmbedder::new(32);
        let vectors = embedder.embed(&texts(&["abcdef"]))?;
        assert_eq!(vectors[0].len(), 32);
        let norm = vectors[0].iter().map(|value| value * value).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn batching_matches_single_call() -> Result<(), RetrievalError> {
        let input = texts(&["one", "two", "three", "four", "five"]);
        let mut embedder = HashingEmbedder::default();
        let whole = embedder.embed(&input)?;
        let batched = embed_in_batches(&mut embedder, &input, 2)?;
        assert_eq!(whole, batched);
        Ok(())
    }

    #[test]
    fn short_batches_are_rejected() {
        let result = embed_in_batches(&mut ShortEmbedder, &texts(&["a", "b"]), 8);
        assert!(matches!(result, Err(RetrievalError::Embedding(_))));
    }

    #[test]
    fn hashing_model_ids_are_parsed() {
        assert_eq!(hashing_dimensions("hashing-trigram"), Some(128));
        assert_eq!(hashing_dimensions("hashing-trigram-64"), Some(64));
        assert_eq!(hashing_dimensions("hashing-trigram-0"), None);
        assert_eq!(hashing_dimensions("sentence-transformers/all-MiniLM-L6-v2"), None);
    }

    #[test]
    fn config_selects_hashing_backend() -> Result<(), RetrievalError> {
        let config = RetrievalConfig {
            embedding_model: "hashing-trigram-48".to_string(),
            ..RetrievalConfig::default()
        };
        let embedder = embedder_from_config(&config)?;
        assert_eq!(embedder.dimension(), 48);
        assert_eq!(embedder.model_name(), "hashing-trigram-48");
        Ok(())
    }
}
