use crate::chunking::{clean_text, split_text};
use crate::config::{CorruptionPolicy, RetrievalConfig};
use crate::embeddings::{embed_in_batches, Embedder};
use crate::error::{IngestError, RetrievalError};
use crate::extractor::extract_document;
use crate::index::VectorIndex;
use crate::models::{Chunk, ChunkMetadata, DocumentKind, SearchResult, TextUnit};
use crate::store::{preserve_copy, ChunkStore, LoadOutcome};
use std::fs;
use std::path::Path;
use tracing::{debug, error, info, warn};

/// Owns the chunk store and the vector index and keeps them aligned: chunk
/// `i` always describes vector row `i`. Run at most one manager per data
/// directory; there is no cross-process locking.
pub struct RetrievalManager<E: Embedder> {
    config: RetrievalConfig,
    embedder: E,
    index: VectorIndex,
    store: ChunkStore,
    notices: Vec<String>,
}

impl<E: Embedder> RetrievalManager<E> {
    /// Opens (or creates) the persisted pair under `config.data_dir` and
    /// verifies that they agree before accepting any work.
    pub fn open(config: RetrievalConfig, embedder: E) -> Result<Self, RetrievalError> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)
            .map_err(|error| RetrievalError::persistence(&config.data_dir, error))?;

        let policy = config.corruption_policy;
        let (index, index_outcome) =
            VectorIndex::load_or_create(config.vectors_path(), embedder.dimension(), policy)?;
        let (store, store_outcome) = ChunkStore::load(config.chunks_path(), policy)?;

        let mut manager = Self {
            config,
            embedder,
            index,
            store,
            notices: Vec::new(),
        };
        manager.note_outcome("vector index", &index_outcome);
        manager.note_outcome("chunk store", &store_outcome);
        manager.reconcile_at_startup()?;

        info!(
            data_dir = %manager.config.data_dir.display(),
            model = manager.embedder.model_name(),
            dimension = manager.index.dimension(),
            chunks = manager.store.len(),
            "retrieval manager ready"
        );
        Ok(manager)
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub fn embedder(&self) -> &E {
        &self.embedder
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn rows(&self) -> usize {
        self.index.rows()
    }

    pub fn dimension(&self) -> usize {
        self.index.dimension()
    }

    pub fn chunks(&self) -> &[Chunk] {
        self.store.chunks()
    }

    pub fn sources(&self) -> Vec<(String, usize)> {
        self.store.sources()
    }

    /// Conditions found while opening that an operator should know about.
    pub fn notices(&self) -> &[String] {
        &self.notices
    }

    /// Ingests the file at `path`, recording its file name as the source.
    pub fn ingest(&mut self, path: &Path) -> Result<usize, RetrievalError> {
        let source = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| IngestError::MissingFileName(path.display().to_string()))?
            .to_string();
        self.ingest_as(path, &source)
    }

    /// Ingests the file at `path` under the user-facing name `source`, for
    /// callers that stage uploads under temporary names. Returns the number
    /// of chunks added; zero leaves both structures untouched.
    ///
    /// Refuses to run while the store and index disagree, which can only
    /// happen after a failed rollback; reopening the manager reconciles them.
    pub fn ingest_as(&mut self, path: &Path, source: &str) -> Result<usize, RetrievalError> {
        self.ensure_aligned()?;
        info!(path = %path.display(), source, "ingesting document");

        let (kind, units) = extract_document(path).map_err(|error| {
            warn!(path = %path.display(), source, %error, "extraction failed");
            error
        })?;
        let chunks = self.build_chunks(source, kind, &units);

        if chunks.is_empty() {
            warn!(path = %path.display(), source, "no usable text extracted");
            return Ok(0);
        }

        let texts = chunks.iter().map(|chunk| chunk.text.clone()).collect::<Vec<_>>();
        let vectors = embed_in_batches(&mut self.embedder, &texts, self.config.embed_batch_size)
            .map_err(|error| {
                error!(source, chunks = texts.len(), %error, "embedding failed");
                error
            })?;

        let previous_rows = self.index.rows();
        self.index.insert(&vectors).map_err(|error| {
            error!(source, %error, "vector insert failed");
            error
        })?;

        if let Err(append_error) = self.store.append(chunks) {
            error!(source, error = %append_error, "chunk append failed, rolling back vectors");
            if let Err(rollback_error) = self.index.truncate(previous_rows) {
                error!(
                    source,
                    error = %rollback_error,
                    rows = self.index.rows(),
                    chunks = self.store.len(),
                    "vector rollback failed; index and store are misaligned until next startup"
                );
            }
            return Err(append_error);
        }

        self.ensure_aligned()?;
        info!(source, added = vectors.len(), total = self.store.len(), "document ingested");
        Ok(vectors.len())
    }

    /// Returns up to `k` results, best match first. An empty store yields an
    /// empty list rather than an error.
    pub fn query(&mut self, question: &str, k: usize) -> Result<Vec<SearchResult>, RetrievalError> {
        self.ensure_aligned()?;
        if question.trim().is_empty() || k == 0 || self.index.is_empty() {
            debug!(question, k, rows = self.index.rows(), "nothing to search");
            return Ok(Vec::new());
        }

        let query_vector = embed_in_batches(&mut self.embedder, &[question.to_string()], 1)
            .map_err(|error| {
                error!(question, %error, "query embedding failed");
                error
            })?
            .pop()
            .ok_or_else(|| RetrievalError::Embedding("no vector returned for query".to_string()))?;

        let neighbors = self.index.search(&query_vector, k)?;

        let mut results = Vec::with_capacity(k);
        for neighbor in neighbors {
            let Some(row) = neighbor.row else {
                continue;
            };
            if row >= self.store.len() {
                warn!(row, chunks = self.store.len(), "search returned a row with no chunk");
                continue;
            }
            let chunk = self.store.get(row)?;
            results.push(SearchResult::from_chunk(chunk, neighbor.distance));
        }

        info!(question, k, found = results.len(), "query answered");
        Ok(results)
    }

    /// Clears the vector index and the chunk store together.
    pub fn reset(&mut self) -> Result<(), RetrievalError> {
        let index_result = self.index.clear();
        let store_result = self.store.clear();
        index_result.and(store_result).map_err(|error| {
            error!(%error, "reset failed to remove persisted state");
            error
        })?;

        self.ensure_aligned()?;
        info!(data_dir = %self.config.data_dir.display(), "retrieval state cleared");
        Ok(())
    }

    fn build_chunks(&self, source: &str, kind: DocumentKind, units: &[TextUnit]) -> Vec<Chunk> {
        let chunking = self.config.chunking();
        units
            .iter()
            .flat_map(|unit| {
                let cleaned = clean_text(&unit.text);
                split_text(&cleaned, chunking)
                    .into_iter()
                    .map(move |text| Chunk {
                        text,
                        metadata: ChunkMetadata {
                            source: source.to_string(),
                            page: unit.page,
                            kind,
                        },
                    })
            })
            .collect()
    }

    fn ensure_aligned(&self) -> Result<(), RetrievalError> {
        let (chunks, rows) = (self.store.len(), self.index.rows());
        if chunks != rows {
            error!(chunks, rows, "chunk store and vector index are misaligned");
            return Err(RetrievalError::CorruptionDetected { chunks, rows });
        }
        Ok(())
    }

    fn reconcile_at_startup(&mut self) -> Result<(), RetrievalError> {
        let (chunks, rows) = (self.store.len(), self.index.rows());
        if chunks == rows {
            return Ok(());
        }

        if self.config.corruption_policy == CorruptionPolicy::FailFast {
            return self.ensure_aligned();
        }

        let keep = chunks.min(rows);
        let longer = if chunks > rows {
            self.config.chunks_path()
        } else {
            self.config.vectors_path()
        };
        let preserved = preserve_copy(&longer)?;
        error!(
            chunks,
            rows,
            keep,
            preserved = ?preserved,
            "chunk store and vector index disagree at startup; truncating the longer one"
        );
        self.store.truncate(keep)?;
        self.index.truncate(keep)?;

        let copied = preserved
            .map(|path| format!(" (previous contents copied to {})", path.display()))
            .unwrap_or_default();
        self.notices.push(format!(
            "repaired misalignment: {chunks} chunks vs {rows} vectors, kept the first {keep}{copied}"
        ));
        self.ensure_aligned()
    }

    fn note_outcome(&mut self, structure: &str, outcome: &LoadOutcome) {
        if let LoadOutcome::Recovered {
            reason,
            quarantined,
        } = outcome
        {
            let moved = quarantined
                .as_ref()
                .map(|path| format!(" (moved to {})", path.display()))
                .unwrap_or_default();
            self.notices
                .push(format!("{structure} was unreadable and started empty{moved}: {reason}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::{Embedding, HashingEmbedder};
    use crate::fixtures::{write_docx, write_pdf};
    use std::path::PathBuf;
    use tempfile::{tempdir, TempDir};

    struct OfflineEmbedder;

    impl Embedder for OfflineEmbedder {
        fn model_name(&self) -> &str {
            "offline"
        }

        fn dimension(&self) -> usize {
            DIMENSION
        }

        fn embed(&mut self, _texts: &[String]) -> Result<Vec<Embedding>, RetrievalError> {
            Err(RetrievalError::Embedding("model offline".to_string()))
        }
    }

    const DIMENSION: usize = 64;

    fn config_in(dir: &Path, policy: CorruptionPolicy) -> RetrievalConfig {
        RetrievalConfig {
            embedding_model: format!("hashing-trigram-{DIMENSION}"),
            data_dir: dir.join("data"),
            corruption_policy: policy,
            ..RetrievalConfig::default()
        }
    }

    fn open(dir: &Path) -> Result<RetrievalManager<HashingEmbedder>, RetrievalError> {
        RetrievalManager::open(
            config_in(dir, CorruptionPolicy::FailFast),
            HashingEmbedder::new(DIMENSION),
        )
    }

    fn docx(
        dir: &TempDir,
        name: &str,
        paragraphs: &[&str],
    ) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let path = dir.path().join(name);
        write_docx(&path, paragraphs)?;
        Ok(path)
    }

    #[test]
    fn docx_round_trip_returns_source_without_page() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = docx(&dir, "colors.docx", &["The sky is blue. The grass is green."])?;
        let mut manager = open(dir.path())?;

        assert_eq!(manager.ingest(&path)?, 1);
        let results = manager.query("What color is the sky?", 5)?;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].text, "The sky is blue. The grass is green.");
        assert_eq!(results[0].source, "colors.docx");
        assert_eq!(results[0].page, None);
        assert_eq!(results[0].kind, DocumentKind::Docx);
        assert!(results[0].relevance_score > 0.0 && results[0].relevance_score <= 1.0);
        Ok(())
    }

    #[test]
    fn pdf_chunks_reference_only_non_blank_pages() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("report.pdf");
        write_pdf(&path, &["Pumps move fluid", "", "Valves control flow"])?;
        let mut manager = open(dir.path())?;

        let added = manager.ingest(&path)?;

        assert_eq!(added, 2);
        let pages: Vec<_> = manager.chunks().iter().map(Chunk::page).collect();
        assert_eq!(pages, vec![Some(1), Some(3)]);
        assert!(manager.chunks().iter().all(|chunk| chunk.source() == "report.pdf"));
        Ok(())
    }

    #[test]
    fn small_index_returns_only_real_matches_nearest_first() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let first = docx(&dir, "sky.docx", &["The sky is blue on a clear day."])?;
        let second = docx(&dir, "soil.docx", &["Clay soil holds water for a long time."])?;
        let mut manager = open(dir.path())?;
        manager.ingest(&first)?;
        manager.ingest(&second)?;

        let results = manager.query("The sky is blue", 5)?;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].source, "sky.docx");
        assert!(results[0].relevance_score >= results[1].relevance_score);
        Ok(())
    }

    #[test]
    fn reset_empties_both_structures() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = docx(&dir, "colors.docx", &["The sky is blue."])?;
        let mut manager = open(dir.path())?;
        manager.ingest(&path)?;

        manager.reset()?;

        assert!(manager.query("anything", 5)?.is_empty());
        assert_eq!(manager.len(), 0);
        assert_eq!(manager.rows(), 0);
        assert!(!manager.config().chunks_path().exists());
        assert!(!manager.config().vectors_path().exists());
        Ok(())
    }

    #[test]
    fn empty_document_adds_nothing() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let seeded = docx(&dir, "seed.docx", &["Existing content."])?;
        let empty = docx(&dir, "empty.docx", &["", "  "])?;
        let mut manager = open(dir.path())?;
        manager.ingest(&seeded)?;

        assert_eq!(manager.ingest(&empty)?, 0);
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.rows(), 1);
        Ok(())
    }

    #[test]
    fn failed_ingestions_leave_state_untouched() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let text = dir.path().join("notes.txt");
        fs::write(&text, "plain text")?;
        let broken = dir.path().join("broken.pdf");
        fs::write(&broken, b"%PDF-1.4\n%broken")?;
        let mut manager = open(dir.path())?;

        assert!(matches!(
            manager.ingest(&text),
            Err(RetrievalError::Ingest(IngestError::UnsupportedFormat { .. }))
        ));
        assert!(matches!(
            manager.ingest(&broken),
            Err(RetrievalError::Ingest(IngestError::Extraction { .. }))
        ));
        assert_eq!((manager.len(), manager.rows()), (0, 0));
        Ok(())
    }

    #[test]
    fn embedding_failure_aborts_without_partial_state() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = docx(&dir, "colors.docx", &["The sky is blue."])?;
        let mut manager =
            RetrievalManager::open(config_in(dir.path(), CorruptionPolicy::FailFast), OfflineEmbedder)?;

        assert!(matches!(manager.ingest(&path), Err(RetrievalError::Embedding(_))));
        assert_eq!((manager.len(), manager.rows()), (0, 0));
        assert!(!manager.config().vectors_path().exists());
        Ok(())
    }

    #[test]
    fn failed_chunk_append_rolls_back_vectors() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = docx(&dir, "colors.docx", &["The sky is blue."])?;
        let mut manager = open(dir.path())?;
        fs::create_dir(manager.config().chunks_path())?;

        let result = manager.ingest(&path);

        assert!(matches!(result, Err(RetrievalError::Persistence { .. })));
        assert_eq!((manager.len(), manager.rows()), (0, 0));
        let (persisted, _) = VectorIndex::load_or_create(
            manager.config().vectors_path(),
            DIMENSION,
            CorruptionPolicy::FailFast,
        )?;
        assert_eq!(persisted.rows(), 0);
        Ok(())
    }

    #[test]
    fn ingest_as_records_the_given_source_name() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let staged = docx(&dir, "upload-3f9a.docx", &["Quarterly revenue grew."])?;
        let mut manager = open(dir.path())?;

        manager.ingest_as(&staged, "Q3 report.docx")?;

        assert_eq!(manager.sources(), vec![("Q3 report.docx".to_string(), 1)]);
        Ok(())
    }

    #[test]
    fn reopening_restores_identical_results() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let first = docx(&dir, "a.docx", &["Rivers carry sediment to the sea."])?;
        let second = docx(&dir, "b.docx", &["Glaciers carve valleys over centuries."])?;

        let before = {
            let mut manager = open(dir.path())?;
            manager.ingest(&first)?;
            manager.ingest(&second)?;
            manager.query("How are valleys carved?", 5)?
        };

        let mut reopened = open(dir.path())?;
        assert!(reopened.notices().is_empty());
        assert_eq!(reopened.query("How are valleys carved?", 5)?, before);
        Ok(())
    }

    #[test]
    fn startup_misalignment_is_fatal_or_repaired() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let first = docx(&dir, "a.docx", &["Rivers carry sediment to the sea."])?;
        let second = docx(&dir, "b.docx", &["Glaciers carve valleys over centuries."])?;
        {
            let mut manager = open(dir.path())?;
            manager.ingest(&first)?;
            manager.ingest(&second)?;
        }

        let vectors_path = config_in(dir.path(), CorruptionPolicy::FailFast).vectors_path();
        let (mut index, _) =
            VectorIndex::load_or_create(&vectors_path, DIMENSION, CorruptionPolicy::FailFast)?;
        index.truncate(1)?;

        assert!(matches!(
            open(dir.path()),
            Err(RetrievalError::CorruptionDetected { chunks: 2, rows: 1 })
        ));

        let repaired = RetrievalManager::open(
            config_in(dir.path(), CorruptionPolicy::FailSoft),
            HashingEmbedder::new(DIMENSION),
        )?;
        assert_eq!((repaired.len(), repaired.rows()), (1, 1));
        assert_eq!(repaired.chunks()[0].source(), "a.docx");
        assert_eq!(repaired.notices().len(), 1);
        assert!(repaired.notices()[0].contains("copied to"));
        Ok(())
    }

    #[test]
    fn corrupt_index_recovers_to_empty_pair_when_failing_soft() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = docx(&dir, "a.docx", &["Rivers carry sediment to the sea."])?;
        {
            let mut manager = open(dir.path())?;
            manager.ingest(&path)?;
        }
        let config = config_in(dir.path(), CorruptionPolicy::FailSoft);
        fs::write(config.vectors_path(), b"garbage")?;

        let data_dir = config.data_dir.clone();
        let manager = RetrievalManager::open(config, HashingEmbedder::new(DIMENSION))?;

        assert_eq!((manager.len(), manager.rows()), (0, 0));
        assert_eq!(manager.notices().len(), 2);

        let kept_copies = fs::read_dir(&data_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with("chunks.json.corrupt-"))
            })
            .collect::<Vec<_>>();
        assert_eq!(kept_copies.len(), 1);
        assert!(fs::read_to_string(&kept_copies[0])?.contains("Rivers carry sediment"));
        Ok(())
    }

    #[test]
    fn misaligned_manager_refuses_work_without_touching_disk(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let first = docx(&dir, "a.docx", &["Rivers carry sediment to the sea."])?;
        let second = docx(&dir, "b.docx", &["Glaciers carve valleys over centuries."])?;
        let mut manager = open(dir.path())?;
        manager.ingest(&first)?;

        let orphan = HashingEmbedder::new(DIMENSION).embed(&["orphan row".to_string()])?;
        manager.index.insert(&orphan)?;
        let chunks_before = fs::read(manager.config().chunks_path())?;
        let vectors_before = fs::read(manager.config().vectors_path())?;

        assert!(matches!(
            manager.ingest(&second),
            Err(RetrievalError::CorruptionDetected { chunks: 1, rows: 2 })
        ));
        assert!(matches!(
            manager.query("orphan row", 3),
            Err(RetrievalError::CorruptionDetected { chunks: 1, rows: 2 })
        ));
        assert_eq!((manager.len(), manager.rows()), (1, 2));
        assert_eq!(fs::read(manager.config().chunks_path())?, chunks_before);
        assert_eq!(fs::read(manager.config().vectors_path())?, vectors_before);
        Ok(())
    }

    #[test]
    fn invalid_config_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let config = RetrievalConfig {
            chunk_overlap: 2_000,
            ..config_in(dir.path(), CorruptionPolicy::FailFast)
        };
        assert!(matches!(
            RetrievalManager::open(config, HashingEmbedder::new(DIMENSION)),
            Err(RetrievalError::Ingest(IngestError::InvalidChunkConfig(_)))
        ));

        let config = RetrievalConfig {
            top_k: 0,
            ..config_in(dir.path(), CorruptionPolicy::FailFast)
        };
        assert!(matches!(
            RetrievalManager::open(config, HashingEmbedder::new(DIMENSION)),
            Err(RetrievalError::InvalidArgument(_))
        ));
        Ok(())
    }
}
