use crate::embeddings::Embedder;
use crate::models::DocumentKind;
use crate::orchestrator::RetrievalManager;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

/// Recursively lists supported documents under `folder`, sorted by path.
pub fn discover_documents(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        if DocumentKind::from_path(entry.path()).is_ok() {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

/// Expands directories into the documents they contain; plain paths are
/// kept as given so unsupported files are reported rather than ignored.
pub fn expand_inputs(inputs: &[PathBuf]) -> Vec<PathBuf> {
    inputs
        .iter()
        .flat_map(|input| {
            if input.is_dir() {
                discover_documents(input)
            } else {
                vec![input.clone()]
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestedFile {
    pub path: PathBuf,
    pub chunks: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestionReport {
    pub ingested: Vec<IngestedFile>,
    pub skipped: Vec<SkippedFile>,
}

impl IngestionReport {
    pub fn total_chunks(&self) -> usize {
        self.ingested.iter().map(|file| file.chunks).sum()
    }
}

/// Ingests each path in turn. A failing file is recorded in the report and
/// the batch moves on.
pub fn ingest_paths<E: Embedder>(
    manager: &mut RetrievalManager<E>,
    paths: &[PathBuf],
) -> IngestionReport {
    let mut report = IngestionReport::default();

    for path in paths {
        match manager.ingest(path) {
            Ok(chunks) => report.ingested.push(IngestedFile {
                path: path.clone(),
                chunks,
            }),
            Err(error) => {
                warn!(path = %path.display(), %error, "skipping document");
                report.skipped.push(SkippedFile {
                    path: path.clone(),
                    reason: error.to_string(),
                });
            }
        }
    }

    info!(
        files = paths.len(),
        skipped = report.skipped.len(),
        chunks = report.total_chunks(),
        "batch ingestion finished"
    );
    report
}
