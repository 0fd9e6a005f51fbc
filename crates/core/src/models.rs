use crate::error::IngestError;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Pdf,
    Docx,
}

impl DocumentKind {
    /// Resolves the document kind from the file extension, case-insensitively.
    pub fn from_path(path: &Path) -> Result<Self, IngestError> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "pdf" => Ok(Self::Pdf),
            "docx" => Ok(Self::Docx),
            _ => Err(IngestError::UnsupportedFormat { extension }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
        }
    }
}

/// One ordered unit of extracted text. PDFs produce one unit per page,
/// DOCX files a single unit without a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextUnit {
    pub text: String,
    pub page: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkMetadata {
    pub source: String,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(rename = "type")]
    pub kind: DocumentKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chunk {
    pub text: String,
    pub metadata: ChunkMetadata,
}

impl Chunk {
    pub fn source(&self) -> &str {
        &self.metadata.source
    }

    pub fn page(&self) -> Option<u32> {
        self.metadata.page
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    pub text: String,
    pub source: String,
    pub page: Option<u32>,
    pub kind: DocumentKind,
    pub relevance_score: f64,
}

impl SearchResult {
    pub fn from_chunk(chunk: &Chunk, distance: f32) -> Self {
        Self {
            text: chunk.text.clone(),
            source: chunk.metadata.source.clone(),
            page: chunk.metadata.page,
            kind: chunk.metadata.kind,
            relevance_score: relevance_score(distance),
        }
    }
}

/// Maps a squared Euclidean distance into (0, 1], higher meaning closer.
pub fn relevance_score(distance: f32) -> f64 {
    let distance = f64::from(distance.max(0.0));
    1.0 / (1.0 + distance)
}
