use crate::config::CorruptionPolicy;
use crate::error::RetrievalError;
use crate::models::Chunk;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info};

const STORE_FORMAT_VERSION: u32 = 1;

/// How a persisted structure came to be in memory at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Created,
    Loaded {
        entries: usize,
    },
    /// The persisted file was unusable and the structure started empty.
    Recovered {
        reason: String,
        quarantined: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct PersistedChunksRef<'a> {
    version: u32,
    chunks: &'a [Chunk],
}

#[derive(Deserialize)]
struct PersistedChunks {
    version: u32,
    chunks: Vec<Chunk>,
}

/// Ordered chunk records. Position `i` corresponds to row `i` of the vector
/// index; only the retrieval manager mutates it.
#[derive(Debug)]
pub struct ChunkStore {
    path: PathBuf,
    chunks: Vec<Chunk>,
}

impl ChunkStore {
    pub fn load(
        path: impl Into<PathBuf>,
        policy: CorruptionPolicy,
    ) -> Result<(Self, LoadOutcome), RetrievalError> {
        let path = path.into();

        if !path.exists() {
            info!(path = %path.display(), "no persisted chunk store, starting empty");
            return Ok((
                Self {
                    path,
                    chunks: Vec::new(),
                },
                LoadOutcome::Created,
            ));
        }

        match read_chunks(&path) {
            Ok(chunks) => {
                info!(path = %path.display(), chunks = chunks.len(), "loaded chunk store");
                let entries = chunks.len();
                Ok((Self { path, chunks }, LoadOutcome::Loaded { entries }))
            }
            Err(load_error) if policy == CorruptionPolicy::FailFast => Err(load_error),
            Err(load_error) => {
                let quarantined = quarantine(&path)
                    .map_err(|move_error| {
                        error!(path = %path.display(), error = %move_error, "could not move corrupt chunk store aside");
                    })
                    .ok();
                error!(
                    path = %path.display(),
                    error = %load_error,
                    quarantined = ?quarantined,
                    "chunk store unreadable, starting empty; previously ingested chunks are lost"
                );
                Ok((
                    Self {
                        path,
                        chunks: Vec::new(),
                    },
                    LoadOutcome::Recovered {
                        reason: load_error.to_string(),
                        quarantined,
                    },
                ))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Random access by position. An out-of-range index means the store and
    /// index have diverged, so it is reported instead of skipped.
    pub fn get(&self, index: usize) -> Result<&Chunk, RetrievalError> {
        self.chunks.get(index).ok_or(RetrievalError::OutOfRange {
            index,
            len: self.chunks.len(),
        })
    }

    /// Appends in order and rewrites the whole file. On a failed write the
    /// in-memory store is restored to its previous length.
    pub fn append(&mut self, chunks: Vec<Chunk>) -> Result<(), RetrievalError> {
        if chunks.is_empty() {
            return Ok(());
        }

        let previous = self.chunks.len();
        self.chunks.extend(chunks);

        if let Err(error) = self.persist() {
            self.chunks.truncate(previous);
            return Err(error);
        }

        Ok(())
    }

    pub fn truncate(&mut self, len: usize) -> Result<(), RetrievalError> {
        if len >= self.chunks.len() {
            return Ok(());
        }
        self.chunks.truncate(len);
        self.persist()
    }

    pub fn clear(&mut self) -> Result<(), RetrievalError> {
        self.chunks.clear();
        remove_if_exists(&self.path)
    }

    /// Distinct source names with their chunk counts, sorted by name.
    pub fn sources(&self) -> Vec<(String, usize)> {
        let mut counts = BTreeMap::<&str, usize>::new();
        for chunk in &self.chunks {
            *counts.entry(chunk.source()).or_default() += 1;
        }
        counts
            .into_iter()
            .map(|(source, count)| (source.to_string(), count))
            .collect()
    }

    fn persist(&self) -> Result<(), RetrievalError> {
        let payload = PersistedChunksRef {
            version: STORE_FORMAT_VERSION,
            chunks: &self.chunks,
        };
        let bytes = serde_json::to_vec(&payload)
            .map_err(|error| RetrievalError::persistence(&self.path, error))?;
        write_atomic(&self.path, &bytes)
    }
}

fn read_chunks(path: &Path) -> Result<Vec<Chunk>, RetrievalError> {
    let bytes = fs::read(path).map_err(|error| RetrievalError::persistence(path, error))?;
    let persisted: PersistedChunks =
        serde_json::from_slice(&bytes).map_err(|error| RetrievalError::persistence(path, error))?;

    if persisted.version != STORE_FORMAT_VERSION {
        return Err(RetrievalError::persistence(
            path,
            format!("unsupported chunk store version {}", persisted.version),
        ));
    }

    Ok(persisted.chunks)
}

/// Writes to a sibling temporary file and renames it over `path`, so readers
/// see either the old or the new contents.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), RetrievalError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|error| RetrievalError::persistence(parent, error))?;
    }

    let staging = sibling_path(path, "tmp");
    let written = File::create(&staging).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });

    if let Err(error) = written.and_then(|()| fs::rename(&staging, path)) {
        let _ = fs::remove_file(&staging);
        return Err(RetrievalError::persistence(path, error));
    }

    Ok(())
}

pub(crate) fn remove_if_exists(path: &Path) -> Result<(), RetrievalError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
        Err(error) => Err(RetrievalError::persistence(path, error)),
    }
}

/// Moves an unreadable file aside instead of deleting it.
pub(crate) fn quarantine(path: &Path) -> Result<PathBuf, RetrievalError> {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    let target = sibling_path(path, &format!("corrupt-{stamp}"));
    fs::rename(path, &target).map_err(|error| RetrievalError::persistence(path, error))?;
    Ok(target)
}

/// Copies `path` aside under the same naming scheme as [`quarantine`], leaving
/// the original in place. Returns `None` when there is nothing to copy.
pub(crate) fn preserve_copy(path: &Path) -> Result<Option<PathBuf>, RetrievalError> {
    if !path.exists() {
        return Ok(None);
    }
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    let target = sibling_path(path, &format!("corrupt-{stamp}"));
    fs::copy(path, &target).map_err(|error| RetrievalError::persistence(path, error))?;
    Ok(Some(target))
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}
