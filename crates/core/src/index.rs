//! Flat (exhaustive) nearest-neighbor index over embedding rows.
//!
//! Rows are append-only and searched by squared Euclidean distance. The
//! whole matrix is persisted after every mutation in a small binary format:
//!
//! ```text
//! "DQVX" | version: u32 | dimension: u32 | rows: u64 | rows*dimension f32 | sha256
//! ```
//!
//! All integers and floats are little-endian; the trailing SHA-256 covers
//! every preceding byte.

use crate::config::CorruptionPolicy;
use crate::embeddings::Embedding;
use crate::error::RetrievalError;
use crate::store::{quarantine, remove_if_exists, write_atomic, LoadOutcome};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, error, info};

const MAGIC: &[u8; 4] = b"DQVX";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 4 + 8;
const CHECKSUM_LEN: usize = 32;

/// One search slot. `row` is `None` when the index had fewer rows than the
/// requested `k`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub distance: f32,
    pub row: Option<usize>,
}

impl Neighbor {
    pub const NO_MATCH: Neighbor = Neighbor {
        distance: f32::INFINITY,
        row: None,
    };
}

#[derive(Debug)]
pub struct VectorIndex {
    path: PathBuf,
    dimension: usize,
    data: Vec<f32>,
}

impl VectorIndex {
    pub fn new(path: impl Into<PathBuf>, dimension: usize) -> Self {
        Self {
            path: path.into(),
            dimension,
            data: Vec::new(),
        }
    }

    /// Loads the persisted index at `path`, or creates an empty one. A corrupt
    /// file or one built for another dimension is handled per `policy`.
    pub fn load_or_create(
        path: impl Into<PathBuf>,
        dimension: usize,
        policy: CorruptionPolicy,
    ) -> Result<(Self, LoadOutcome), RetrievalError> {
        let path = path.into();
        if dimension == 0 {
            return Err(RetrievalError::InvalidArgument(
                "index dimension must be positive".to_string(),
            ));
        }

        if !path.exists() {
            info!(path = %path.display(), dimension, "creating new vector index");
            return Ok((Self::new(path, dimension), LoadOutcome::Created));
        }

        let loaded = fs::read(&path)
            .map_err(|error| RetrievalError::persistence(&path, error))
            .and_then(|bytes| {
                decode(&bytes).map_err(|cause| RetrievalError::persistence(&path, cause))
            })
            .and_then(|(stored_dimension, data)| {
                if stored_dimension == dimension {
                    Ok(data)
                } else {
                    Err(RetrievalError::DimensionMismatch {
                        expected: dimension,
                        actual: stored_dimension,
                    })
                }
            });

        match loaded {
            Ok(data) => {
                let index = Self {
                    path,
                    dimension,
                    data,
                };
                info!(path = %index.path.display(), rows = index.rows(), dimension, "loaded vector index");
                let entries = index.rows();
                Ok((index, LoadOutcome::Loaded { entries }))
            }
            Err(load_error) if policy == CorruptionPolicy::FailFast => Err(load_error),
            Err(load_error) => {
                let quarantined = quarantine(&path)
                    .map_err(|move_error| {
                        error!(path = %path.display(), error = %move_error, "could not move unusable vector index aside");
                    })
                    .ok();
                error!(
                    path = %path.display(),
                    error = %load_error,
                    quarantined = ?quarantined,
                    "vector index unusable, starting empty; previously indexed vectors are lost"
                );
                Ok((
                    Self::new(path, dimension),
                    LoadOutcome::Recovered {
                        reason: load_error.to_string(),
                        quarantined,
                    },
                ))
            }
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn rows(&self) -> usize {
        self.data.len().checked_div(self.dimension).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Appends rows in order and persists synchronously. Row `i` of the batch
    /// becomes global row `rows() + i`. Nothing is appended if any row has
    /// the wrong width or the write fails.
    pub fn insert(&mut self, vectors: &[Embedding]) -> Result<(), RetrievalError> {
        if let Some(bad) = vectors.iter().find(|vector| vector.len() != self.dimension) {
            return Err(RetrievalError::DimensionMismatch {
                expected: self.dimension,
                actual: bad.len(),
            });
        }
        if vectors.is_empty() {
            return Ok(());
        }

        let previous = self.data.len();
        for vector in vectors {
            self.data.extend_from_slice(vector);
        }

        if let Err(error) = self.persist() {
            self.data.truncate(previous);
            return Err(error);
        }

        debug!(added = vectors.len(), rows = self.rows(), "vectors inserted");
        Ok(())
    }

    /// Returns exactly `k` slots, nearest first. Slots beyond `rows()` are
    /// [`Neighbor::NO_MATCH`]. Equal distances are ordered by row.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, RetrievalError> {
        if query.len() != self.dimension {
            return Err(RetrievalError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }
        if self.data.is_empty() {
            return Ok(vec![Neighbor::NO_MATCH; k]);
        }

        let mut scored: Vec<(f32, usize)> = self
            .data
            .chunks_exact(self.dimension)
            .enumerate()
            .map(|(row, vector)| (squared_l2(query, vector), row))
            .collect();

        let by_distance =
            |left: &(f32, usize), right: &(f32, usize)| -> Ordering {
                left.0.total_cmp(&right.0).then(left.1.cmp(&right.1))
            };

        if scored.len() > k {
            scored.select_nth_unstable_by(k - 1, by_distance);
            scored.truncate(k);
        }
        scored.sort_unstable_by(by_distance);

        let mut neighbors = scored
            .into_iter()
            .map(|(distance, row)| Neighbor {
                distance,
                row: Some(row),
            })
            .collect::<Vec<_>>();
        neighbors.resize(k, Neighbor::NO_MATCH);
        Ok(neighbors)
    }

    /// Drops every row at or beyond `rows` and persists.
    pub fn truncate(&mut self, rows: usize) -> Result<(), RetrievalError> {
        if rows >= self.rows() {
            return Ok(());
        }
        self.data.truncate(rows * self.dimension);
        self.persist()
    }

    /// Empties the index, keeping its dimension, and removes the file.
    pub fn clear(&mut self) -> Result<(), RetrievalError> {
        self.data.clear();
        remove_if_exists(&self.path)
    }

    fn persist(&self) -> Result<(), RetrievalError> {
        write_atomic(&self.path, &encode(self.dimension, &self.data))
    }
}

fn squared_l2(left: &[f32], right: &[f32]) -> f32 {
    left.iter()
        .zip(right)
        .map(|(a, b)| {
            let delta = a - b;
            delta * delta
        })
        .sum()
}

fn encode(dimension: usize, data: &[f32]) -> Vec<u8> {
    let rows = if dimension == 0 { 0 } else { data.len() / dimension };
    let mut bytes = Vec::with_capacity(HEADER_LEN + data.len() * 4 + CHECKSUM_LEN);
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&(dimension as u32).to_le_bytes());
    bytes.extend_from_slice(&(rows as u64).to_le_bytes());
    for value in data {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    let checksum = Sha256::digest(&bytes);
    bytes.extend_from_slice(&checksum);
    bytes
}

fn decode(bytes: &[u8]) -> Result<(usize, Vec<f32>), String> {
    if bytes.len() < HEADER_LEN + CHECKSUM_LEN {
        return Err(format!("file too short ({} bytes)", bytes.len()));
    }

    let (body, checksum) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
    if Sha256::digest(body).as_slice() != checksum {
        return Err("checksum mismatch".to_string());
    }
    if &body[0..4] != MAGIC {
        return Err("not a vector index file".to_string());
    }

    let version = u32::from_le_bytes(read_array(body, 4)?);
    if version != FORMAT_VERSION {
        return Err(format!("unsupported index version {version}"));
    }

    let dimension = u32::from_le_bytes(read_array(body, 8)?) as usize;
    let rows = usize::try_from(u64::from_le_bytes(read_array(body, 12)?))
        .map_err(|_| "row count overflows usize".to_string())?;
    if dimension == 0 {
        return Err("stored dimension is zero".to_string());
    }

    let expected_values = rows
        .checked_mul(dimension)
        .ok_or_else(|| "row count overflows usize".to_string())?;
    let payload = &body[HEADER_LEN..];
    if payload.len() != expected_values * 4 {
        return Err(format!(
            "expected {} bytes of vectors for {rows} rows, found {}",
            expected_values * 4,
            payload.len()
        ));
    }

    let data = payload
        .chunks_exact(4)
        .map(|raw| f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
        .collect();
    Ok((dimension, data))
}

fn read_array<const N: usize>(bytes: &[u8], offset: usize) -> Result<[u8; N], String> {
    bytes
        .get(offset..offset + N)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| format!("truncated header at byte {offset}"))
}
