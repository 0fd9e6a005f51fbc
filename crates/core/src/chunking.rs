use crate::error::IngestError;
use regex::Regex;
use std::collections::VecDeque;
use std::sync::OnceLock;
use tracing::warn;
use unicode_general_category::{get_general_category, GeneralCategory};

/// Break points tried in order: paragraph, line, sentence, word, then a hard
/// character cut.
const SEPARATORS: [&str; 7] = ["\n\n", "\n", ". ", "! ", "? ", " ", ""];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1_000,
            chunk_overlap: 200,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.chunk_size == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(IngestError::InvalidChunkConfig(format!(
                "overlap {} must be smaller than chunk size {}",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

fn whitespace_run() -> Result<&'static Regex, &'static regex::Error> {
    static PATTERN: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\s+")).as_ref()
}

/// Control, format, surrogate, private-use and unassigned code points.
/// Whitespace is kept so the collapse step turns it into a single space.
fn is_invisible(c: char) -> bool {
    if c.is_whitespace() {
        return false;
    }
    matches!(
        get_general_category(c),
        GeneralCategory::Control
            | GeneralCategory::Format
            | GeneralCategory::Surrogate
            | GeneralCategory::PrivateUse
            | GeneralCategory::Unassigned
    )
}

/// Collapses whitespace runs to one space, drops non-printable characters and
/// trims. Never fails: if the whitespace pattern is unavailable the trimmed
/// input is returned as-is.
pub fn clean_text(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    match whitespace_run() {
        Ok(pattern) => {
            let printable = text.chars().filter(|c| !is_invisible(*c)).collect::<String>();
            pattern.replace_all(&printable, " ").trim().to_string()
        }
        Err(error) => {
            warn!(%error, "whitespace pattern unavailable, returning trimmed text");
            text.trim().to_string()
        }
    }
}

/// Splits text into chunks of at most `chunk_size` characters, preferring
/// natural break points and carrying up to `chunk_overlap` characters of the
/// previous chunk into the next one.
pub fn split_text(text: &str, config: ChunkingConfig) -> Vec<String> {
    if text.trim().is_empty() || config.chunk_size == 0 {
        return Vec::new();
    }

    if char_len(text) <= config.chunk_size {
        return vec![text.trim().to_string()];
    }

    split_recursive(text, &SEPARATORS, config)
}

fn split_recursive(text: &str, separators: &[&str], config: ChunkingConfig) -> Vec<String> {
    let position = separators
        .iter()
        .position(|separator| separator.is_empty() || text.contains(separator))
        .unwrap_or(separators.len().saturating_sub(1));
    let separator = separators.get(position).copied().unwrap_or("");
    let finer = separators.get(position + 1..).unwrap_or(&[]);

    let pieces = if separator.is_empty() {
        split_chars(text)
    } else {
        split_keeping_separator(text, separator)
    };

    let mut chunks = Vec::new();
    let mut pending = Vec::new();

    for piece in pieces {
        if char_len(piece) <= config.chunk_size {
            pending.push(piece);
            continue;
        }

        if !pending.is_empty() {
            chunks.extend(merge_pieces(&pending, config));
            pending.clear();
        }

        if finer.is_empty() {
            let trimmed = piece.trim();
            if !trimmed.is_empty() {
                chunks.push(trimmed.to_string());
            }
        } else {
            chunks.extend(split_recursive(piece, finer, config));
        }
    }

    if !pending.is_empty() {
        chunks.extend(merge_pieces(&pending, config));
    }

    chunks
}

fn merge_pieces(pieces: &[&str], config: ChunkingConfig) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut window: VecDeque<(&str, usize)> = VecDeque::new();
    let mut total = 0usize;

    for &piece in pieces {
        let length = char_len(piece);

        if total + length > config.chunk_size && !window.is_empty() {
            emit_window(&window, &mut chunks);

            while total > config.chunk_overlap
                || (total + length > config.chunk_size && total > 0)
            {
                match window.pop_front() {
                    Some((_, dropped)) => total -= dropped,
                    None => break,
                }
            }
        }

        window.push_back((piece, length));
        total += length;
    }

    emit_window(&window, &mut chunks);
    chunks
}

fn emit_window(window: &VecDeque<(&str, usize)>, chunks: &mut Vec<String>) {
    let joined = window.iter().map(|(piece, _)| *piece).collect::<String>();
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
}

/// Split text at a separator, keeping the separator attached to the
/// preceding piece so the pieces concatenate back to the input.
fn split_keeping_separator<'a>(text: &'a str, separator: &str) -> Vec<&'a str> {
    let mut pieces = Vec::new();
    let mut start = 0;

    while let Some(offset) = text[start..].find(separator) {
        let end = start + offset + separator.len();
        pieces.push(&text[start..end]);
        start = end;
    }

    if start < text.len() {
        pieces.push(&text[start..]);
    }

    pieces
}

fn split_chars(text: &str) -> Vec<&str> {
    text.char_indices()
        .map(|(index, c)| &text[index..index + c.len_utf8()])
        .collect()
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}
