//! Document splitters behind one [`ChunkManager`] front.
//!
//! Every strategy produces chunks that deep-copy the document metadata and
//! carry a monotonically increasing `_split_id` recording their position in
//! the document. The size splitter keeps a configurable character overlap
//! between consecutive chunks; the markdown splitter records the header
//! path of every block and treats fenced code as opaque text.

use regex::Regex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::OnceLock;
use tracing::warn;

use crate::rag::chunk::{Chunk, ChunkError, ChunkParameters, ChunkStrategy, Document};

/// Splits documents according to one [`ChunkParameters`] record.
#[derive(Clone, Debug)]
pub struct ChunkManager {
    params: ChunkParameters,
}

impl ChunkManager {
    pub fn new(params: ChunkParameters) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ChunkParameters {
        &self.params
    }

    /// Split one document into chunks.
    pub fn split(&self, document: &Document) -> Result<Vec<Chunk>, ChunkError> {
        let pieces = match self.params.strategy {
            ChunkStrategy::Size => self.split_by_size(&document.content),
            ChunkStrategy::Page => split_pages(&document.content),
            ChunkStrategy::Paragraph => {
                self.merged(split_paragraphs(&document.content), "\n\n")
            }
            ChunkStrategy::Separator => self.merged(
                split_separator(&document.content, &self.params.separator),
                &self.params.separator,
            ),
            ChunkStrategy::MarkdownHeader => {
                return Ok(finalize(split_markdown(&document.content), document));
            }
        };
        let blocks = pieces
            .into_iter()
            .map(|content| (content, FxHashMap::default()))
            .collect();
        Ok(finalize(blocks, document))
    }

    /// Split every document, keeping `_split_id` per document.
    pub fn split_all(&self, documents: &[Document]) -> Result<Vec<Chunk>, ChunkError> {
        let mut out = Vec::new();
        for document in documents {
            out.extend(self.split(document)?);
        }
        Ok(out)
    }

    /// Recursive split over an ordered separator list. Text is cut on the
    /// first separator; pieces still longer than `chunk_size` are re-split
    /// with the remaining separators, down to plain character windows.
    fn split_by_size(&self, text: &str) -> Vec<String> {
        let mut separators: Vec<&str> = vec![self.params.separator.as_str()];
        for fallback in ["\n", " "] {
            if !separators.contains(&fallback) {
                separators.push(fallback);
            }
        }
        split_recursive(
            text,
            &separators,
            self.params.chunk_size,
            self.params.chunk_overlap,
        )
    }

    fn merged(&self, pieces: Vec<String>, sep: &str) -> Vec<String> {
        if self.params.enable_merge {
            merge_adjacent(pieces, self.params.chunk_size, sep)
        } else {
            pieces
        }
    }
}

fn split_recursive(text: &str, separators: &[&str], size: usize, overlap: usize) -> Vec<String> {
    let Some((sep, rest)) = separators.split_first() else {
        return split_chars(text, size, overlap);
    };
    let mut units: Vec<String> = Vec::new();
    for piece in text.split(sep).map(str::trim).filter(|p| !p.is_empty()) {
        if piece.chars().count() <= size {
            units.push(piece.to_string());
        } else if rest.is_empty() {
            units.extend(split_chars(piece, size, overlap));
        } else {
            units.extend(split_recursive(piece, rest, size, overlap));
        }
    }
    merge_windows(units, sep, size, overlap)
}

/// Greedy merge into windows of at most `size` characters. After a window
/// is emitted, leading pieces are dropped only while at least `overlap`
/// characters remain, so consecutive windows share a tail.
fn merge_windows(pieces: Vec<String>, sep: &str, size: usize, overlap: usize) -> Vec<String> {
    let sep_len = sep.chars().count();
    let mut chunks = Vec::new();
    let mut window: Vec<String> = Vec::new();
    let mut total = 0usize;
    for piece in pieces {
        let piece_len = piece.chars().count();
        if piece_len > size {
            warn!(
                piece_len,
                chunk_size = size,
                "chunk piece longer than chunk_size, emitting oversized chunk"
            );
        }
        let joined = if window.is_empty() {
            piece_len
        } else {
            total + sep_len + piece_len
        };
        if joined > size && !window.is_empty() {
            chunks.push(window.join(sep));
            while !window.is_empty() {
                let front_len = window[0].chars().count();
                let sep_cost = if window.len() > 1 { sep_len } else { 0 };
                let shrunk = total - front_len - sep_cost;
                if shrunk >= overlap {
                    window.remove(0);
                    total = shrunk;
                } else {
                    break;
                }
            }
            // Fit takes priority over the shared tail.
            while !window.is_empty() && total + sep_len + piece_len > size {
                let front_len = window[0].chars().count();
                let sep_cost = if window.len() > 1 { sep_len } else { 0 };
                window.remove(0);
                total -= front_len + sep_cost;
            }
        }
        if window.is_empty() {
            total = piece_len;
        } else {
            total += sep_len + piece_len;
        }
        window.push(piece);
    }
    if !window.is_empty() {
        chunks.push(window.join(sep));
    }
    chunks
}

/// Character windows of `size` with `overlap` carried between windows.
fn split_chars(text: &str, size: usize, overlap: usize) -> Vec<String> {
    if size == 0 {
        return vec![text.to_string()];
    }
    let chars: Vec<char> = text.chars().collect();
    let step = size.saturating_sub(overlap).max(1);
    let mut out = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + size).min(chars.len());
        out.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += step;
    }
    out
}

/// Merge adjacent pieces while the joined text stays within `size`.
/// Oversized pieces pass through unsplit.
fn merge_adjacent(pieces: Vec<String>, size: usize, sep: &str) -> Vec<String> {
    let sep_len = sep.chars().count();
    let mut out: Vec<String> = Vec::new();
    let mut current_len = 0usize;
    for piece in pieces {
        let piece_len = piece.chars().count();
        match out.last_mut() {
            Some(last) if current_len + sep_len + piece_len <= size => {
                last.push_str(sep);
                last.push_str(&piece);
                current_len += sep_len + piece_len;
            }
            _ => {
                out.push(piece);
                current_len = piece_len;
            }
        }
    }
    out
}

fn finalize(blocks: Vec<(String, FxHashMap<String, Value>)>, document: &Document) -> Vec<Chunk> {
    blocks
        .into_iter()
        .enumerate()
        .map(|(split_id, (content, extra))| {
            let mut metadata = document.metadata.clone();
            metadata.extend(extra);
            metadata.insert("_split_id".to_string(), Value::from(split_id as u64));
            Chunk::new(content).with_metadata(metadata)
        })
        .collect()
}

fn split_pages(text: &str) -> Vec<String> {
    text.split('\u{0c}')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

fn split_paragraphs(text: &str) -> Vec<String> {
    text.split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

fn split_separator(text: &str, separator: &str) -> Vec<String> {
    text.split(separator)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

fn header_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(#{1,6})\s+(.*?)\s*$").unwrap_or_else(|_| unreachable!()))
}

/// Markdown split: blocks keyed by their header path.
///
/// Headers inside fenced code blocks are plain text. Adjacent blocks under
/// the same header path aggregate into one chunk. Each block's metadata
/// maps `"Header N"` to the title at level N for every open level.
fn split_markdown(text: &str) -> Vec<(String, FxHashMap<String, Value>)> {
    let mut blocks: Vec<(Vec<(usize, String)>, Vec<String>)> = Vec::new();
    let mut headers: Vec<(usize, String)> = Vec::new();
    let mut fence: Option<&str> = None;

    for line in text.lines() {
        let trimmed = line.trim_start();
        if let Some(open) = fence {
            push_line(&mut blocks, &headers, line);
            if trimmed.starts_with(open) {
                fence = None;
            }
            continue;
        }
        if trimmed.starts_with("```") {
            fence = Some("```");
            push_line(&mut blocks, &headers, line);
            continue;
        }
        if trimmed.starts_with("~~~") {
            fence = Some("~~~");
            push_line(&mut blocks, &headers, line);
            continue;
        }
        if let Some(caps) = header_regex().captures(line) {
            let level = caps[1].len();
            let title = caps[2].to_string();
            headers.retain(|(l, _)| *l < level);
            headers.push((level, title));
            continue;
        }
        if line.trim().is_empty() {
            continue;
        }
        push_line(&mut blocks, &headers, line);
    }

    blocks
        .into_iter()
        .map(|(headers, lines)| {
            let mut metadata = FxHashMap::default();
            for (level, title) in headers {
                metadata.insert(format!("Header {level}"), Value::String(title));
            }
            (lines.join("\n"), metadata)
        })
        .collect()
}

fn push_line(
    blocks: &mut Vec<(Vec<(usize, String)>, Vec<String>)>,
    headers: &[(usize, String)],
    line: &str,
) {
    match blocks.last_mut() {
        Some((last_headers, lines)) if last_headers.as_slice() == headers => {
            lines.push(line.to_string());
        }
        _ => blocks.push((headers.to_vec(), vec![line.to_string()])),
    }
}
