//! Paragraph-boundary text chunker.
//!
//! Splits document body text into [`Chunk`]s that respect a configurable
//! `max_tokens` limit. Splitting occurs on paragraph boundaries (`\n\n`)
//! so that a chunk usually holds whole paragraphs. When `overlap_tokens` is
//! set, the trailing paragraphs of a chunk (up to that budget) are repeated
//! at the start of the next one so a retrieved chunk keeps its lead-in.
//!
//! Each chunk carries a SHA-256 hash of its text for staleness detection.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::Chunk;

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Split text into chunks on paragraph boundaries, respecting max_tokens.
/// Returns chunks with contiguous indices starting at 0.
pub fn chunk_text(
    document_id: &str,
    text: &str,
    max_tokens: usize,
    overlap_tokens: usize,
) -> Vec<Chunk> {
    let max_chars = max_tokens * CHARS_PER_TOKEN;
    let overlap_chars = overlap_tokens.min(max_tokens.saturating_sub(1)) * CHARS_PER_TOKEN;

    if text.trim().is_empty() {
        return vec![make_chunk(document_id, 0, text.trim())];
    }

    let mut pieces: Vec<String> = Vec::new();
    // Paragraphs of the chunk being built.
    let mut current: Vec<&str> = Vec::new();
    let mut current_len = 0usize;
    // Set when `current` only holds overlap carried from the previous chunk.
    let mut only_overlap = false;

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        if trimmed.len() > max_chars {
            if !current.is_empty() && !only_overlap {
                pieces.push(current.join("\n\n"));
            }
            current.clear();
            current_len = 0;
            only_overlap = false;
            pieces.extend(hard_split(trimmed, max_chars));
            continue;
        }

        let would_be = if current.is_empty() {
            trimmed.len()
        } else {
            current_len + 2 + trimmed.len()
        };

        if would_be > max_chars && !current.is_empty() {
            if !only_overlap {
                pieces.push(current.join("\n\n"));
            }
            current = overlap_tail(&current, overlap_chars, max_chars - trimmed.len());
            current_len = joined_len(&current);
            only_overlap = !current.is_empty();
        }

        current_len = if current.is_empty() {
            trimmed.len()
        } else {
            current_len + 2 + trimmed.len()
        };
        current.push(trimmed);
        only_overlap = false;
    }

    if !current.is_empty() && !only_overlap {
        pieces.push(current.join("\n\n"));
    }

    if pieces.is_empty() {
        pieces.push(text.trim().to_string());
    }

    pieces
        .iter()
        .enumerate()
        .map(|(i, piece)| make_chunk(document_id, i as i64, piece))
        .collect()
}

/// Trailing paragraphs of `paras` that fit in `overlap_chars`, and leave
/// room for a following paragraph within `room` chars.
fn overlap_tail<'a>(paras: &[&'a str], overlap_chars: usize, room: usize) -> Vec<&'a str> {
    let budget = overlap_chars.min(room.saturating_sub(2));
    let mut tail: Vec<&str> = Vec::new();
    let mut len = 0usize;
    for para in paras.iter().rev() {
        let next = if tail.is_empty() {
            para.len()
        } else {
            len + 2 + para.len()
        };
        if next > budget {
            break;
        }
        tail.push(para);
        len = next;
    }
    tail.reverse();
    tail
}

fn joined_len(paras: &[&str]) -> usize {
    if paras.is_empty() {
        return 0;
    }
    paras.iter().map(|p| p.len()).sum::<usize>() + 2 * (paras.len() - 1)
}

/// Cut an oversized paragraph at `max_chars`, preferring newline or space
/// boundaries and never splitting a UTF-8 sequence.
fn hard_split(paragraph: &str, max_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut remaining = paragraph;
    while !remaining.is_empty() {
        let mut split_at = remaining.len().min(max_chars);
        while !remaining.is_char_boundary(split_at) {
            split_at -= 1;
        }
        if split_at == 0 {
            // A single char wider than max_chars.
            split_at = remaining
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(remaining.len());
        }
        let actual_split = if split_at < remaining.len() {
            remaining[..split_at]
                .rfind('\n')
                .or_else(|| remaining[..split_at].rfind(' '))
                .map(|pos| pos + 1)
                .unwrap_or(split_at)
        } else {
            split_at
        };
        let piece = remaining[..actual_split].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        remaining = &remaining[actual_split..];
    }
    out
}

fn make_chunk(document_id: &str, index: i64, text: &str) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        hash,
    }
}
