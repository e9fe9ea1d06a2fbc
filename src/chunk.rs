//! Paragraph-boundary text chunker used by pre-processing.
//!
//! Text is split on blank lines and paragraphs are packed greedily into
//! chunks of at most `max_tokens` (approximated as four characters per
//! token). A paragraph longer than the limit is cut at the last newline
//! or space before the limit. Each chunk carries the SHA-256 of its text.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: u32,
    pub text: String,
    pub hash: String,
}

impl Chunk {
    fn new(index: u32, text: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        Self {
            index,
            text: text.to_string(),
            hash: format!("{:x}", hasher.finalize()),
        }
    }
}

struct Packer {
    max_chars: usize,
    buf: String,
    chunks: Vec<Chunk>,
}

impl Packer {
    fn flush(&mut self) {
        let text = self.buf.trim();
        if !text.is_empty() {
            let index = self.chunks.len() as u32;
            self.chunks.push(Chunk::new(index, text));
        }
        self.buf.clear();
    }

    fn push_paragraph(&mut self, para: &str) {
        if para.len() > self.max_chars {
            self.flush();
            for piece in split_long(para, self.max_chars) {
                self.buf.push_str(piece);
                self.flush();
            }
            return;
        }

        if !self.buf.is_empty() && self.buf.len() + 2 + para.len() > self.max_chars {
            self.flush();
        }
        if !self.buf.is_empty() {
            self.buf.push_str("\n\n");
        }
        self.buf.push_str(para);
    }
}

/// Split `text` into chunks with contiguous indices starting at 0.
///
/// Returns no chunks for text that is empty or whitespace only.
pub fn chunk_text(text: &str, max_tokens: usize) -> Vec<Chunk> {
    let mut packer = Packer {
        max_chars: max_tokens.max(1) * CHARS_PER_TOKEN,
        buf: String::new(),
        chunks: Vec::new(),
    };

    let normalized = text.replace("\r\n", "\n");
    for para in normalized.split("\n\n").map(str::trim) {
        if !para.is_empty() {
            packer.push_paragraph(para);
        }
    }
    packer.flush();

    packer.chunks
}

/// Cut an oversized paragraph into pieces of at most `max_chars` bytes,
/// preferring newline or space boundaries and never splitting a character.
fn split_long(mut text: &str, max_chars: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    while text.len() > max_chars {
        let mut limit = max_chars;
        while !text.is_char_boundary(limit) {
            limit -= 1;
        }
        let cut = text[..limit]
            .rfind(['\n', ' '])
            .map(|pos| pos + 1)
            .unwrap_or(limit);
        pieces.push(&text[..cut]);
        text = &text[cut..];
    }
    if !text.is_empty() {
        pieces.push(text);
    }
    pieces
}
