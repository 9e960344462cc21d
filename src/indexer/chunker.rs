use anyhow::{bail, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    pub text: String,
    pub chunk_index: usize,
}

/// Splits text into overlapping windows measured in characters.
///
/// Each window prefers to end on a paragraph break, then a line break, then a
/// sentence end, then a space; it only falls back to a hard cut when none of those
/// appear in the second half of the window.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    size: usize,
    overlap: usize,
}

const BREAKS: [&str; 5] = ["\n\n", "\n", ". ", "? ", "! "];

impl Chunker {
    pub fn new(size: usize, overlap: usize) -> Result<Self> {
        if size == 0 {
            bail!("chunk size must be greater than zero");
        }
        if overlap >= size {
            bail!("chunk overlap ({}) must be smaller than chunk size ({})", overlap, size);
        }
        Ok(Self { size, overlap })
    }

    pub fn split(&self, text: &str) -> Vec<TextChunk> {
        let text = text.trim();
        if text.is_empty() {
            return Vec::new();
        }

        // Byte offset of every char, plus the end of the text.
        let offsets: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();
        let char_count = offsets.len() - 1;

        let mut chunks = Vec::new();
        let mut start = 0;

        loop {
            let mut end = (start + self.size).min(char_count);
            if end < char_count {
                end = self.break_point(text, &offsets, start, end);
            }

            let piece = text[offsets[start]..offsets[end]].trim();
            if !piece.is_empty() {
                chunks.push(TextChunk {
                    text: piece.to_string(),
                    chunk_index: chunks.len(),
                });
            }

            if end >= char_count {
                break;
            }
            let next = end.saturating_sub(self.overlap);
            start = if next > start { next } else { end };
        }

        chunks
    }

    fn break_point(&self, text: &str, offsets: &[usize], start: usize, end: usize) -> usize {
        let window = &text[offsets[start]..offsets[end]];
        let min_end = start + self.size / 2;

        for sep in BREAKS.iter().copied().chain(std::iter::once(" ")) {
            if let Some(pos) = window.rfind(sep) {
                let byte_end = offsets[start] + pos + sep.len();
                let char_end = offsets.partition_point(|&o| o < byte_end);
                if char_end > min_end {
                    return char_end;
                }
            }
        }
        end
    }
}
