//! Splitting a composition into bounded, overlapping training windows.

use super::sequence::TokenSequence;
use crate::error::{Error, Result};

/// A contiguous slice of a composition, at most `max_seq_len` tokens long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    /// The window's tokens.
    pub tokens: Vec<u32>,
    /// Offset of the first token within the source sequence.
    pub start_offset: usize,
    /// Tokens shared with the previous window (0 for the first).
    pub overlap_len: usize,
}

impl Window {
    /// Window length in tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the window is empty.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// The tokens this window contributes beyond its predecessor.
    pub fn fresh_tokens(&self) -> &[u32] {
        &self.tokens[self.overlap_len..]
    }
}

/// Lazy left-to-right iterator of [`Window`]s over one sequence.
///
/// Interior windows advance with stride `W - O`; the final window is
/// right-aligned to the sequence end so no token is ever dropped, even when
/// that makes its overlap with its predecessor larger than `O`.
/// Deterministic and restartable: iterating a clone replays the same windows.
#[derive(Debug, Clone)]
pub struct Windower<'a> {
    tokens: &'a [u32],
    max_seq_len: usize,
    stride: usize,
    pos: usize,
    prev_end: usize,
    done: bool,
}

impl<'a> Windower<'a> {
    /// Windows over a [`TokenSequence`].
    pub fn new(sequence: &'a TokenSequence, max_seq_len: usize, overlap: usize) -> Result<Self> {
        Self::over(sequence.tokens(), max_seq_len, overlap)
    }

    /// Windows over a raw token slice.
    pub fn over(tokens: &'a [u32], max_seq_len: usize, overlap: usize) -> Result<Self> {
        if max_seq_len == 0 {
            return Err(Error::InvalidConfig("max_seq_len must be positive".into()));
        }
        if overlap >= max_seq_len {
            return Err(Error::InvalidConfig(format!(
                "overlap ({overlap}) must be smaller than max_seq_len ({max_seq_len})"
            )));
        }
        Ok(Self {
            tokens,
            max_seq_len,
            stride: max_seq_len - overlap,
            pos: 0,
            prev_end: 0,
            done: false,
        })
    }

    /// Number of windows this iterator will emit.
    pub fn count_windows(&self) -> usize {
        let l = self.tokens.len();
        if l <= self.max_seq_len {
            1
        } else {
            // Interior windows at 0, stride, 2*stride, ... while start+W < L,
            // plus the right-aligned final window.
            1 + (l - self.max_seq_len).div_ceil(self.stride)
        }
    }
}

impl Iterator for Windower<'_> {
    type Item = Window;

    fn next(&mut self) -> Option<Window> {
        if self.done {
            return None;
        }
        let l = self.tokens.len();
        if l <= self.max_seq_len {
            self.done = true;
            return Some(Window {
                tokens: self.tokens.to_vec(),
                start_offset: 0,
                overlap_len: 0,
            });
        }

        let start = if self.pos + self.max_seq_len >= l {
            self.done = true;
            l - self.max_seq_len
        } else {
            self.pos
        };
        let end = start + self.max_seq_len;
        let overlap_len = self.prev_end.saturating_sub(start);
        self.prev_end = end;
        self.pos += self.stride;

        Some(Window {
            tokens: self.tokens[start..end].to_vec(),
            start_offset: start,
            overlap_len,
        })
    }
}
