//! Packing buffer: concatenates tokenised examples into fixed-length chunks.
//!
//! Examples are joined end-to-end with no separator or padding, as one
//! continuous token stream. Every time `chunk_size` tokens are available a
//! chunk is cut from the front; the tail waits for the next call. Whatever is
//! left at end of stream is dropped by [`PackingBuffer::flush`].

use rolepack_common::{PackedExample, TokenizedExample};

use crate::error::{PackError, Result};

/// Streaming concatenator. Holds fewer than `chunk_size` tokens between calls.
///
/// Mutation goes through `&mut self`; a buffer belongs to exactly one split
/// and one consumer.
#[derive(Debug, Clone)]
pub struct PackingBuffer {
    chunk_size: usize,
    pending_ids: Vec<u32>,
    pending_mask: Vec<u32>,
}

impl PackingBuffer {
    pub fn new(chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(PackError::InvalidChunkSize(chunk_size));
        }
        Ok(Self {
            chunk_size,
            pending_ids: Vec::with_capacity(chunk_size * 2),
            pending_mask: Vec::with_capacity(chunk_size * 2),
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Tokens carried over to the next call.
    pub fn pending_len(&self) -> usize {
        self.pending_ids.len()
    }

    /// Carried-over `(ids, mask)`.
    pub fn pending(&self) -> (&[u32], &[u32]) {
        (&self.pending_ids, &self.pending_mask)
    }

    /// Append `ids`/`mask` and return every full chunk now available, in
    /// emission order. Mismatched lengths leave the buffer untouched.
    pub fn add(&mut self, ids: &[u32], mask: &[u32]) -> Result<Vec<PackedExample>> {
        if ids.len() != mask.len() {
            return Err(PackError::LengthMismatch {
                ids: ids.len(),
                mask: mask.len(),
            });
        }
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.pending_ids.extend_from_slice(ids);
        self.pending_mask.extend_from_slice(mask);

        let c = self.chunk_size;
        let num_chunks = self.pending_ids.len() / c;
        let chunks: Vec<PackedExample> = (0..num_chunks)
            .map(|i| {
                let span = i * c..(i + 1) * c;
                PackedExample::causal(
                    self.pending_ids[span.clone()].to_vec(),
                    self.pending_mask[span].to_vec(),
                )
            })
            .collect();
        if num_chunks > 0 {
            self.pending_ids.drain(..num_chunks * c);
            self.pending_mask.drain(..num_chunks * c);
        }
        debug_assert!(self.pending_ids.len() < c);
        Ok(chunks)
    }

    pub fn add_example(&mut self, example: &TokenizedExample) -> Result<Vec<PackedExample>> {
        self.add(&example.ids, &example.mask)
    }

    /// Drop the partial tail and reset. Returns how many tokens were dropped.
    pub fn flush(&mut self) -> usize {
        let dropped = self.pending_ids.len();
        self.pending_ids.clear();
        self.pending_mask.clear();
        dropped
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
