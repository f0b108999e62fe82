//! Per-split driver around a single [`PackingBuffer`].
//!
//! Batches only affect throughput: the packed output for a split is the same
//! however its examples were grouped.

use rolepack_common::{PackedExample, TokenizedExample};

use crate::buffer::PackingBuffer;
use crate::error::Result;

/// Counters for one packed split.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackStats {
    /// Tokenised examples consumed.
    pub examples: usize,
    /// Tokens consumed.
    pub tokens: usize,
    /// Chunks emitted.
    pub chunks: usize,
    /// Tokens dropped at flush.
    pub discarded: usize,
}

impl PackStats {
    /// Fraction of consumed tokens that made it into a chunk.
    pub fn utilisation(&self) -> f64 {
        if self.tokens == 0 {
            0.0
        } else {
            (self.tokens - self.discarded) as f64 / self.tokens as f64
        }
    }
}

/// Finished output of [`PackedDatasetMapper::finish`].
#[derive(Debug, Clone)]
pub struct PackedSplit {
    pub name: String,
    pub chunk_size: usize,
    pub examples: Vec<PackedExample>,
    pub stats: PackStats,
}

/// Feeds batches of tokenised examples through one buffer, collecting every
/// emitted chunk for the split.
pub struct PackedDatasetMapper {
    name: String,
    buffer: PackingBuffer,
    output: Vec<PackedExample>,
    stats: PackStats,
}

impl PackedDatasetMapper {
    pub fn new(name: impl Into<String>, chunk_size: usize) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            buffer: PackingBuffer::new(chunk_size)?,
            output: Vec::new(),
            stats: PackStats::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn chunk_size(&self) -> usize {
        self.buffer.chunk_size()
    }

    /// Chunks emitted so far, in emission order.
    pub fn packed(&self) -> &[PackedExample] {
        &self.output
    }

    pub fn stats(&self) -> PackStats {
        self.stats
    }

    /// Pack one batch in order. Returns the number of chunks it emitted.
    ///
    /// Stops at the first malformed example; examples before it stay packed.
    pub fn map_batch(&mut self, batch: &[TokenizedExample]) -> Result<usize> {
        let before = self.output.len();
        for example in batch {
            self.map_example(example)?;
        }
        let emitted = self.output.len() - before;
        tracing::debug!(
            split = %self.name,
            batch = batch.len(),
            emitted,
            pending = self.buffer.pending_len(),
            "packed batch"
        );
        Ok(emitted)
    }

    pub fn map_example(&mut self, example: &TokenizedExample) -> Result<()> {
        let chunks = self.buffer.add_example(example)?;
        self.stats.examples += 1;
        self.stats.tokens += example.len();
        self.stats.chunks += chunks.len();
        self.output.extend(chunks);
        Ok(())
    }

    /// Flush the buffer, dropping the partial tail, and hand back the split.
    pub fn finish(mut self) -> PackedSplit {
        let discarded = self.buffer.flush();
        self.stats.discarded = discarded;
        if discarded > 0 {
            tracing::debug!(split = %self.name, discarded, "dropped trailing partial chunk");
        }
        tracing::info!(
            split = %self.name,
            examples = self.stats.examples,
            tokens = self.stats.tokens,
            chunks = self.stats.chunks,
            discarded,
            "split packed"
        );
        PackedSplit {
            name: self.name,
            chunk_size: self.buffer.chunk_size(),
            examples: self.output,
            stats: self.stats,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PackError;
    use proptest::prelude::*;

    fn ex(ids: &[u32], mask: &[u32]) -> TokenizedExample {
        TokenizedExample::new(ids.to_vec(), mask.to_vec())
    }

    fn walkthrough() -> Vec<TokenizedExample> {
        vec![
            ex(&[1, 2, 3], &[1, 1, 1]),
            ex(&[4, 5], &[1, 0]),
            ex(&[6, 7, 8, 9, 10], &[1, 1, 1, 1, 1]),
        ]
    }

    #[test]
    fn single_batch_walkthrough() {
        let mut mapper = PackedDatasetMapper::new("train", 4).unwrap();
        assert_eq!(mapper.map_batch(&walkthrough()).unwrap(), 2);
        let split = mapper.finish();

        assert_eq!(split.name, "train");
        assert_eq!(split.examples.len(), 2);
        assert_eq!(split.examples[1].attention_mask, vec![0, 1, 1, 1]);
        assert_eq!(
            split.stats,
            PackStats {
                examples: 3,
                tokens: 10,
                chunks: 2,
                discarded: 2,
            }
        );
        assert!((split.stats.utilisation() - 0.8).abs() < 1e-12);
    }

    #[test]
    fn emission_order_spans_batches() {
        let mut mapper = PackedDatasetMapper::new("train", 4).unwrap();
        let batches = walkthrough();
        assert_eq!(mapper.map_batch(&batches[..1]).unwrap(), 0);
        assert_eq!(mapper.map_batch(&batches[1..2]).unwrap(), 1);
        assert_eq!(mapper.map_batch(&batches[2..]).unwrap(), 1);
        assert_eq!(mapper.packed()[0].input_ids, vec![1, 2, 3, 4]);
        assert_eq!(mapper.packed()[1].input_ids, vec![5, 6, 7, 8]);
    }

    #[test]
    fn empty_split_emits_nothing() {
        let split = PackedDatasetMapper::new("validation", 8).unwrap().finish();
        assert!(split.examples.is_empty());
        assert_eq!(split.stats, PackStats::default());
        assert_eq!(split.stats.utilisation(), 0.0);
    }

    #[test]
    fn bad_example_aborts_batch() {
        let mut mapper = PackedDatasetMapper::new("train", 2).unwrap();
        let batch = vec![ex(&[1, 2], &[1, 1]), ex(&[3], &[]), ex(&[4, 5], &[1, 1])];
        let err = mapper.map_batch(&batch).unwrap_err();
        assert_eq!(err, PackError::LengthMismatch { ids: 1, mask: 0 });
        assert_eq!(mapper.packed().len(), 1);
        assert_eq!(mapper.stats().examples, 1);
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        assert!(PackedDatasetMapper::new("train", 0).is_err());
    }

    #[test]
    fn splits_do_not_share_state() {
        let mut train = PackedDatasetMapper::new("train", 4).unwrap();
        let mut val = PackedDatasetMapper::new("validation", 4).unwrap();
        train.map_batch(&[ex(&[1, 2, 3], &[1, 1, 1])]).unwrap();
        val.map_batch(&[ex(&[9], &[1])]).unwrap();
        assert!(train.packed().is_empty());
        assert!(val.packed().is_empty());
        assert_eq!(train.finish().stats.discarded, 3);
        assert_eq!(val.finish().stats.discarded, 1);
    }

    fn examples() -> impl Strategy<Value = Vec<TokenizedExample>> {
        prop::collection::vec(
            prop::collection::vec(0u32..1000, 0..25).prop_map(TokenizedExample::unmasked),
            0..40,
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_rebatching_is_invisible(
            chunk_size in 1usize..12,
            inputs in examples(),
            batch_size in 1usize..9,
        ) {
            let mut whole = PackedDatasetMapper::new("a", chunk_size).unwrap();
            whole.map_batch(&inputs).unwrap();
            let whole = whole.finish();

            let mut pieces = PackedDatasetMapper::new("b", chunk_size).unwrap();
            for batch in inputs.chunks(batch_size) {
                pieces.map_batch(batch).unwrap();
            }
            let pieces = pieces.finish();

            prop_assert_eq!(&whole.examples, &pieces.examples);
            prop_assert_eq!(whole.stats, pieces.stats);

            let total: usize = inputs.iter().map(|e| e.len()).sum();
            prop_assert_eq!(whole.stats.chunks, total / chunk_size);
            prop_assert_eq!(whole.stats.discarded, total % chunk_size);
        }
    }
}
