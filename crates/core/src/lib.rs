//! # rolepack-core — The Packing Engine
//!
//! Turns a stream of tokenised examples into fixed-length training chunks:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`buffer`] | `PackingBuffer`: concatenate, cut full chunks, carry the tail |
//! | [`mapper`] | `PackedDatasetMapper`: one buffer per split, batch-invariant output |
//! | [`pipeline`] | `SplitPacker` / `pack_split` / `pack_split_prefetched`: template → tokeniser → mapper |
//! | [`error`] | `PackError` |
//!
//! ## Design principles
//!
//! 1. **No padding.** Examples are joined end-to-end; the partial tail of a
//!    split is dropped rather than padded.
//! 2. **Single consumer.** Packing is sequential per split; only tokenisation
//!    runs in parallel.
//! 3. **Deterministic.** Same inputs in the same order = same chunks,
//!    regardless of batch boundaries.

pub mod buffer;
pub mod error;
pub mod mapper;
pub mod pipeline;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use buffer::PackingBuffer;
pub use error::{PackError, Result};
pub use mapper::{PackStats, PackedDatasetMapper, PackedSplit};
pub use pipeline::{pack_split, pack_split_prefetched, SplitPacker};
