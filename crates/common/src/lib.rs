//! # rolepack-common — Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`PackConfig`]** — packing knobs (serialised as JSON).
//! * **[`SampleReader`]** / **[`PromptTemplate`]** — raw persona samples → prompt text.
//! * **[`TokenSource`]** / **[`HfTokenSource`]** — prompt text → [`TokenizedExample`].
//! * **[`PackedExample`]** — fixed-length chunk, plus JSONL / `PKD1` I/O and [`collate`].

pub mod config;
pub mod data;
pub mod packed;

pub use config::PackConfig;
pub use data::{
    HfTokenSource, PromptTemplate, RawSample, SampleReader, TokenSource, TokenizedExample,
};
pub use packed::{
    collate, read_jsonl, write_jsonl, write_packed_file, PackedBatch, PackedExample,
    PackedMmapDataset,
};
