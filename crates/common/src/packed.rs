//! Packed training examples and their on-disk formats.
//!
//! * **JSONL** — one `{"input_ids", "attention_mask", "labels"}` object per line.
//! * **PKD1** — compact binary, read back zero-copy via [`PackedMmapDataset`].
//!
//! [`collate`] turns a slice of examples into `(batch, chunk_size)` tensors.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result as AnyhowResult};
use candle_core::{Device, Result, Tensor};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};

/// One fixed-length training chunk. `labels` always equals `input_ids`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedExample {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    pub labels: Vec<u32>,
}

impl PackedExample {
    /// Build a chunk for causal-LM self-supervision (`labels = input_ids`).
    pub fn causal(input_ids: Vec<u32>, attention_mask: Vec<u32>) -> Self {
        let labels = input_ids.clone();
        Self {
            input_ids,
            attention_mask,
            labels,
        }
    }

    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }
}

// ── JSONL ───────────────────────────────────────────────────────────────────

/// Write one JSON object per packed example.
pub fn write_jsonl(path: &Path, examples: &[PackedExample]) -> AnyhowResult<()> {
    let f = File::create(path).context("create packed jsonl")?;
    let mut w = BufWriter::new(f);
    for ex in examples {
        serde_json::to_writer(&mut w, ex)?;
        w.write_all(b"\n")?;
    }
    w.flush().context("flush packed jsonl")?;
    Ok(())
}

/// Read a JSONL file written by [`write_jsonl`].
pub fn read_jsonl(path: &Path) -> AnyhowResult<Vec<PackedExample>> {
    let reader = BufReader::new(File::open(path).context("open packed jsonl")?);
    let mut out = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let ex: PackedExample = serde_json::from_str(&line)
            .with_context(|| format!("parse packed example at line {}", i + 1))?;
        out.push(ex);
    }
    Ok(out)
}

// ── PKD1 binary format ──────────────────────────────────────────────────────

/// Magic bytes for the packed binary format (version 1).
const PACKED_MAGIC: &[u8; 4] = b"PKD1";
/// Header size: magic (4) + chunk_size (8) + num_chunks (8).
const PACKED_HEADER_LEN: usize = 4 + 8 + 8;

/// Write packed examples to a `PKD1` file.
///
/// Format: magic "PKD1" (4 bytes), `chunk_size` as u64 LE, `num_chunks` as
/// u64 LE, then per chunk `chunk_size` ids followed by `chunk_size` mask
/// values, all u32 LE. Labels are not stored; they equal the ids.
pub fn write_packed_file(
    path: &Path,
    chunk_size: usize,
    examples: &[PackedExample],
) -> AnyhowResult<()> {
    let mut w = BufWriter::new(File::create(path).context("create packed file")?);
    w.write_all(PACKED_MAGIC)?;
    w.write_all(&(chunk_size as u64).to_le_bytes())?;
    w.write_all(&(examples.len() as u64).to_le_bytes())?;
    for (i, ex) in examples.iter().enumerate() {
        if ex.input_ids.len() != chunk_size || ex.attention_mask.len() != chunk_size {
            anyhow::bail!(
                "chunk {i} has length {}/{}, expected {chunk_size}",
                ex.input_ids.len(),
                ex.attention_mask.len()
            );
        }
        for &id in &ex.input_ids {
            w.write_all(&id.to_le_bytes())?;
        }
        for &m in &ex.attention_mask {
            w.write_all(&m.to_le_bytes())?;
        }
    }
    let f = w.into_inner().map_err(|e| e.into_error())?;
    f.sync_all().context("sync packed file")?;
    Ok(())
}

/// Zero-copy view over a `PKD1` file.
///
/// The file is memory-mapped; only the pages touched for each chunk are paged in.
pub struct PackedMmapDataset {
    mmap: Mmap,
    chunk_size: usize,
    num_chunks: usize,
}

impl PackedMmapDataset {
    pub fn open(path: &Path) -> AnyhowResult<Self> {
        let file = File::open(path).context("open packed file for mmap")?;
        let mmap = unsafe { Mmap::map(&file).context("mmap packed file")? };
        if mmap.len() < PACKED_HEADER_LEN {
            anyhow::bail!("packed file too short");
        }
        if &mmap[0..4] != PACKED_MAGIC {
            anyhow::bail!("invalid packed file: bad magic");
        }
        let chunk_size = usize::try_from(read_u64(&mmap, 4))
            .context("invalid packed file: chunk_size does not fit in usize")?;
        let num_chunks = usize::try_from(read_u64(&mmap, 12))
            .context("invalid packed file: num_chunks does not fit in usize")?;
        if chunk_size == 0 {
            anyhow::bail!("invalid packed file: chunk_size is 0");
        }
        // Each record holds `chunk_size` ids and `chunk_size` mask values, u32 each.
        let expected_len = chunk_size
            .checked_mul(2 * 4)
            .and_then(|record| num_chunks.checked_mul(record))
            .and_then(|body| body.checked_add(PACKED_HEADER_LEN))
            .ok_or_else(|| anyhow::anyhow!("invalid packed file: header overflows"))?;
        if mmap.len() < expected_len {
            anyhow::bail!(
                "packed file truncated: expected {} bytes, got {}",
                expected_len,
                mmap.len()
            );
        }
        Ok(Self {
            mmap,
            chunk_size,
            num_chunks,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn len(&self) -> usize {
        self.num_chunks
    }

    pub fn is_empty(&self) -> bool {
        self.num_chunks == 0
    }

    pub fn num_tokens(&self) -> usize {
        self.num_chunks * self.chunk_size
    }

    /// Chunk `index`, or `None` past the end.
    pub fn get(&self, index: usize) -> Option<PackedExample> {
        if index >= self.num_chunks {
            return None;
        }
        let record = self.chunk_size * 2 * 4;
        let base = PACKED_HEADER_LEN + index * record;
        let ids = self.read_u32s(base, self.chunk_size);
        let mask = self.read_u32s(base + self.chunk_size * 4, self.chunk_size);
        Some(PackedExample::causal(ids, mask))
    }

    /// Yield consecutive runs of up to `batch_size` chunks.
    pub fn batches(&self, batch_size: usize) -> impl Iterator<Item = Vec<PackedExample>> + '_ {
        let step = batch_size.max(1);
        (0..self.num_chunks)
            .step_by(step)
            .map(move |start| {
                let end = (start + step).min(self.num_chunks);
                (start..end).filter_map(|i| self.get(i)).collect()
            })
    }

    #[inline]
    fn read_u32s(&self, byte_offset: usize, count: usize) -> Vec<u32> {
        self.mmap[byte_offset..byte_offset + count * 4]
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    }
}

#[inline]
fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

// ── Collation ───────────────────────────────────────────────────────────────

/// `(batch, chunk_size)` u32 tensors ready for a causal-LM forward pass.
#[derive(Debug, Clone)]
pub struct PackedBatch {
    pub input_ids: Tensor,
    pub attention_mask: Tensor,
    pub labels: Tensor,
}

/// Stack packed examples into tensors. All examples must share one length.
pub fn collate(examples: &[PackedExample], device: &Device) -> Result<PackedBatch> {
    let batch_size = examples.len();
    let seq_len = examples.first().map(|e| e.len()).unwrap_or(0);
    if let Some(bad) = examples.iter().find(|e| e.len() != seq_len) {
        candle_core::bail!(
            "cannot collate chunks of different lengths: {} vs {}",
            bad.len(),
            seq_len
        );
    }
    let ids: Vec<u32> = examples.iter().flat_map(|e| e.input_ids.iter().copied()).collect();
    let mask: Vec<u32> = examples
        .iter()
        .flat_map(|e| e.attention_mask.iter().copied())
        .collect();
    let labels: Vec<u32> = examples.iter().flat_map(|e| e.labels.iter().copied()).collect();

    let input_ids = Tensor::from_vec(ids, (batch_size, seq_len), device)?;
    let attention_mask = Tensor::from_vec(mask, (batch_size, seq_len), device)?;
    let labels = Tensor::from_vec(labels, (batch_size, seq_len), device)?;
    Ok(PackedBatch {
        input_ids,
        attention_mask,
        labels,
    })
}

// ── Tests ───────────────────────────────────────────────────────────────────
