//! Data pipeline: raw sample loading, prompt templating, tokenisation.
//!
//! Raw samples are JSONL objects with `input_text` (persona) and
//! `output_text` (opening line). Each sample is rendered through the fixed
//! persona prompt and tokenised into ids plus an attention mask.
//!
//! * **[`SampleReader`]** — stream samples from files in fixed-size batches.
//! * **[`PromptTemplate`]** — raw sample → prompt string.
//! * **[`TokenSource`]** — prompt string → [`TokenizedExample`];
//!   [`HfTokenSource`] wraps a `tokenizer.json`.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use crate::config::PackConfig;

// ── Raw samples ─────────────────────────────────────────────────────────────

/// One persona/opening pair as stored in the source dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSample {
    /// Persona description; may contain a `<START>` marker.
    pub input_text: String,
    /// Opening line of the conversation.
    pub output_text: String,
}

/// Streams [`RawSample`]s from a JSONL file or a directory of them, one
/// batch at a time, without loading everything into memory.
pub struct SampleReader {
    files: Vec<PathBuf>,
    current_file_index: usize,
    current_reader: Option<BufReader<File>>,
    current_line: usize,
    batch_size: usize,
}

impl SampleReader {
    pub fn new(path: &Path, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            anyhow::bail!("batch_size must be positive");
        }
        let files = collect_files(path)?;
        if files.is_empty() {
            anyhow::bail!("no .jsonl/.json files found at {}", path.display());
        }
        let first = File::open(&files[0])
            .with_context(|| format!("open {}", files[0].display()))?;
        Ok(Self {
            files,
            current_file_index: 0,
            current_reader: Some(BufReader::new(first)),
            current_line: 0,
            batch_size,
        })
    }

    /// Files this reader will visit, in order.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Next batch of up to `batch_size` samples, or `None` once every file is
    /// exhausted.
    pub fn next_batch(&mut self) -> Result<Option<Vec<RawSample>>> {
        let mut batch = Vec::with_capacity(self.batch_size);
        let mut line_buf = String::new();
        while batch.len() < self.batch_size {
            let reader = match &mut self.current_reader {
                Some(r) => r,
                None => break,
            };
            line_buf.clear();
            let bytes_read = reader.read_line(&mut line_buf)?;
            if bytes_read == 0 {
                // EOF on current file — advance to next
                self.current_reader = None;
                self.current_file_index += 1;
                self.current_line = 0;
                if self.current_file_index >= self.files.len() {
                    break;
                }
                let path = &self.files[self.current_file_index];
                tracing::debug!(file = %path.display(), "reading samples");
                let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
                self.current_reader = Some(BufReader::new(f));
                continue;
            }
            self.current_line += 1;
            let line = line_buf.trim();
            if line.is_empty() {
                continue;
            }
            let sample: RawSample = serde_json::from_str(line).with_context(|| {
                format!(
                    "parse sample at {}:{}",
                    self.files[self.current_file_index].display(),
                    self.current_line
                )
            })?;
            batch.push(sample);
        }
        if batch.is_empty() {
            Ok(None)
        } else {
            Ok(Some(batch))
        }
    }
}

// ── Prompt template ─────────────────────────────────────────────────────────

/// Renders a [`RawSample`] into the persona prompt:
///
/// ```text
/// Have an engaging conversation while in this persona: \n{persona}\n---Start:\n{opening}{eos}
/// ```
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    eos_token: String,
    strip_markers: Vec<String>,
}

impl PromptTemplate {
    pub fn new(eos_token: impl Into<String>, strip_markers: Vec<String>) -> Self {
        Self {
            eos_token: eos_token.into(),
            strip_markers,
        }
    }

    pub fn from_config(config: &PackConfig) -> Self {
        Self::new(config.eos_token.clone(), config.strip_markers.clone())
    }

    pub fn render(&self, sample: &RawSample) -> String {
        let mut persona = sample.input_text.clone();
        for marker in &self.strip_markers {
            if !marker.is_empty() {
                persona = persona.replace(marker.as_str(), "");
            }
        }
        format!(
            "Have an engaging conversation while in this persona: \n{persona}\n---Start:\n{opening}{eos}",
            opening = sample.output_text,
            eos = self.eos_token,
        )
    }
}

// ── Tokenisation ────────────────────────────────────────────────────────────

/// Token ids of one rendered sample and the parallel attention mask.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizedExample {
    pub ids: Vec<u32>,
    pub mask: Vec<u32>,
}

impl TokenizedExample {
    pub fn new(ids: Vec<u32>, mask: Vec<u32>) -> Self {
        Self { ids, mask }
    }

    /// Example whose every position is attended to.
    pub fn unmasked(ids: Vec<u32>) -> Self {
        let mask = vec![1; ids.len()];
        Self { ids, mask }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Anything that turns prompt text into a [`TokenizedExample`].
///
/// Implementations must be shareable across rayon workers; packing itself
/// stays on the caller's thread.
pub trait TokenSource: Sync {
    fn encode(&self, text: &str) -> Result<TokenizedExample>;

    /// Encode a batch in parallel. Results keep the input order.
    fn encode_batch(&self, texts: &[String]) -> Result<Vec<TokenizedExample>> {
        texts.par_iter().map(|t| self.encode(t)).collect()
    }
}

/// [`TokenSource`] backed by a HuggingFace `tokenizer.json`.
pub struct HfTokenSource {
    tokenizer: Tokenizer,
    add_special_tokens: bool,
}

impl HfTokenSource {
    pub fn from_file(tokenizer_path: &Path, add_special_tokens: bool) -> Result<Self> {
        let tokenizer =
            Tokenizer::from_file(tokenizer_path.as_os_str().to_string_lossy().to_string())
                .map_err(|e| anyhow::anyhow!("load tokenizer: {e}"))?;
        Ok(Self::new(tokenizer, add_special_tokens))
    }

    pub fn new(tokenizer: Tokenizer, add_special_tokens: bool) -> Self {
        Self {
            tokenizer,
            add_special_tokens,
        }
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Decode ids back to text, keeping special tokens visible.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(ids, false)
            .map_err(|e| anyhow::anyhow!("decode: {e}"))
    }
}

impl TokenSource for HfTokenSource {
    fn encode(&self, text: &str) -> Result<TokenizedExample> {
        let enc = self
            .tokenizer
            .encode(text, self.add_special_tokens)
            .map_err(|e| anyhow::anyhow!("tokenize: {e}"))?;
        Ok(TokenizedExample::new(
            enc.get_ids().to_vec(),
            enc.get_attention_mask().to_vec(),
        ))
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Collect JSONL files from a path (file or directory), sorted.
fn collect_files(path: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    if path.is_file() {
        out.push(path.to_path_buf());
    } else if path.is_dir() {
        let mut entries: Vec<_> = std::fs::read_dir(path)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.is_file()
                    && p.extension()
                        .map(|e| e == "jsonl" || e == "json")
                        .unwrap_or(false)
            })
            .collect();
        entries.sort();
        out = entries;
    } else {
        anyhow::bail!("path is neither file nor directory: {}", path.display());
    }
    Ok(out)
}

// ── Tests ───────────────────────────────────────────────────────────────────
