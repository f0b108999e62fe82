//! Packing configuration for rolepack.
//!
//! Serialised as JSON. Every field has a sensible default so a minimal `{}`
//! JSON produces a working configuration.

use serde::{Deserialize, Serialize};

/// Configuration for turning raw persona samples into packed training chunks.
///
/// Stored next to packed output for reproducibility. Missing fields fall back
/// to their `#[serde(default)]` values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackConfig {
    // ── Packing ─────────────────────────────────────────────────────────────
    /// Tokens per packed chunk. Must match the model's context length.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Raw samples tokenised per batch before packing.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    // ── Prompt / tokeniser ──────────────────────────────────────────────────
    /// Literal end-of-sequence marker appended to every rendered prompt.
    #[serde(default = "default_eos_token")]
    pub eos_token: String,
    /// Let the tokeniser add its own special tokens (e.g. BOS).
    #[serde(default = "default_true")]
    pub add_special_tokens: bool,
    /// Markers removed from the persona text before rendering.
    #[serde(default = "default_strip_markers")]
    pub strip_markers: Vec<String>,
}

// ── Default value functions ─────────────────────────────────────────────────

fn default_chunk_size() -> usize {
    2048
}
fn default_batch_size() -> usize {
    1000
}
fn default_eos_token() -> String {
    "</s>".to_string()
}
fn default_true() -> bool {
    true
}
fn default_strip_markers() -> Vec<String> {
    vec!["<START>".to_string()]
}

// ── Impl ────────────────────────────────────────────────────────────────────

impl Default for PackConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            batch_size: default_batch_size(),
            eos_token: default_eos_token(),
            add_special_tokens: true,
            strip_markers: default_strip_markers(),
        }
    }
}

impl PackConfig {
    /// Reject settings that can never produce output.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.chunk_size == 0 {
            anyhow::bail!("chunk_size must be positive");
        }
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be positive");
        }
        Ok(())
    }

    /// Save config to a JSON file.
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
