//! Configuration for the style embedding pipeline.
//!
//! Defaults match the original 80-bin spectrogram setup: 256-frame windows,
//! 256-dimensional embeddings, and a GST encoder with 2000 style tokens.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Top-level configuration. Fixed at construction time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StyleEmbeddingConfig {
    // --- Windowing ---
    pub window_size: usize,
    pub feature_dim: usize,

    // --- Output ---
    pub embedding_dim: usize,

    // --- Style token layer ---
    pub gst_tokens: usize,
    pub gst_heads: usize,

    // --- Reference encoder ---
    pub conv_layers: usize,
    pub conv_channels: Vec<usize>,
    pub conv_kernel_size: usize,
    pub conv_stride: usize,
    pub gru_layers: usize,
    pub gru_units: usize,
}

impl Default for StyleEmbeddingConfig {
    fn default() -> Self {
        Self {
            window_size: 256,
            feature_dim: 80,
            embedding_dim: 256,
            gst_tokens: 2000,
            gst_heads: 8,
            conv_layers: 6,
            conv_channels: vec![32, 32, 64, 64, 128, 128],
            conv_kernel_size: 3,
            conv_stride: 2,
            gru_layers: 1,
            gru_units: 256,
        }
    }
}

impl StyleEmbeddingConfig {
    /// Load a config from a JSON file. Missing fields fall back to defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let cfg: Self = serde_json::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check that all sizes are usable.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("window_size", self.window_size),
            ("feature_dim", self.feature_dim),
            ("embedding_dim", self.embedding_dim),
            ("gst_tokens", self.gst_tokens),
            ("gst_heads", self.gst_heads),
            ("conv_layers", self.conv_layers),
            ("conv_kernel_size", self.conv_kernel_size),
            ("conv_stride", self.conv_stride),
            ("gru_layers", self.gru_layers),
            ("gru_units", self.gru_units),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(Error::Config(format!("{name} must be > 0")));
        }
        if self.embedding_dim % self.gst_heads != 0 {
            return Err(Error::Config(format!(
                "embedding_dim ({}) must be divisible by gst_heads ({})",
                self.embedding_dim, self.gst_heads
            )));
        }
        if self.conv_channels.len() != self.conv_layers {
            return Err(Error::Config(format!(
                "conv_channels has {} entries, expected conv_layers = {}",
                self.conv_channels.len(),
                self.conv_layers
            )));
        }
        if self.conv_channels.contains(&0) {
            return Err(Error::Config("conv_channels must all be > 0".into()));
        }
        Ok(())
    }

    /// Per-head width of the style token bank.
    pub fn token_dim(&self) -> usize {
        self.embedding_dim / self.gst_heads
    }

    /// Output length of one strided conv along an axis of length `len`.
    ///
    /// Padding is `(kernel - 1) / 2`, so odd kernels preserve length at stride 1.
    pub fn conv_out_len(&self, len: usize) -> usize {
        let pad = (self.conv_kernel_size - 1) / 2;
        (len + 2 * pad).saturating_sub(self.conv_kernel_size) / self.conv_stride + 1
    }

    /// Feature-axis width after all conv layers.
    pub fn reference_feature_len(&self) -> usize {
        (0..self.conv_layers).fold(self.feature_dim, |len, _| self.conv_out_len(len))
    }

    /// Time-axis length after all conv layers.
    pub fn reference_time_len(&self) -> usize {
        (0..self.conv_layers).fold(self.window_size, |len, _| self.conv_out_len(len))
    }
}
