//! Style embedding — padded spectrogram batch in, one embedding per example out.
//!
//! Combines [`SequenceWindowNormalizer`] with any [`StyleAggregator`]. The
//! style signal is learned through the downstream TTS objective, so this type
//! has no training loop of its own.

use candle_core::Tensor;
use rand::Rng;

use crate::aggregator::{EmbedMode, StyleAggregator, StyleOutput};
use crate::config::StyleEmbeddingConfig;
use crate::window::{SequenceWindowNormalizer, lengths_from_tensor};
use crate::{Error, Result};

/// Per-call output options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmbedOptions {
    /// Also return intermediate outputs for a feature-matching loss.
    pub return_all_outs: bool,
    /// Return the reference embedding instead of mixed style tokens.
    pub return_only_refs: bool,
}

impl EmbedOptions {
    pub fn mode(&self) -> EmbedMode {
        if self.return_only_refs {
            EmbedMode::ReferenceOnly
        } else {
            EmbedMode::Full
        }
    }
}

/// Window normalizer + style aggregator.
#[derive(Debug, Clone)]
pub struct StyleEmbedding<A> {
    normalizer: SequenceWindowNormalizer,
    aggregator: A,
}

impl<A: StyleAggregator> StyleEmbedding<A> {
    /// Pair `aggregator` with a normalizer built from `cfg`.
    ///
    /// Fails if the aggregator expects a different window or feature size.
    pub fn new(cfg: &StyleEmbeddingConfig, aggregator: A) -> Result<Self> {
        let normalizer = SequenceWindowNormalizer::from_config(cfg)?;
        if aggregator.window_size() != normalizer.window_size()
            || aggregator.feature_dim() != normalizer.feature_dim()
        {
            return Err(Error::Config(format!(
                "aggregator expects [_, {}, {}] windows, normalizer produces [_, {}, {}]",
                aggregator.window_size(),
                aggregator.feature_dim(),
                normalizer.window_size(),
                normalizer.feature_dim()
            )));
        }
        Ok(Self {
            normalizer,
            aggregator,
        })
    }

    pub fn normalizer(&self) -> &SequenceWindowNormalizer {
        &self.normalizer
    }

    pub fn aggregator(&self) -> &A {
        &self.aggregator
    }

    /// Forward pass.
    ///
    /// - `spectrograms`: `[B, L, F]`, padded to the longest element
    /// - `lengths`: true length of every element
    /// - `rng`: source for the random window offsets
    ///
    /// Returns `[B, D]` embeddings, plus intermediate outputs when
    /// `options.return_all_outs` is set.
    pub fn forward<R: Rng + ?Sized>(
        &self,
        spectrograms: &Tensor,
        lengths: &[usize],
        options: EmbedOptions,
        rng: &mut R,
    ) -> Result<StyleOutput> {
        let windows = self.normalizer.normalize(spectrograms, lengths, rng)?;
        tracing::debug!(
            input = ?spectrograms.dims(),
            windows = ?windows.dims(),
            mode = ?options.mode(),
            "style embedding forward"
        );
        self.aggregator
            .embed(&windows, options.mode(), options.return_all_outs)
    }

    /// [`forward`](Self::forward) with lengths given as an integer tensor
    /// of shape `[B]` or `[B, 1]`.
    pub fn forward_with_length_tensor<R: Rng + ?Sized>(
        &self,
        spectrograms: &Tensor,
        lengths: &Tensor,
        options: EmbedOptions,
        rng: &mut R,
    ) -> Result<StyleOutput> {
        let lengths = lengths_from_tensor(lengths)?;
        self.forward(spectrograms, &lengths, options, rng)
    }

    pub fn regularization_loss(&self) -> Result<Tensor> {
        self.aggregator.regularization_loss()
    }
}
