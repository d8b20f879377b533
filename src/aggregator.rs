//! Style aggregation contract.
//!
//! A [`StyleAggregator`] maps a batch of fixed-length, padding-free windows
//! `[N, W, F]` to one embedding per example `[N, D]`. The window normalizer
//! and the [`StyleEmbedding`](crate::embedding::StyleEmbedding) facade only
//! depend on this trait, so any encoder (or a test stub) can be plugged in.

use candle_core::Tensor;

use crate::{Error, Result};

/// Which embedding the aggregator should return.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EmbedMode {
    /// Reference extraction followed by the learned token-mixing step.
    #[default]
    Full,
    /// Reference embedding only, skipping token mixing.
    ReferenceOnly,
}

/// Output of [`StyleAggregator::embed`].
///
/// `WithAuxiliary` is returned exactly when intermediate outputs were
/// requested; they feed a feature-matching loss computed by the caller.
#[derive(Debug, Clone)]
pub enum StyleOutput {
    Embedding(Tensor),
    WithAuxiliary {
        embedding: Tensor,
        auxiliary: Vec<Tensor>,
    },
}

impl StyleOutput {
    /// The `[N, D]` embedding, whichever shape was returned.
    pub fn embedding(&self) -> &Tensor {
        match self {
            StyleOutput::Embedding(e) => e,
            StyleOutput::WithAuxiliary { embedding, .. } => embedding,
        }
    }

    /// Intermediate outputs, if they were requested.
    pub fn auxiliary(&self) -> Option<&[Tensor]> {
        match self {
            StyleOutput::Embedding(_) => None,
            StyleOutput::WithAuxiliary { auxiliary, .. } => Some(auxiliary),
        }
    }

    pub fn into_embedding(self) -> Tensor {
        match self {
            StyleOutput::Embedding(e) => e,
            StyleOutput::WithAuxiliary { embedding, .. } => embedding,
        }
    }
}

/// Capability interface for style encoders.
pub trait StyleAggregator {
    /// Number of frames per input window (W).
    fn window_size(&self) -> usize;

    /// Features per frame (F).
    fn feature_dim(&self) -> usize;

    /// Embedding width in [`EmbedMode::Full`] (D).
    fn embedding_dim(&self) -> usize;

    /// Embed a `[N, W, F]` window batch.
    ///
    /// - `mode`: full token mixing or reference embedding only
    /// - `return_all_outs`: also return intermediate representations
    fn embed(&self, windows: &Tensor, mode: EmbedMode, return_all_outs: bool)
    -> Result<StyleOutput>;

    /// Scalar regularization penalty over the aggregator's own parameters.
    fn regularization_loss(&self) -> Result<Tensor>;
}

/// Check that `windows` is `[N, W, F]` for the given aggregator. Returns N.
pub fn check_windows<A: StyleAggregator + ?Sized>(aggregator: &A, windows: &Tensor) -> Result<usize> {
    match windows.dims() {
        &[n, w, f] if w == aggregator.window_size() && f == aggregator.feature_dim() => Ok(n),
        dims => Err(Error::invalid_input(format!(
            "expected windows [N, {}, {}], got {:?}",
            aggregator.window_size(),
            aggregator.feature_dim(),
            dims
        ))),
    }
}
