//! Style embeddings from variable-length spectrograms, in pure Rust.
//!
//! A candle-based style/speaker encoder for conditioning speech synthesis.
//! Takes a padded batch of spectrograms plus their true lengths and returns
//! one fixed-size embedding per element.
//!
//! ## Architecture
//!
//! ```text
//! [B, L_max, 80] + lengths
//!          ↓
//!   window normalizer (slice → double → random crop)
//!          ↓
//!   [B, 256, 80], no padding
//!          ↓
//!   style aggregator (GST: reference encoder + style tokens)
//!          ↓
//!   [B, 256] embeddings (+ intermediate outputs)
//! ```
//!
//! ## Modules
//!
//! - [`window`] — fixed-length windowing of padded batches
//! - [`aggregator`] — the style encoder capability trait
//! - [`gst`] — global style token encoder
//! - [`embedding`] — normalizer + aggregator in one call
//! - [`loss`] — log STFT magnitude loss
//! - [`config`] — window, embedding, and encoder sizes

pub mod aggregator;
pub mod config;
pub mod embedding;
pub mod gst;
pub mod loss;
pub mod window;

mod error;

pub use aggregator::{EmbedMode, StyleAggregator, StyleOutput};
pub use config::StyleEmbeddingConfig;
pub use embedding::{EmbedOptions, StyleEmbedding};
pub use error::{Error, Result};
pub use gst::GstStyleEncoder;
pub use window::{SequenceWindowNormalizer, WindowPlan};
