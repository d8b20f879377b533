//! Global style token (GST) encoder.
//!
//! Implements [`StyleAggregator`] for `[N, W, F]` spectrogram windows:
//!
//! ```text
//! [N, W, F] ─▶ [N, 1, W, F] ─▶ Conv2d/BN/ReLU × L ─▶ [N, W', C·F']
//!           ─▶ GRU stack ─▶ reference embedding [N, gru_units]
//!           ─▶ multi-head attention over tanh(style tokens) ─▶ [N, D]
//! ```

use std::path::Path;

use candle_core::{D, DType, Device, Module, ModuleT, Tensor};
use candle_nn::{self as nn, Init, RNN, VarBuilder};

use crate::aggregator::{EmbedMode, StyleAggregator, StyleOutput, check_windows};
use crate::config::StyleEmbeddingConfig;
use crate::{Error, Result};

/// Conv2d → BatchNorm → ReLU.
#[derive(Debug, Clone)]
struct ConvBlock {
    conv: nn::Conv2d,
    norm: nn::BatchNorm,
}

impl ConvBlock {
    fn new(cfg: &StyleEmbeddingConfig, in_c: usize, out_c: usize, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = nn::Conv2dConfig {
            padding: (cfg.conv_kernel_size - 1) / 2,
            stride: cfg.conv_stride,
            ..Default::default()
        };
        let conv = nn::conv2d(in_c, out_c, cfg.conv_kernel_size, conv_cfg, vb.pp("conv"))?;
        let norm = nn::batch_norm(out_c, 1e-5, vb.pp("norm"))?;
        Ok(Self { conv, norm })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.conv.forward(x)?;
        Ok(self.norm.forward_t(&h, false)?.relu()?)
    }
}

/// Convolutional reference encoder followed by a GRU stack.
#[derive(Debug, Clone)]
pub struct ReferenceEncoder {
    convs: Vec<ConvBlock>,
    grus: Vec<nn::GRU>,
}

impl ReferenceEncoder {
    pub fn new(cfg: &StyleEmbeddingConfig, vb: VarBuilder) -> Result<Self> {
        let mut convs = Vec::with_capacity(cfg.conv_layers);
        let mut in_c = 1;
        for (i, &out_c) in cfg.conv_channels.iter().enumerate() {
            convs.push(ConvBlock::new(cfg, in_c, out_c, vb.pp(format!("convs.{i}")))?);
            in_c = out_c;
        }

        let mut grus = Vec::with_capacity(cfg.gru_layers);
        let mut in_dim = in_c * cfg.reference_feature_len();
        for i in 0..cfg.gru_layers {
            grus.push(nn::gru(
                in_dim,
                cfg.gru_units,
                nn::GRUConfig::default(),
                vb.pp(format!("gru.{i}")),
            )?);
            in_dim = cfg.gru_units;
        }

        Ok(Self { convs, grus })
    }

    /// Forward pass.
    ///
    /// - `windows`: `[N, W, F]`
    ///
    /// Returns the reference embedding `[N, gru_units]` and each conv block's
    /// output `[N, C_i, W_i, F_i]`.
    pub fn forward(&self, windows: &Tensor) -> Result<(Tensor, Vec<Tensor>)> {
        let (n, _w, _f) = windows.dims3()?;
        let mut h = windows.unsqueeze(1)?;
        let mut conv_outs = Vec::with_capacity(self.convs.len());
        for block in &self.convs {
            h = block.forward(&h)?;
            conv_outs.push(h.clone());
        }

        // [N, C, W', F'] → [N, W', C·F']
        let (_, c, t, f) = h.dims4()?;
        let mut seq = h.transpose(1, 2)?.contiguous()?.reshape((n, t, c * f))?;

        let mut last = None;
        for gru in &self.grus {
            let hidden: Vec<Tensor> = gru.seq(&seq)?.iter().map(|s| s.h().clone()).collect();
            // [N, T', gru_units] for the next layer
            seq = Tensor::stack(&hidden, 1)?;
            last = hidden.last().cloned();
        }
        let ref_emb = last.ok_or_else(|| {
            Error::invalid_input("reference encoder produced an empty time axis")
        })?;

        Ok((ref_emb, conv_outs))
    }
}

/// Multi-head attention of reference embeddings over the style token bank.
#[derive(Debug, Clone)]
pub struct StyleTokenLayer {
    tokens: Tensor,
    linear_q: nn::Linear,
    linear_k: nn::Linear,
    linear_v: nn::Linear,
    linear_out: nn::Linear,
    num_heads: usize,
    head_dim: usize,
}

impl StyleTokenLayer {
    pub fn new(cfg: &StyleEmbeddingConfig, vb: VarBuilder) -> Result<Self> {
        let token_dim = cfg.token_dim();
        let tokens = vb.get_with_hints(
            (cfg.gst_tokens, token_dim),
            "gst_embs",
            Init::Randn {
                mean: 0.0,
                stdev: 0.5,
            },
        )?;
        let n_feat = cfg.embedding_dim;
        Ok(Self {
            tokens,
            linear_q: nn::linear(cfg.gru_units, n_feat, vb.pp("mha.linear_q"))?,
            linear_k: nn::linear(token_dim, n_feat, vb.pp("mha.linear_k"))?,
            linear_v: nn::linear(token_dim, n_feat, vb.pp("mha.linear_v"))?,
            linear_out: nn::linear(n_feat, n_feat, vb.pp("mha.linear_out"))?,
            num_heads: cfg.gst_heads,
            head_dim: n_feat / cfg.gst_heads,
        })
    }

    /// Raw (pre-tanh) token bank `[tokens, token_dim]`.
    pub fn tokens(&self) -> &Tensor {
        &self.tokens
    }

    /// `ref_embs`: `[N, gru_units]` → style embeddings `[N, D]`.
    pub fn forward(&self, ref_embs: &Tensor) -> Result<Tensor> {
        let n = ref_embs.dim(0)?;
        let num_tokens = self.tokens.dim(0)?;
        let (h, d) = (self.num_heads, self.head_dim);

        // [N, H, 1, d]
        let q = self
            .linear_q
            .forward(ref_embs)?
            .reshape((n, h, 1, d))?;

        // Keys and values shared across the batch: [1, H, T, d]
        let keys = self.tokens.tanh()?;
        let split = |t: Tensor| -> Result<Tensor> {
            Ok(t.reshape((num_tokens, h, d))?
                .transpose(0, 1)?
                .contiguous()?
                .unsqueeze(0)?)
        };
        let k = split(self.linear_k.forward(&keys)?)?;
        let v = split(self.linear_v.forward(&keys)?)?;

        let scale = 1.0 / (d as f64).sqrt();
        let scores = (q.broadcast_matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        let attn = candle_nn::ops::softmax_last_dim(&scores)?;
        let out = attn.broadcast_matmul(&v)?; // [N, H, 1, d]

        let out = out.reshape((n, h * d))?;
        Ok(self.linear_out.forward(&out)?)
    }
}

/// Total number of elements across all tensors in the given safetensors files.
pub fn safetensors_parameter_count<P: AsRef<Path>>(paths: &[P]) -> Result<usize> {
    let mut total = 0;
    for path in paths {
        let tensors = candle_core::safetensors::load(path.as_ref(), &Device::Cpu).map_err(|e| {
            Error::WeightLoad(format!("{}: {e}", path.as_ref().display()))
        })?;
        total += tensors.values().map(|t| t.elem_count()).sum::<usize>();
    }
    Ok(total)
}

/// GST style encoder: reference encoder + style token layer.
#[derive(Debug, Clone)]
pub struct GstStyleEncoder {
    ref_enc: ReferenceEncoder,
    stl: StyleTokenLayer,
    window_size: usize,
    feature_dim: usize,
    embedding_dim: usize,
}

impl GstStyleEncoder {
    pub fn new(cfg: &StyleEmbeddingConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let ref_enc = ReferenceEncoder::new(cfg, vb.pp("ref_enc"))?;
        let stl = StyleTokenLayer::new(cfg, vb.pp("stl"))?;

        tracing::info!(
            tokens = cfg.gst_tokens,
            heads = cfg.gst_heads,
            conv_layers = cfg.conv_layers,
            gru_layers = cfg.gru_layers,
            gru_steps = cfg.reference_time_len(),
            "GST style encoder ready"
        );

        Ok(Self {
            ref_enc,
            stl,
            window_size: cfg.window_size,
            feature_dim: cfg.feature_dim,
            embedding_dim: cfg.embedding_dim,
        })
    }

    /// Build from safetensors files via mmap.
    ///
    /// Missing files and missing or mis-shaped tensors are reported as
    /// [`Error::WeightLoad`].
    pub fn from_safetensors<P: AsRef<Path>>(
        cfg: &StyleEmbeddingConfig,
        paths: &[P],
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(paths, dtype, device)
                .map_err(|e| Error::WeightLoad(format!("style encoder weights: {e}")))?
        };
        Self::new(cfg, vb).map_err(|e| match e {
            Error::Candle(e) => Error::WeightLoad(format!("style encoder init: {e}")),
            other => other,
        })
    }
}

impl StyleAggregator for GstStyleEncoder {
    fn window_size(&self) -> usize {
        self.window_size
    }

    fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    fn embed(
        &self,
        windows: &Tensor,
        mode: EmbedMode,
        return_all_outs: bool,
    ) -> Result<StyleOutput> {
        check_windows(self, windows)?;
        let (ref_embs, conv_outs) = self.ref_enc.forward(windows)?;

        let embedding = match mode {
            EmbedMode::ReferenceOnly => ref_embs.clone(),
            EmbedMode::Full => self.stl.forward(&ref_embs)?,
        };

        if !return_all_outs {
            return Ok(StyleOutput::Embedding(embedding));
        }
        let mut auxiliary = conv_outs;
        auxiliary.push(ref_embs);
        Ok(StyleOutput::WithAuxiliary {
            embedding,
            auxiliary,
        })
    }

    /// Sum of pairwise cosine similarities between distinct style tokens.
    fn regularization_loss(&self) -> Result<Tensor> {
        let tokens = self.stl.tokens();
        let norms = tokens.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?.maximum(1e-8)?;
        let unit = tokens.broadcast_div(&norms)?;
        let gram = unit.matmul(&unit.t()?)?;
        let diag = unit.sqr()?.sum_all()?;
        Ok(((gram.sum_all()? - diag)? * 0.5)?)
    }
}
