//! style-embed CLI — one forward pass through the style embedding pipeline.
//!
//! Builds a GST style encoder (random init, or weights from a safetensors
//! file), feeds it a batch of random padded spectrograms, and prints the
//! resulting shapes as a one-line JSON summary:
//!
//! ```json
//! {"input":[5,142,80],"embedding":[5,256],"aux":0,"params":1234,"regularization":0.5}
//! ```
//!
//! Exit code 0 on success, non-zero on error.

use std::path::PathBuf;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use style_embed_rs::gst::safetensors_parameter_count;
use style_embed_rs::{EmbedOptions, GstStyleEncoder, StyleEmbedding, StyleEmbeddingConfig};

#[derive(Parser, Debug)]
#[command(
    name = "style-embed",
    about = "Extract style embeddings from padded spectrogram batches",
    long_about = "Runs one forward pass of the window normalizer and GST style encoder\n\
                  on random input and prints a JSON summary of the output shapes."
)]
struct Args {
    /// Number of spectrograms in the batch.
    #[arg(long, short = 'b', default_value_t = 5)]
    batch_size: usize,

    /// Padded length of every spectrogram (frames).
    #[arg(long, short = 'l', default_value_t = 142)]
    length: usize,

    /// True lengths, comma separated. Defaults to --length for every element.
    #[arg(long, value_delimiter = ',')]
    lengths: Vec<usize>,

    /// JSON config file. Missing fields use the defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Safetensors weights. Omit for random initialization.
    #[arg(long, short = 'w')]
    weights: Option<PathBuf>,

    /// Seed for the input batch and the window offsets.
    #[arg(long, short = 's', default_value_t = 0)]
    seed: u64,

    /// Return the reference embedding instead of mixed style tokens.
    #[arg(long)]
    reference_only: bool,

    /// Also return intermediate outputs.
    #[arg(long)]
    all_outs: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let cfg = match &args.config {
        Some(path) => StyleEmbeddingConfig::from_json_file(path)
            .map_err(|e| anyhow::anyhow!("failed to load config {}: {e}", path.display()))?,
        None => StyleEmbeddingConfig::default(),
    };

    let lengths = if args.lengths.is_empty() {
        vec![args.length; args.batch_size]
    } else {
        args.lengths.clone()
    };
    if lengths.len() != args.batch_size {
        anyhow::bail!(
            "--lengths has {} entries but --batch-size is {}",
            lengths.len(),
            args.batch_size
        );
    }

    let device = Device::cuda_if_available(0)?;
    let dtype = DType::F32;
    tracing::info!("Using device: {:?}", device);

    let (encoder, params) = match &args.weights {
        Some(path) => {
            tracing::info!("Loading style encoder weights from {:?}", path);
            let encoder = GstStyleEncoder::from_safetensors(&cfg, &[path], dtype, &device)?;
            (encoder, safetensors_parameter_count(&[path])?)
        }
        None => {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, dtype, &device);
            let encoder = GstStyleEncoder::new(&cfg, vb)
                .map_err(|e| anyhow::anyhow!("failed to build style encoder: {e}"))?;
            let params: usize = varmap.all_vars().iter().map(|v| v.elem_count()).sum();
            (encoder, params)
        }
    };
    tracing::info!("GST parameter count: {params}");
    let model = StyleEmbedding::new(&cfg, encoder)?;

    let input = Tensor::randn(0f32, 1.0, (args.batch_size, args.length, cfg.feature_dim), &device)?;
    let mut rng = ChaCha8Rng::seed_from_u64(args.seed);
    let options = EmbedOptions {
        return_all_outs: args.all_outs,
        return_only_refs: args.reference_only,
    };

    let output = model
        .forward(&input, &lengths, options, &mut rng)
        .map_err(|e| anyhow::anyhow!("forward pass failed: {e}"))?;
    let regularization: f32 = model.regularization_loss()?.to_dtype(DType::F32)?.to_scalar()?;

    println!(
        r#"{{"input":{input:?},"embedding":{embedding:?},"aux":{aux},"params":{params},"regularization":{regularization}}}"#,
        input = input.dims(),
        embedding = output.embedding().dims(),
        aux = output.auxiliary().map_or(0, |a| a.len()),
    );

    Ok(())
}
