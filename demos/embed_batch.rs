//! Example: embed a ragged batch of spectrograms and inspect the windows.
//!
//! Usage: cargo run --release --example embed_batch

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use style_embed_rs::{EmbedOptions, GstStyleEncoder, StyleEmbedding, StyleEmbeddingConfig};

fn main() -> style_embed_rs::Result<()> {
    tracing_subscriber::fmt::init();

    let device = Device::Cpu;
    let cfg = StyleEmbeddingConfig::default();

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = StyleEmbedding::new(&cfg, GstStyleEncoder::new(&cfg, vb)?)?;

    let lengths = [142, 128, 300, 17];
    let l_max = 300;
    let batch = Tensor::randn(0f32, 1.0, (lengths.len(), l_max, cfg.feature_dim), &device)?;
    let mut rng = ChaCha8Rng::seed_from_u64(1337);

    let plans = model.normalizer().plan(&lengths, l_max, &mut rng.clone())?;
    for (len, plan) in lengths.iter().zip(&plans) {
        println!("length {len:>3} → {plan:?}");
    }

    let out = model.forward(&batch, &lengths, EmbedOptions::default(), &mut rng)?;
    println!("embeddings: {:?}", out.embedding().dims());
    println!(
        "token regularization: {:.4}",
        model.regularization_loss()?.to_scalar::<f32>()?
    );
    Ok(())
}
