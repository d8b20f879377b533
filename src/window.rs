//! Sequence window normalization.
//!
//! Turns a padded batch `[N, L_max, F]` plus true lengths into a batch of
//! fixed-length windows `[N, W, F]` that contain no padding:
//!
//! ```text
//! x[n, :len]  ──double──▶ len·2^k ≥ W ──crop──▶ W frames
//!                                       (random offset if > W,
//!                                        as is if == W)
//! ```
//!
//! Because the doubled sequence is periodic, output frame `k` of example `n`
//! is source frame `(offset + k) mod len`. All N windows are therefore built
//! with a single `index_select` over the flattened batch instead of N slices
//! followed by a stack.

use std::cmp::Ordering;

use candle_core::Tensor;
use rand::Rng;

use crate::config::StyleEmbeddingConfig;
use crate::{Error, Result};

/// How a single example is cut down to the window size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPlan {
    /// Doubled length is exactly the window size. No randomness involved.
    Exact,
    /// Doubled length exceeds the window size; take `W` frames from `offset`.
    Crop { offset: usize, doubled: usize },
}

impl WindowPlan {
    /// Start frame within the doubled sequence.
    pub fn offset(&self) -> usize {
        match *self {
            WindowPlan::Exact => 0,
            WindowPlan::Crop { offset, .. } => offset,
        }
    }
}

/// Length after doubling `true_length` once, then again while shorter than
/// `window_size`.
///
/// A zero length cannot grow and is returned as 0.
pub fn doubled_length(true_length: usize, window_size: usize) -> usize {
    let mut len = true_length.saturating_mul(2);
    while len > 0 && len < window_size {
        len = len.saturating_mul(2);
    }
    len
}

/// Decide how one example of length `true_length` becomes a window.
///
/// Draws from `rng` only when the doubled length strictly exceeds the window.
pub fn plan_window<R: Rng + ?Sized>(
    true_length: usize,
    window_size: usize,
    rng: &mut R,
) -> Result<WindowPlan> {
    let doubled = doubled_length(true_length, window_size);
    match doubled.cmp(&window_size) {
        Ordering::Greater => Ok(WindowPlan::Crop {
            offset: rng.random_range(0..doubled - window_size),
            doubled,
        }),
        Ordering::Equal => Ok(WindowPlan::Exact),
        Ordering::Less => Err(Error::Invariant(format!(
            "length {true_length} doubled to {doubled}, still below window size {window_size}"
        ))),
    }
}

/// Read a length vector out of an integer tensor of shape `[N]` or `[N, 1]`.
pub fn lengths_from_tensor(lengths: &Tensor) -> Result<Vec<usize>> {
    if lengths.dtype().is_float() {
        return Err(Error::invalid_input(format!(
            "lengths must be an integer tensor, got {:?}",
            lengths.dtype()
        )));
    }
    let values: Vec<i64> = lengths
        .flatten_all()?
        .to_dtype(candle_core::DType::I64)?
        .to_vec1()?;
    values
        .into_iter()
        .enumerate()
        .map(|(i, v)| {
            usize::try_from(v)
                .map_err(|_| Error::invalid_input(format!("length[{i}] = {v} is negative")))
        })
        .collect()
}

/// Converts padded variable-length batches into fixed-length windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceWindowNormalizer {
    window_size: usize,
    feature_dim: usize,
}

impl SequenceWindowNormalizer {
    pub fn new(window_size: usize, feature_dim: usize) -> Result<Self> {
        if window_size == 0 || feature_dim == 0 {
            return Err(Error::Config(format!(
                "window_size ({window_size}) and feature_dim ({feature_dim}) must be > 0"
            )));
        }
        Ok(Self {
            window_size,
            feature_dim,
        })
    }

    pub fn from_config(cfg: &StyleEmbeddingConfig) -> Result<Self> {
        Self::new(cfg.window_size, cfg.feature_dim)
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    /// Validate the batch against `lengths`. Returns `(N, L_max)`.
    fn check_batch(&self, batch: &Tensor, lengths: &[usize]) -> Result<(usize, usize)> {
        let (n, l_max, f) = batch.dims3().map_err(|_| {
            Error::invalid_input(format!(
                "batch must be [N, L_max, F], got shape {:?}",
                batch.dims()
            ))
        })?;
        if f != self.feature_dim {
            return Err(Error::invalid_input(format!(
                "batch has {f} features per frame, expected {}",
                self.feature_dim
            )));
        }
        self.check_lengths(lengths, n, l_max)?;
        Ok((n, l_max))
    }

    fn check_lengths(&self, lengths: &[usize], n: usize, l_max: usize) -> Result<()> {
        if lengths.len() != n {
            return Err(Error::invalid_input(format!(
                "batch holds {n} sequences but {} lengths were given",
                lengths.len()
            )));
        }
        for (i, &len) in lengths.iter().enumerate() {
            if len == 0 {
                return Err(Error::invalid_input(format!("length[{i}] is 0")));
            }
            if len > l_max {
                return Err(Error::invalid_input(format!(
                    "length[{i}] = {len} exceeds padded length {l_max}"
                )));
            }
        }
        Ok(())
    }

    /// Plan every example of a batch whose padded length is `l_max`.
    ///
    /// Lengths are validated before anything is drawn from `rng`.
    pub fn plan<R: Rng + ?Sized>(
        &self,
        lengths: &[usize],
        l_max: usize,
        rng: &mut R,
    ) -> Result<Vec<WindowPlan>> {
        self.check_lengths(lengths, lengths.len(), l_max)?;
        lengths
            .iter()
            .map(|&len| plan_window(len, self.window_size, rng))
            .collect()
    }

    /// Normalize a padded batch `[N, L_max, F]` to `[N, W, F]`.
    ///
    /// Any malformed input aborts the whole call; no partial batch is produced.
    pub fn normalize<R: Rng + ?Sized>(
        &self,
        batch: &Tensor,
        lengths: &[usize],
        rng: &mut R,
    ) -> Result<Tensor> {
        let (n, l_max) = self.check_batch(batch, lengths)?;
        let w = self.window_size;
        let f = self.feature_dim;

        if n == 0 {
            return Ok(Tensor::zeros((0, w, f), batch.dtype(), batch.device())?);
        }

        let plans = self.plan(lengths, l_max, rng)?;

        // Row ids into the flattened [N * L_max, F] batch.
        let mut rows = Vec::with_capacity(n * w);
        for (i, (plan, &len)) in plans.iter().zip(lengths).enumerate() {
            let base = i * l_max;
            let offset = plan.offset();
            rows.extend((0..w).map(|k| base + (offset + k) % len));
        }
        let rows = rows
            .into_iter()
            .map(u32::try_from)
            .collect::<std::result::Result<Vec<u32>, _>>()
            .map_err(|_| Error::invalid_input("batch too large to index with u32"))?;

        tracing::debug!(
            batch = n,
            padded_len = l_max,
            window = w,
            crops = plans
                .iter()
                .filter(|p| matches!(p, WindowPlan::Crop { .. }))
                .count(),
            "normalizing spectrogram batch"
        );

        let index = Tensor::new(rows.as_slice(), batch.device())?;
        let windows = batch
            .reshape((n * l_max, f))?
            .index_select(&index, 0)?
            .reshape((n, w, f))?;
        Ok(windows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, IndexOp};
    use rand::{RngCore, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    /// ChaCha8Rng that counts how many times it was asked for entropy.
    struct CountingRng {
        inner: ChaCha8Rng,
        calls: usize,
    }

    impl CountingRng {
        fn new(seed: u64) -> Self {
            Self {
                inner: ChaCha8Rng::seed_from_u64(seed),
                calls: 0,
            }
        }
    }

    impl RngCore for CountingRng {
        fn next_u32(&mut self) -> u32 {
            self.calls += 1;
            self.inner.next_u32()
        }

        fn next_u64(&mut self) -> u64 {
            self.calls += 1;
            self.inner.next_u64()
        }

        fn fill_bytes(&mut self, dst: &mut [u8]) {
            self.calls += 1;
            self.inner.fill_bytes(dst)
        }
    }

    const PAD: f32 = -1000.0;

    /// Batch where frame `t` of example `n` holds `t` in every feature,
    /// and padding frames hold [`PAD`].
    fn frame_index_batch(lengths: &[usize], l_max: usize, f: usize) -> Tensor {
        let mut data = Vec::with_capacity(lengths.len() * l_max * f);
        for &len in lengths {
            for t in 0..l_max {
                let v = if t < len { t as f32 } else { PAD };
                data.extend(std::iter::repeat_n(v, f));
            }
        }
        Tensor::from_vec(data, (lengths.len(), l_max, f), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_doubled_length() {
        assert_eq!(doubled_length(142, 256), 284);
        assert_eq!(doubled_length(128, 256), 256);
        assert_eq!(doubled_length(1, 256), 256);
        assert_eq!(doubled_length(3, 256), 384);
        // Longer than the window still doubles once.
        assert_eq!(doubled_length(300, 256), 600);
        assert_eq!(doubled_length(0, 256), 0);
    }

    #[test]
    fn test_plan_zero_length_is_invariant_error() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let err = plan_window(0, 16, &mut rng).unwrap_err();
        assert!(matches!(err, Error::Invariant(_)), "{err}");
    }

    #[test]
    fn test_output_shape() {
        let norm = SequenceWindowNormalizer::new(16, 4).unwrap();
        let lengths = [1, 5, 8, 20, 33];
        let batch = frame_index_batch(&lengths, 33, 4);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let out = norm.normalize(&batch, &lengths, &mut rng).unwrap();
        assert_eq!(out.dims(), &[5, 16, 4]);
        assert_eq!(out.dtype(), DType::F32);
    }

    #[test]
    fn test_padding_never_reaches_output() {
        let norm = SequenceWindowNormalizer::new(16, 3).unwrap();
        let lengths = [2, 7, 9, 40];
        let batch = frame_index_batch(&lengths, 40, 3);
        for seed in 0..20 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let out = norm.normalize(&batch, &lengths, &mut rng).unwrap();
            let vals: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
            assert!(vals.iter().all(|&v| v != PAD), "padding leaked (seed {seed})");
        }
    }

    #[test]
    fn test_half_window_doubles_once_without_randomness() {
        let norm = SequenceWindowNormalizer::new(16, 2).unwrap();
        let lengths = [8];
        let batch = frame_index_batch(&lengths, 12, 2);
        let mut rng = CountingRng::new(3);

        let out = norm.normalize(&batch, &lengths, &mut rng).unwrap();
        assert_eq!(rng.calls, 0);

        let frames: Vec<f32> = out.i((0, .., 0)).unwrap().to_vec1().unwrap();
        let expected: Vec<f32> = (0..16).map(|k| (k % 8) as f32).collect();
        assert_eq!(frames, expected);
    }

    #[test]
    fn test_exact_window_skips_rng() {
        let norm = SequenceWindowNormalizer::new(256, 1).unwrap();
        let mut rng = CountingRng::new(0);
        let plans = norm.plan(&[128, 64, 1], 128, &mut rng).unwrap();
        assert_eq!(plans, vec![WindowPlan::Exact; 3]);
        assert_eq!(rng.calls, 0);
    }

    #[test]
    fn test_length_one_repeats_single_frame() {
        let norm = SequenceWindowNormalizer::new(16, 2).unwrap();
        let data = vec![4.0f32, 5.0, PAD, PAD, PAD, PAD];
        let batch = Tensor::from_vec(data, (1, 3, 2), &Device::Cpu).unwrap();
        let mut rng = CountingRng::new(0);

        let out = norm.normalize(&batch, &[1], &mut rng).unwrap();
        let rows: Vec<Vec<f32>> = out.i(0).unwrap().to_vec2().unwrap();
        assert_eq!(rows.len(), 16);
        assert!(rows.iter().all(|r| r == &[4.0, 5.0]));
    }

    #[test]
    fn test_crop_uses_rng_and_stays_in_range() {
        let mut rng = CountingRng::new(11);
        for _ in 0..100 {
            match plan_window(142, 256, &mut rng).unwrap() {
                WindowPlan::Crop { offset, doubled } => {
                    assert_eq!(doubled, 284);
                    assert!(offset < 28);
                }
                WindowPlan::Exact => panic!("142 should need a crop"),
            }
        }
        assert!(rng.calls >= 100);
    }

    #[test]
    fn test_end_to_end_142_frames() {
        let norm = SequenceWindowNormalizer::new(256, 80).unwrap();
        let batch = frame_index_batch(&[142], 200, 80);
        let mut rng = ChaCha8Rng::seed_from_u64(42);

        let out = norm.normalize(&batch, &[142], &mut rng).unwrap();
        assert_eq!(out.dims(), &[1, 256, 80]);

        let expected_offset = {
            let mut rng = ChaCha8Rng::seed_from_u64(42);
            plan_window(142, 256, &mut rng).unwrap().offset()
        };
        assert!(expected_offset < 28);

        let rows: Vec<Vec<f32>> = out.i(0).unwrap().to_vec2().unwrap();
        for (k, row) in rows.iter().enumerate() {
            let src = ((expected_offset + k) % 142) as f32;
            assert!(row.iter().all(|&v| v == src), "row {k}");
        }
    }

    #[test]
    fn test_same_seed_same_output() {
        let norm = SequenceWindowNormalizer::new(32, 5).unwrap();
        let lengths = [3, 17, 25];
        let batch = Tensor::randn(0f32, 1.0, (3, 25, 5), &Device::Cpu).unwrap();

        let run = |seed| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            norm.normalize(&batch, &lengths, &mut rng).unwrap()
        };
        let a: Vec<Vec<Vec<f32>>> = run(9).to_vec3().unwrap();
        let b: Vec<Vec<Vec<f32>>> = run(9).to_vec3().unwrap();
        assert_eq!(a, b);

        for seed in 0..5 {
            assert_eq!(run(seed).dims(), &[3, 32, 5]);
        }
    }

    #[test]
    fn test_rejects_zero_length_before_rng() {
        let norm = SequenceWindowNormalizer::new(16, 2).unwrap();
        let batch = frame_index_batch(&[4, 4], 4, 2);
        let mut rng = CountingRng::new(0);
        let err = norm.normalize(&batch, &[4, 0], &mut rng).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)), "{err}");
        assert_eq!(rng.calls, 0);
    }

    #[test]
    fn test_rejects_length_past_padding() {
        let norm = SequenceWindowNormalizer::new(16, 2).unwrap();
        let batch = frame_index_batch(&[4], 4, 2);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let err = norm.normalize(&batch, &[5], &mut rng).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)), "{err}");
    }

    #[test]
    fn test_rejects_batch_size_mismatch() {
        let norm = SequenceWindowNormalizer::new(16, 2).unwrap();
        let batch = frame_index_batch(&[4, 4], 4, 2);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let err = norm.normalize(&batch, &[4], &mut rng).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)), "{err}");
    }

    #[test]
    fn test_rejects_wrong_rank_and_features() {
        let norm = SequenceWindowNormalizer::new(16, 2).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);

        let flat = Tensor::zeros((4, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            norm.normalize(&flat, &[4], &mut rng),
            Err(Error::InvalidInput(_))
        ));

        let wide = Tensor::zeros((1, 4, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            norm.normalize(&wide, &[4], &mut rng),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_empty_batch() {
        let norm = SequenceWindowNormalizer::new(16, 2).unwrap();
        let batch = Tensor::zeros((0, 4, 2), DType::F32, &Device::Cpu).unwrap();
        let mut rng = CountingRng::new(0);
        let out = norm.normalize(&batch, &[], &mut rng).unwrap();
        assert_eq!(out.dims(), &[0, 16, 2]);
        assert_eq!(rng.calls, 0);
    }

    #[test]
    fn test_lengths_from_tensor() {
        let dev = Device::Cpu;
        let col = Tensor::new(&[[142i64], [3], [7]], &dev).unwrap();
        assert_eq!(lengths_from_tensor(&col).unwrap(), vec![142, 3, 7]);

        let u = Tensor::new(&[5u32, 6], &dev).unwrap();
        assert_eq!(lengths_from_tensor(&u).unwrap(), vec![5, 6]);

        let neg = Tensor::new(&[4i64, -1], &dev).unwrap();
        assert!(matches!(
            lengths_from_tensor(&neg),
            Err(Error::InvalidInput(_))
        ));

        let float = Tensor::new(&[4.0f32], &dev).unwrap();
        assert!(lengths_from_tensor(&float).is_err());
    }
}
