//! Log STFT magnitude loss.
//!
//! `L = mean(|ln(y_mag) - ln(x_mag)|)` over all elements.

use candle_core::Tensor;

use crate::{Error, Result};

/// L1 distance between log magnitudes of predicted and ground-truth spectrograms.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogStftMagnitudeLoss;

impl LogStftMagnitudeLoss {
    /// - `x_mag`: predicted magnitudes `[B, frames, bins]`
    /// - `y_mag`: ground-truth magnitudes, same shape
    ///
    /// Returns a scalar tensor.
    pub fn forward(&self, x_mag: &Tensor, y_mag: &Tensor) -> Result<Tensor> {
        log_stft_magnitude_loss(x_mag, y_mag)
    }
}

pub fn log_stft_magnitude_loss(x_mag: &Tensor, y_mag: &Tensor) -> Result<Tensor> {
    if x_mag.dims() != y_mag.dims() {
        return Err(Error::invalid_input(format!(
            "magnitude shapes differ: {:?} vs {:?}",
            x_mag.dims(),
            y_mag.dims()
        )));
    }
    let diff = (y_mag.log()? - x_mag.log()?)?;
    Ok(diff.abs()?.mean_all()?)
}
