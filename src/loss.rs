//! Margin-aware preference loss
//!
//! The batch holds the preferred halves first and the rejected halves second.
//! Per-example denoising errors are mapped through `f(x) = s·x / (e^{s·x} − 1)`
//! and the difference between the two halves, scaled by the number of
//! training timesteps, is pushed through a log-sigmoid.

use anyhow::Result;
use candle_core::{DType, Tensor, D};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreferenceLossConfig {
    /// `s` in the error mapping
    pub snr_value: f64,
    /// Weight of the margin term
    pub beta_mapo: f64,
    pub num_train_timesteps: usize,
}

impl Default for PreferenceLossConfig {
    fn default() -> Self {
        Self {
            snr_value: 5.0,
            beta_mapo: 0.1,
            num_train_timesteps: 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PreferenceLoss {
    /// Scalar objective
    pub loss: Tensor,
    /// `[B/2]` errors of the preferred halves
    pub model_losses_w: Tensor,
    /// `[B/2]` errors of the rejected halves
    pub model_losses_l: Tensor,
    /// `[B/2]` `beta · log_sigmoid(log_odds · T)`
    pub ratio_losses: Tensor,
}

impl PreferenceLoss {
    /// `(loss, mean(w), mean(l), mean(ratio))` as plain numbers for logging
    pub fn summary(&self) -> Result<(f32, f32, f32, f32)> {
        let scalar = |t: &Tensor| -> Result<f32> {
            Ok(t.to_dtype(DType::F32)?.mean_all()?.to_scalar::<f32>()?)
        };
        Ok((
            scalar(&self.loss)?,
            scalar(&self.model_losses_w)?,
            scalar(&self.model_losses_l)?,
            scalar(&self.ratio_losses)?,
        ))
    }
}

/// Numerically stable `ln(sigmoid(x))`: `min(x, 0) − ln(1 + e^{−|x|})`
pub fn log_sigmoid(x: &Tensor) -> Result<Tensor> {
    let min = x.minimum(0f64)?;
    let softplus = x.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    Ok((min - softplus)?)
}

/// `s·x / (e^{s·x} − 1)`
fn error_mapping(x: &Tensor, snr_value: f64) -> Result<Tensor> {
    let scaled = x.affine(snr_value, 0.0)?;
    let denom = scaled.exp()?.affine(1.0, -1.0)?;
    Ok(scaled.div(&denom)?)
}

/// Preference loss over a `[B, ...]` prediction where `B` is even
pub fn preference_loss(
    model_pred: &Tensor,
    target: &Tensor,
    config: &PreferenceLossConfig,
) -> Result<PreferenceLoss> {
    if model_pred.dims() != target.dims() {
        anyhow::bail!(
            "Prediction shape {:?} does not match target shape {:?}",
            model_pred.dims(),
            target.dims()
        );
    }
    let batch = model_pred.dim(0)?;
    if batch == 0 || batch % 2 != 0 {
        anyhow::bail!("Preference batch must hold an even number of rows, got {}", batch);
    }

    let pred = model_pred.to_dtype(DType::F32)?;
    let target = target.to_dtype(DType::F32)?;
    let per_example = (pred - target)?.sqr()?.flatten_from(1)?.mean(D::Minus1)?;

    let half = batch / 2;
    let model_losses_w = per_example.narrow(0, 0, half)?;
    let model_losses_l = per_example.narrow(0, half, half)?;

    let log_odds = (error_mapping(&model_losses_w, config.snr_value)?
        - error_mapping(&model_losses_l, config.snr_value)?)?;
    let ratio = log_sigmoid(&log_odds.affine(config.num_train_timesteps as f64, 0.0)?)?;
    let ratio_losses = ratio.affine(config.beta_mapo, 0.0)?;

    let loss = (model_losses_w.mean_all()? - ratio_losses.mean_all()?)?;

    Ok(PreferenceLoss {
        loss,
        model_losses_w,
        model_losses_l,
        ratio_losses,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn close(a: f32, b: f32, tol: f32) -> bool {
        (a - b).abs() <= tol * (1.0 + b.abs())
    }

    fn f(x: f64, s: f64) -> f64 {
        s * x / ((s * x).exp() - 1.0)
    }

    #[test]
    fn test_log_sigmoid_stable() {
        let x = Tensor::new(&[-1000f32, -2.0, 0.0, 2.0, 1000.0], &Device::Cpu).unwrap();
        let y: Vec<f32> = log_sigmoid(&x).unwrap().to_vec1().unwrap();
        assert!(y.iter().all(|v| v.is_finite()));
        assert!(close(y[0], -1000.0, 1e-6));
        assert!(close(y[1], -2.126_928, 1e-5));
        assert!(close(y[2], -std::f32::consts::LN_2, 1e-6));
        assert!(close(y[3], -0.126_928, 1e-5));
        assert_eq!(y[4], 0.0);
    }

    #[test]
    fn test_matches_reference_values() {
        // Batch of 2: one preferred and one rejected row of four elements
        let pred = Tensor::new(&[[0.1f32, 0.2, 0.3, 0.4], [0.5, 0.1, 0.0, 0.2]], &Device::Cpu).unwrap();
        let target = Tensor::zeros((2, 4), DType::F32, &Device::Cpu).unwrap();
        let config = PreferenceLossConfig {
            snr_value: 5.0,
            beta_mapo: 0.1,
            num_train_timesteps: 10,
        };

        let out = preference_loss(&pred, &target, &config).unwrap();
        let w = (0.01 + 0.04 + 0.09 + 0.16) / 4.0;
        let l = (0.25 + 0.01 + 0.0 + 0.04) / 4.0;
        let log_odds = f(w, 5.0) - f(l, 5.0);
        let z = log_odds * 10.0;
        let ratio = z.min(0.0) - (1.0 + (-z.abs()).exp()).ln();
        let expected = w - 0.1 * ratio;

        let (loss, mean_w, mean_l, mean_ratio) = out.summary().unwrap();
        assert!(close(mean_w, w as f32, 1e-5));
        assert!(close(mean_l, l as f32, 1e-5));
        assert!(close(mean_ratio, (0.1 * ratio) as f32, 1e-4));
        assert!(close(loss, expected as f32, 1e-4));
    }

    #[test]
    fn test_swapping_halves_shifts_ratio_by_margin() {
        let device = Device::Cpu;
        let preferred = Tensor::new(&[[0.3f32, 0.1], [0.2, 0.2]], &device).unwrap();
        let rejected = Tensor::new(&[[0.4f32, 0.3], [0.1, 0.5]], &device).unwrap();
        let zeros = Tensor::zeros((4, 2), DType::F32, &device).unwrap();
        let config = PreferenceLossConfig {
            snr_value: 2.0,
            beta_mapo: 0.5,
            num_train_timesteps: 1,
        };

        let forward = Tensor::cat(&[&preferred, &rejected], 0).unwrap();
        let swapped = Tensor::cat(&[&rejected, &preferred], 0).unwrap();
        let a = preference_loss(&forward, &zeros, &config).unwrap();
        let b = preference_loss(&swapped, &zeros, &config).unwrap();

        let w: Vec<f32> = a.model_losses_w.to_vec1().unwrap();
        let l: Vec<f32> = a.model_losses_l.to_vec1().unwrap();
        let ra: Vec<f32> = a.ratio_losses.to_vec1().unwrap();
        let rb: Vec<f32> = b.ratio_losses.to_vec1().unwrap();
        assert_eq!(b.model_losses_w.to_vec1::<f32>().unwrap(), l);

        // log_sigmoid(x) − log_sigmoid(−x) = x, so the ratios differ by β·T·log_odds
        for i in 0..2 {
            let log_odds = f(w[i] as f64, 2.0) - f(l[i] as f64, 2.0);
            assert!(close(ra[i] - rb[i], (0.5 * log_odds) as f32, 1e-4));
        }
    }

    #[test]
    fn test_lower_preferred_error_lowers_loss() {
        let device = Device::Cpu;
        let config = PreferenceLossConfig::default();
        let target = Tensor::zeros((2, 3), DType::F32, &device).unwrap();
        let good = Tensor::new(&[[0.1f32, 0.1, 0.1], [0.3, 0.3, 0.3]], &device).unwrap();
        let bad = Tensor::new(&[[0.3f32, 0.3, 0.3], [0.1, 0.1, 0.1]], &device).unwrap();

        let (good_loss, ..) = preference_loss(&good, &target, &config).unwrap().summary().unwrap();
        let (bad_loss, ..) = preference_loss(&bad, &target, &config).unwrap().summary().unwrap();
        assert!(good_loss < bad_loss);
    }

    #[test]
    fn test_odd_batch_rejected() {
        let device = Device::Cpu;
        let pred = Tensor::ones((3, 2), DType::F32, &device).unwrap();
        let err = preference_loss(&pred, &pred, &PreferenceLossConfig::default()).unwrap_err();
        assert!(err.to_string().contains("even number"));

        let other = Tensor::ones((2, 2), DType::F32, &device).unwrap();
        assert!(preference_loss(&other, &pred, &PreferenceLossConfig::default()).is_err());
    }
}
