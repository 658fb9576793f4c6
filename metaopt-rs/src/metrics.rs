//! Losses and accuracy metrics for episodic classification.

use candle_core::{DType, Tensor, D};

use crate::error::{MetaOptError, Result};
use crate::linalg::one_hot;

/// Label-smoothed one-hot targets `[n, way]` for integer labels `[n]`.
///
/// The true class receives `1 - eps` and every other class
/// `eps / (way - 1)`, so each row sums to one. Requires `way > 1`.
///
/// # Errors
///
/// Returns [`MetaOptError::Config`] when `way < 2`.
pub fn smoothed_one_hot(labels: &Tensor, way: usize, eps: f64, like: &Tensor) -> Result<Tensor> {
    if way < 2 {
        return Err(MetaOptError::config(format!(
            "label smoothing needs at least 2 classes, got {way}"
        )));
    }
    let hot = one_hot(labels, way, like)?;
    let off = eps / (way - 1) as f64;
    Ok(hot.affine(1.0 - eps - off, off)?)
}

/// Training loss: `-mean_i Σ_k smoothed_ik · log_softmax(logits)_ik`.
///
/// # Errors
///
/// Returns an error for `way < 2` or mismatched shapes.
pub fn smoothed_cross_entropy(logits: &Tensor, labels: &Tensor, eps: f64) -> Result<Tensor> {
    let (_, way) = logits.dims2()?;
    let targets = smoothed_one_hot(labels, way, eps, logits)?;
    let log_prb = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    let per_example = (targets * log_prb)?.sum(D::Minus1)?;
    Ok(per_example.mean_all()?.neg()?)
}

/// Validation loss: standard multi-class cross entropy.
///
/// # Errors
///
/// Returns an error for mismatched shapes.
pub fn cross_entropy(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let labels = labels.to_dtype(DType::U32)?;
    Ok(candle_nn::loss::cross_entropy(logits, &labels)?)
}

/// Fraction of rows whose arg-max logit equals the label.
///
/// # Errors
///
/// Returns an error for mismatched shapes.
pub fn accuracy(logits: &Tensor, labels: &Tensor) -> Result<f64> {
    let predicted = logits.argmax(D::Minus1)?;
    let labels = labels.to_dtype(DType::U32)?;
    if predicted.dims() != labels.dims() {
        return Err(MetaOptError::shape_mismatch(
            format!("{:?}", predicted.dims()),
            format!("{:?}", labels.dims()),
        ));
    }
    let hits = predicted
        .eq(&labels)?
        .to_dtype(DType::F32)?
        .mean_all()?
        .to_scalar::<f32>()?;
    Ok(f64::from(hits))
}

/// Mean and 95% confidence half-width `1.96 · std / sqrt(n)` (population std).
#[must_use]
pub fn mean_and_ci95(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, 1.96 * var.sqrt() / n.sqrt())
}

/// Accumulates per-episode loss and accuracy.
#[derive(Debug, Clone, Default)]
pub struct RunningStats {
    losses: Vec<f64>,
    accuracies: Vec<f64>,
}

impl RunningStats {
    /// Empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one observation.
    pub fn push(&mut self, loss: f64, accuracy: f64) {
        self.losses.push(loss);
        self.accuracies.push(accuracy);
    }

    /// Number of observations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.losses.len()
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.losses.is_empty()
    }

    /// Mean loss.
    #[must_use]
    pub fn mean_loss(&self) -> f64 {
        mean_and_ci95(&self.losses).0
    }

    /// Mean accuracy and its 95% confidence half-width.
    #[must_use]
    pub fn accuracy_ci95(&self) -> (f64, f64) {
        mean_and_ci95(&self.accuracies)
    }
}
