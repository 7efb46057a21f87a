//! Streaming metrics and per-epoch history.

use crate::error::FitError;
use crate::losses::class_labels;
use crate::tensor::Tensor;
use crate::training::events::Logs;
use serde::{Deserialize, Serialize};

/// A metric accumulated over the batches of one epoch.
pub trait Metric: Send {
    /// Log key, e.g. `accuracy`; validation results are reported as `val_<name>`.
    fn name(&self) -> &str;

    fn update(&mut self, y_true: &Tensor, y_pred: &Tensor) -> Result<(), FitError>;

    fn result(&self) -> f64;

    fn reset(&mut self);
}

/// Weighted running mean of scalar values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mean {
    total: f64,
    count: f64,
}

impl Mean {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, value: f64, weight: f64) {
        self.total += value * weight;
        self.count += weight;
    }

    /// Mean so far; zero before any update.
    pub fn result(&self) -> f64 {
        if self.count == 0.0 {
            0.0
        } else {
            self.total / self.count
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, Default)]
pub struct MeanSquaredError {
    mean: Mean,
}

impl Metric for MeanSquaredError {
    fn name(&self) -> &str {
        "mse"
    }

    fn update(&mut self, y_true: &Tensor, y_pred: &Tensor) -> Result<(), FitError> {
        if y_true.len() != y_pred.len() {
            return Err(FitError::shape(format!(
                "mse: {} labels for {} predictions",
                y_true.len(),
                y_pred.len()
            )));
        }
        for (&t, &p) in y_true.data().iter().zip(y_pred.data()) {
            self.mean.update(((p - t) as f64).powi(2), 1.0);
        }
        Ok(())
    }

    fn result(&self) -> f64 {
        self.mean.result()
    }

    fn reset(&mut self) {
        self.mean.reset();
    }
}

/// Fraction of rows whose argmax matches the integer label.
#[derive(Debug, Clone, Default)]
pub struct SparseCategoricalAccuracy {
    mean: Mean,
}

impl Metric for SparseCategoricalAccuracy {
    fn name(&self) -> &str {
        "accuracy"
    }

    fn update(&mut self, y_true: &Tensor, y_pred: &Tensor) -> Result<(), FitError> {
        let labels = class_labels(y_true, y_pred)?;
        let predicted = y_pred.argmax_rows()?;
        for (label, pred) in labels.into_iter().zip(predicted) {
            self.mean.update(if label == pred { 1.0 } else { 0.0 }, 1.0);
        }
        Ok(())
    }

    fn result(&self) -> f64 {
        self.mean.result()
    }

    fn reset(&mut self) {
        self.mean.reset();
    }
}

/// Per-epoch logs of a run plus the best epoch seen so far.
///
/// Epochs are compared on `val_loss` when present, otherwise on `loss`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    /// `(completed_epochs, logs)` in the order recorded.
    pub epochs: Vec<(usize, Logs)>,
    pub best_epoch: Option<usize>,
    pub best_loss: Option<f64>,
}

impl History {
    pub fn record_epoch(&mut self, completed_epochs: usize, logs: &Logs) {
        self.epochs.push((completed_epochs, logs.clone()));
        let check = logs.get("val_loss").or_else(|| logs.get("loss")).copied();
        if let Some(loss) = check
            && loss.is_finite()
            && self.best_loss.is_none_or(|best| loss < best)
        {
            self.best_loss = Some(loss);
            self.best_epoch = Some(completed_epochs);
        }
    }

    /// Values of `key` across recorded epochs, skipping epochs without it.
    pub fn series(&self, key: &str) -> Vec<f64> {
        self.epochs
            .iter()
            .filter_map(|(_, logs)| logs.get(key).copied())
            .collect()
    }

    pub fn last(&self) -> Option<&Logs> {
        self.epochs.last().map(|(_, logs)| logs)
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }
}
