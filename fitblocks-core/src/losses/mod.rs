//! Loss functions with gradients with respect to predictions.

pub mod lovasz;

pub use lovasz::{ClassSelection, Lovasz};

use crate::error::FitError;
use crate::tensor::Tensor;

const EPSILON: f32 = 1e-7;

pub trait Loss: Send {
    fn name(&self) -> &str;

    /// Scalar loss averaged over the batch.
    fn value(&self, y_true: &Tensor, y_pred: &Tensor) -> Result<f64, FitError>;

    /// Gradient of [`Loss::value`] with respect to `y_pred`.
    fn gradient(&self, y_true: &Tensor, y_pred: &Tensor) -> Result<Tensor, FitError>;
}

/// Integer class labels for a `(n, classes)` prediction: `(n,)` or `(n, 1)`.
pub(crate) fn class_labels(y_true: &Tensor, y_pred: &Tensor) -> Result<Vec<usize>, FitError> {
    let n = y_pred.rows();
    let classes = y_pred.row_len();
    if y_true.len() != n {
        return Err(FitError::shape(format!(
            "expected {n} labels for predictions of shape {:?}, got shape {:?}",
            y_pred.shape(),
            y_true.shape()
        )));
    }
    y_true
        .data()
        .iter()
        .map(|&v| {
            let label = v as usize;
            if v < 0.0 || v.fract() != 0.0 || label >= classes {
                Err(FitError::shape(format!(
                    "label {v} is not a class index below {classes}"
                )))
            } else {
                Ok(label)
            }
        })
        .collect()
}

/// Labels reshaped to match predictions when only a unit axis differs.
fn aligned(y_true: &Tensor, y_pred: &Tensor) -> Result<Tensor, FitError> {
    if y_true.shape() == y_pred.shape() {
        Ok(y_true.clone())
    } else if y_true.len() == y_pred.len() {
        y_true.reshape(y_pred.shape())
    } else {
        Err(FitError::shape(format!(
            "labels of shape {:?} do not match predictions of shape {:?}",
            y_true.shape(),
            y_pred.shape()
        )))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MeanSquaredError;

impl Loss for MeanSquaredError {
    fn name(&self) -> &str {
        "mean_squared_error"
    }

    fn value(&self, y_true: &Tensor, y_pred: &Tensor) -> Result<f64, FitError> {
        let diff = y_pred.sub(&aligned(y_true, y_pred)?)?;
        Ok(diff.mul(&diff)?.mean())
    }

    fn gradient(&self, y_true: &Tensor, y_pred: &Tensor) -> Result<Tensor, FitError> {
        let n = y_pred.len().max(1) as f32;
        Ok(y_pred.sub(&aligned(y_true, y_pred)?)?.scale(2.0 / n))
    }
}

/// Cross entropy against integer labels.
#[derive(Debug, Clone, Copy, Default)]
pub struct SparseCategoricalCrossentropy {
    pub from_logits: bool,
}

impl SparseCategoricalCrossentropy {
    fn probabilities(&self, y_pred: &Tensor) -> Result<Tensor, FitError> {
        if self.from_logits {
            y_pred.softmax_rows()
        } else {
            Ok(y_pred.map(|p| p.clamp(EPSILON, 1.0 - EPSILON)))
        }
    }
}

impl Loss for SparseCategoricalCrossentropy {
    fn name(&self) -> &str {
        "sparse_categorical_crossentropy"
    }

    fn value(&self, y_true: &Tensor, y_pred: &Tensor) -> Result<f64, FitError> {
        let labels = class_labels(y_true, y_pred)?;
        let probs = self.probabilities(y_pred)?;
        let classes = probs.row_len();
        let total: f64 = labels
            .iter()
            .enumerate()
            .map(|(i, &c)| -(probs.data()[i * classes + c].max(EPSILON) as f64).ln())
            .sum();
        Ok(total / labels.len().max(1) as f64)
    }

    fn gradient(&self, y_true: &Tensor, y_pred: &Tensor) -> Result<Tensor, FitError> {
        let labels = class_labels(y_true, y_pred)?;
        let n = labels.len().max(1) as f32;
        let probs = self.probabilities(y_pred)?;
        let classes = probs.row_len();
        let mut grad = if self.from_logits {
            probs.clone()
        } else {
            Tensor::zeros(probs.shape())
        };
        let data = grad.data_mut();
        for (i, &c) in labels.iter().enumerate() {
            let at = i * classes + c;
            if self.from_logits {
                data[at] -= 1.0;
            } else {
                data[at] = -1.0 / probs.data()[at];
            }
        }
        Ok(grad.scale(1.0 / n))
    }
}
