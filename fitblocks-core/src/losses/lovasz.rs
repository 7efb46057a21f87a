//! Lovász-softmax loss: a convex surrogate of per-class Jaccard loss.
//!
//! Predictions of any rank are flattened to `(pixels, classes)`; labels of
//! the same rank as the predictions carry a trailing unit axis that is
//! squeezed.

use crate::error::FitError;
use crate::losses::{Loss, class_labels};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

/// Which classes contribute to the averaged loss.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassSelection {
    All,
    /// Only classes that appear in the labels.
    #[default]
    Present,
    Only(Vec<usize>),
}

#[derive(Debug, Clone)]
pub struct Lovasz {
    pub from_logits: bool,
    pub classes: ClassSelection,
}

impl Default for Lovasz {
    fn default() -> Self {
        Self {
            from_logits: true,
            classes: ClassSelection::Present,
        }
    }
}

/// Gradient of the Lovász extension of the Jaccard loss w.r.t. sorted errors.
fn lovasz_grad(gt_sorted: &[f32]) -> Vec<f64> {
    let gts: f64 = gt_sorted.iter().map(|&g| g as f64).sum();
    let mut cum_fg = 0.0;
    let mut cum_bg = 0.0;
    let mut jaccard: Vec<f64> = gt_sorted
        .iter()
        .map(|&g| {
            cum_fg += g as f64;
            cum_bg += 1.0 - g as f64;
            let intersection = gts - cum_fg;
            let union = gts + cum_bg;
            1.0 - intersection / union
        })
        .collect();
    for i in (1..jaccard.len()).rev() {
        jaccard[i] -= jaccard[i - 1];
    }
    jaccard
}

struct Flat {
    probs: Tensor,
    labels: Vec<usize>,
}

impl Lovasz {
    fn flatten(&self, y_true: &Tensor, y_pred: &Tensor) -> Result<Flat, FitError> {
        let classes = *y_pred
            .shape()
            .last()
            .ok_or_else(|| FitError::shape("lovasz loss needs predictions with a class axis"))?;
        let pixels = y_pred.len() / classes.max(1);
        let flat_pred = y_pred.reshape(&[pixels, classes])?;
        let probs = if self.from_logits {
            flat_pred.softmax_rows()?
        } else {
            flat_pred
        };
        let flat_true = y_true.reshape(&[pixels])?;
        let labels = class_labels(&flat_true, &probs)?;
        Ok(Flat { probs, labels })
    }

    fn selected(&self, labels: &[usize], classes: usize) -> Result<Vec<usize>, FitError> {
        match &self.classes {
            ClassSelection::All => Ok((0..classes).collect()),
            ClassSelection::Present => {
                Ok((0..classes).filter(|c| labels.contains(c)).collect())
            }
            ClassSelection::Only(list) => match list.iter().find(|&&c| c >= classes) {
                Some(c) => Err(FitError::config(format!(
                    "class {c} out of range for {classes} classes"
                ))),
                None => Ok(list.clone()),
            },
        }
    }

    /// Loss and gradient w.r.t. the flattened probabilities.
    fn evaluate(&self, flat: &Flat) -> Result<(f64, Tensor), FitError> {
        let classes = flat.probs.row_len();
        let selected = self.selected(&flat.labels, classes)?;
        let mut grad = Tensor::zeros(flat.probs.shape());
        if selected.is_empty() {
            return Ok((0.0, grad));
        }
        let probs = flat.probs.data();
        let count = selected.len() as f64;
        let mut total = 0.0;
        for &c in &selected {
            let mut entries: Vec<(usize, f32, f32)> = flat
                .labels
                .iter()
                .enumerate()
                .map(|(i, &l)| {
                    let fg = if l == c { 1.0 } else { 0.0 };
                    let p = probs[i * classes + c];
                    (i, fg, (fg - p).abs())
                })
                .collect();
            entries.sort_by(|a, b| b.2.total_cmp(&a.2));
            let fg_sorted: Vec<f32> = entries.iter().map(|e| e.1).collect();
            let weights = lovasz_grad(&fg_sorted);

            let data = grad.data_mut();
            for ((i, fg, err), w) in entries.into_iter().zip(weights) {
                total += err as f64 * w;
                let p = probs[i * classes + c];
                let sign = if p >= fg { 1.0 } else { -1.0 };
                data[i * classes + c] += (sign * w / count) as f32;
            }
        }
        Ok((total / count, grad))
    }
}

impl Loss for Lovasz {
    fn name(&self) -> &str {
        "lovasz"
    }

    fn value(&self, y_true: &Tensor, y_pred: &Tensor) -> Result<f64, FitError> {
        let flat = self.flatten(y_true, y_pred)?;
        Ok(self.evaluate(&flat)?.0)
    }

    fn gradient(&self, y_true: &Tensor, y_pred: &Tensor) -> Result<Tensor, FitError> {
        let flat = self.flatten(y_true, y_pred)?;
        let (_, d_probs) = self.evaluate(&flat)?;
        let d_pred = if self.from_logits {
            // Chain through the row softmax: dz_j = p_j * (g_j - sum_k g_k p_k).
            let classes = flat.probs.row_len().max(1);
            let mut out = d_probs.clone();
            for ((row, g), p) in out
                .data_mut()
                .chunks_mut(classes)
                .zip(d_probs.data().chunks(classes))
                .zip(flat.probs.data().chunks(classes))
            {
                let dot: f32 = g.iter().zip(p).map(|(g, p)| g * p).sum();
                for ((o, &gj), &pj) in row.iter_mut().zip(g).zip(p) {
                    *o = pj * (gj - dot);
                }
            }
            out
        } else {
            d_probs
        };
        d_pred.reshape(y_pred.shape())
    }
}
