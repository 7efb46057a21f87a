//! Weight penalties reported as auxiliary losses.

use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Regularizer {
    L1 { l1: f32 },
    L2 { l2: f32 },
    L1L2 { l1: f32, l2: f32 },
}

impl Regularizer {
    fn factors(&self) -> (f32, f32) {
        match *self {
            Self::L1 { l1 } => (l1, 0.0),
            Self::L2 { l2 } => (0.0, l2),
            Self::L1L2 { l1, l2 } => (l1, l2),
        }
    }

    /// `l1 * sum(|w|) + l2 * sum(w^2)`
    pub fn penalty(&self, weights: &Tensor) -> f64 {
        let (l1, l2) = self.factors();
        weights
            .data()
            .iter()
            .map(|&w| l1 as f64 * w.abs() as f64 + l2 as f64 * (w as f64).powi(2))
            .sum()
    }

    pub fn gradient(&self, weights: &Tensor) -> Tensor {
        let (l1, l2) = self.factors();
        weights.map(|w| {
            let sign = if w > 0.0 {
                1.0
            } else if w < 0.0 {
                -1.0
            } else {
                0.0
            };
            l1 * sign + 2.0 * l2 * w
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_penalty() {
        let w = Tensor::vector(&[1.0, -2.0, 0.0]);
        assert_eq!(Regularizer::L1 { l1: 0.5 }.penalty(&w), 1.5);
        assert!((Regularizer::L2 { l2: 0.1 }.penalty(&w) - 0.5).abs() < 1e-6);
        let both = Regularizer::L1L2 { l1: 1.0, l2: 1.0 }.penalty(&w);
        assert!((both - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_gradient() {
        let w = Tensor::vector(&[1.0, -2.0, 0.0]);
        let g = Regularizer::L1L2 { l1: 0.5, l2: 0.25 }.gradient(&w);
        assert_eq!(g.data(), &[1.0, -1.5, 0.0]);
    }
}
