//! Weight initializers.

use crate::tensor::Tensor;
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Initializer {
    Zeros,
    Ones,
    Constant { value: f32 },
    RandomNormal { stddev: f32 },
    /// Uniform in `[-limit, limit]` with `limit = sqrt(6 / (fan_in + fan_out))`.
    #[default]
    GlorotUniform,
}

impl Initializer {
    pub fn initialize<R: Rng + ?Sized>(&self, shape: &[usize], rng: &mut R) -> Tensor {
        match *self {
            Self::Zeros => Tensor::zeros(shape),
            Self::Ones => Tensor::ones(shape),
            Self::Constant { value } => Tensor::full(shape, value),
            Self::RandomNormal { stddev } => {
                let mut t = Tensor::zeros(shape);
                for v in t.data_mut() {
                    *v = standard_normal(rng) * stddev;
                }
                t
            }
            Self::GlorotUniform => {
                let (fan_in, fan_out) = fans(shape);
                let limit = (6.0 / (fan_in + fan_out).max(1) as f32).sqrt();
                let mut t = Tensor::zeros(shape);
                for v in t.data_mut() {
                    *v = rng.gen_range(-limit..=limit);
                }
                t
            }
        }
    }
}

fn fans(shape: &[usize]) -> (usize, usize) {
    match shape {
        [] => (1, 1),
        [n] => (*n, *n),
        [rows, cols] => (*rows, *cols),
        [.., a, b] => {
            let receptive: usize = shape[..shape.len() - 2].iter().product();
            (a * receptive, b * receptive)
        }
    }
}

/// Box-Muller sample from N(0, 1).
fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f32 {
    let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
    let u2: f32 = rng.gen_range(0.0..1.0);
    (-2.0 * u1.ln()).sqrt() * (std::f32::consts::TAU * u2).cos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_constant_initializers() {
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(Initializer::Zeros.initialize(&[2], &mut rng).data(), &[0.0, 0.0]);
        assert_eq!(Initializer::Ones.initialize(&[1], &mut rng).data(), &[1.0]);
        assert_eq!(
            Initializer::Constant { value: 0.5 }
                .initialize(&[2, 1], &mut rng)
                .data(),
            &[0.5, 0.5]
        );
    }

    #[test]
    fn test_glorot_within_limit() {
        let mut rng = StdRng::seed_from_u64(7);
        let t = Initializer::GlorotUniform.initialize(&[4, 2], &mut rng);
        let limit = (6.0f32 / 6.0).sqrt();
        assert!(t.data().iter().all(|v| v.abs() <= limit));
        assert!(t.data().iter().any(|v| *v != 0.0));
    }

    #[test]
    fn test_random_normal_moments() {
        let mut rng = StdRng::seed_from_u64(1);
        let t = Initializer::RandomNormal { stddev: 2.0 }.initialize(&[10_000], &mut rng);
        let mean = t.mean();
        let var = t.data().iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / 10_000.0;
        assert!(mean.abs() < 0.1);
        assert!((var.sqrt() - 2.0).abs() < 0.1);
    }

    #[test]
    fn test_seeded_is_deterministic() {
        let a = Initializer::GlorotUniform.initialize(&[3, 3], &mut StdRng::seed_from_u64(3));
        let b = Initializer::GlorotUniform.initialize(&[3, 3], &mut StdRng::seed_from_u64(3));
        assert_eq!(a, b);
    }
}
