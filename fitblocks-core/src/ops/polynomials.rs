//! Orthogonal polynomial bases for expanding numerical features.
//!
//! Each builder evaluates the first `order` members of its family with the
//! family's three-term recurrence and knows its domain, weighting function
//! and the squared norms `<P_i, P_i>` under that weighting.

use crate::error::FitError;
use crate::tensor::Tensor;
use std::f64::consts::PI;

pub trait PolynomialBuilder: Send + Sync {
    /// Interval of orthogonality; infinite ends are `f64::INFINITY`.
    fn domain(&self) -> (f64, f64);

    /// `result[i][j] = P_i(x[j])` for `i < order`.
    fn polynomials(&self, x: &[f64], order: usize) -> Vec<Vec<f64>>;

    fn weighting(&self, x: f64) -> f64;

    /// `integral of P_i(x)^2 w(x) over the domain`.
    fn normalization_factor(&self, i: usize) -> f64;
}

/// Evaluate a recurrence `P_n = next(n, x, P_{n-1}, P_{n-2})` seeded with
/// `P_0 = 1` and `P_1 = first(x)`.
fn recurrence(
    x: &[f64],
    order: usize,
    first: impl Fn(f64) -> f64,
    next: impl Fn(usize, f64, f64, f64) -> f64,
) -> Vec<Vec<f64>> {
    let mut out: Vec<Vec<f64>> = Vec::with_capacity(order);
    if order == 0 {
        return out;
    }
    out.push(vec![1.0; x.len()]);
    if order == 1 {
        return out;
    }
    out.push(x.iter().map(|&v| first(v)).collect());
    for n in 2..order {
        let row = x
            .iter()
            .enumerate()
            .map(|(j, &v)| next(n, v, out[n - 1][j], out[n - 2][j]))
            .collect();
        out.push(row);
    }
    out
}

fn factorial(n: usize) -> f64 {
    (1..=n).map(|k| k as f64).product()
}

/// Lanczos approximation of the gamma function.
fn gamma(x: f64) -> f64 {
    const G: f64 = 7.0;
    const COEF: [f64; 9] = [
        0.999_999_999_999_809_9,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_572e-6,
        1.505_632_735_149_311_6e-7,
    ];
    if x < 0.5 {
        return PI / ((PI * x).sin() * gamma(1.0 - x));
    }
    let x = x - 1.0;
    let mut a = COEF[0];
    let t = x + G + 0.5;
    for (i, &c) in COEF.iter().enumerate().skip(1) {
        a += c / (x + i as f64);
    }
    (2.0 * PI).sqrt() * t.powf(x + 0.5) * (-t).exp() * a
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Legendre;

impl PolynomialBuilder for Legendre {
    fn domain(&self) -> (f64, f64) {
        (-1.0, 1.0)
    }

    fn polynomials(&self, x: &[f64], order: usize) -> Vec<Vec<f64>> {
        recurrence(x, order, |v| v, |n, v, p1, p2| {
            let n = n as f64;
            ((2.0 * n - 1.0) * v * p1 - (n - 1.0) * p2) / n
        })
    }

    fn weighting(&self, _x: f64) -> f64 {
        1.0
    }

    fn normalization_factor(&self, i: usize) -> f64 {
        2.0 / (2.0 * i as f64 + 1.0)
    }
}

/// Chebyshev polynomials of the first kind, `T_n`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstChebyshev;

impl PolynomialBuilder for FirstChebyshev {
    fn domain(&self) -> (f64, f64) {
        (-1.0, 1.0)
    }

    fn polynomials(&self, x: &[f64], order: usize) -> Vec<Vec<f64>> {
        recurrence(x, order, |v| v, |_, v, p1, p2| 2.0 * v * p1 - p2)
    }

    fn weighting(&self, x: f64) -> f64 {
        1.0 / (1.0 - x * x).sqrt()
    }

    fn normalization_factor(&self, i: usize) -> f64 {
        if i == 0 { PI } else { PI / 2.0 }
    }
}

/// Chebyshev polynomials of the second kind, `U_n`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SecondChebyshev;

impl PolynomialBuilder for SecondChebyshev {
    fn domain(&self) -> (f64, f64) {
        (-1.0, 1.0)
    }

    fn polynomials(&self, x: &[f64], order: usize) -> Vec<Vec<f64>> {
        recurrence(x, order, |v| 2.0 * v, |_, v, p1, p2| 2.0 * v * p1 - p2)
    }

    fn weighting(&self, x: f64) -> f64 {
        (1.0 - x * x).sqrt()
    }

    fn normalization_factor(&self, _i: usize) -> f64 {
        PI / 2.0
    }
}

/// Physicists' Hermite polynomials, orthogonal under `exp(-x^2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hermite;

impl PolynomialBuilder for Hermite {
    fn domain(&self) -> (f64, f64) {
        (f64::NEG_INFINITY, f64::INFINITY)
    }

    fn polynomials(&self, x: &[f64], order: usize) -> Vec<Vec<f64>> {
        recurrence(x, order, |v| 2.0 * v, |n, v, p1, p2| {
            2.0 * v * p1 - 2.0 * (n as f64 - 1.0) * p2
        })
    }

    fn weighting(&self, x: f64) -> f64 {
        (-x * x).exp()
    }

    fn normalization_factor(&self, i: usize) -> f64 {
        PI.sqrt() * 2f64.powi(i as i32) * factorial(i)
    }
}

/// Hermite polynomials rescaled for a zero-mean Gaussian with `stddev`:
/// `H_n(x / (sqrt(2) stddev))`, orthogonal under `exp(-x^2 / (2 stddev^2))`.
#[derive(Debug, Clone, Copy)]
pub struct GaussianHermite {
    pub stddev: f64,
}

impl Default for GaussianHermite {
    fn default() -> Self {
        Self { stddev: 1.0 }
    }
}

impl GaussianHermite {
    fn scale(&self) -> f64 {
        std::f64::consts::SQRT_2 * self.stddev
    }
}

impl PolynomialBuilder for GaussianHermite {
    fn domain(&self) -> (f64, f64) {
        (f64::NEG_INFINITY, f64::INFINITY)
    }

    fn polynomials(&self, x: &[f64], order: usize) -> Vec<Vec<f64>> {
        let s = self.scale();
        let scaled: Vec<f64> = x.iter().map(|v| v / s).collect();
        Hermite.polynomials(&scaled, order)
    }

    fn weighting(&self, x: f64) -> f64 {
        let u = x / self.scale();
        (-u * u).exp()
    }

    fn normalization_factor(&self, i: usize) -> f64 {
        self.scale() * Hermite.normalization_factor(i)
    }
}

/// Gegenbauer (ultraspherical) polynomials `C_n^(lambda)`, orthogonal under
/// `(1 - x^2)^(lambda - 1/2)`. `lambda = 0` uses the Chebyshev limit.
#[derive(Debug, Clone, Copy)]
pub struct Gegenbauer {
    pub lambda: f64,
}

impl PolynomialBuilder for Gegenbauer {
    fn domain(&self) -> (f64, f64) {
        (-1.0, 1.0)
    }

    fn polynomials(&self, x: &[f64], order: usize) -> Vec<Vec<f64>> {
        let lam = self.lambda;
        if lam == 0.0 {
            return FirstChebyshev.polynomials(x, order);
        }
        recurrence(x, order, |v| 2.0 * lam * v, |n, v, p1, p2| {
            let n = n as f64;
            (2.0 * v * (n + lam - 1.0) * p1 - (n + 2.0 * lam - 2.0) * p2) / n
        })
    }

    fn weighting(&self, x: f64) -> f64 {
        (1.0 - x * x).powf(self.lambda - 0.5)
    }

    fn normalization_factor(&self, i: usize) -> f64 {
        let lam = self.lambda;
        if lam == 0.0 {
            return FirstChebyshev.normalization_factor(i);
        }
        let n = i as f64;
        PI * 2f64.powf(1.0 - 2.0 * lam) * gamma(n + 2.0 * lam)
            / (factorial(i) * (n + lam) * gamma(lam).powi(2))
    }
}

/// Monomials `x^i`. Not orthogonal; weighting and norms are 1.
#[derive(Debug, Clone, Copy, Default)]
pub struct Geometric;

impl PolynomialBuilder for Geometric {
    fn domain(&self) -> (f64, f64) {
        (f64::NEG_INFINITY, f64::INFINITY)
    }

    fn polynomials(&self, x: &[f64], order: usize) -> Vec<Vec<f64>> {
        recurrence(x, order, |v| v, |_, v, p1, _| v * p1)
    }

    fn weighting(&self, _x: f64) -> f64 {
        1.0
    }

    fn normalization_factor(&self, _i: usize) -> f64 {
        1.0
    }
}

/// Products of per-dimension bases.
///
/// Terms are ordered lexicographically by exponent tuple. With
/// `is_total_order` only tuples whose sum is at most `max_order` are kept;
/// otherwise each exponent ranges over `0..=max_order` independently.
pub struct NdPolynomialBuilder {
    pub max_order: usize,
    pub is_total_order: bool,
    base: Box<dyn PolynomialBuilder>,
}

impl NdPolynomialBuilder {
    pub fn new(max_order: usize, is_total_order: bool) -> Self {
        Self::with_base(max_order, is_total_order, Geometric)
    }

    pub fn with_base<B>(max_order: usize, is_total_order: bool, base: B) -> Self
    where
        B: PolynomialBuilder + 'static,
    {
        Self {
            max_order,
            is_total_order,
            base: Box::new(base),
        }
    }

    /// Exponent tuples for `ndims` dimensions, in output order.
    pub fn exponents(&self, ndims: usize) -> Vec<Vec<usize>> {
        let mut out = Vec::new();
        let mut current = Vec::with_capacity(ndims);
        self.collect_exponents(ndims, 0, &mut current, &mut out);
        out
    }

    fn collect_exponents(
        &self,
        ndims: usize,
        used: usize,
        current: &mut Vec<usize>,
        out: &mut Vec<Vec<usize>>,
    ) {
        if current.len() == ndims {
            out.push(current.clone());
            return;
        }
        let limit = if self.is_total_order {
            self.max_order - used
        } else {
            self.max_order
        };
        for e in 0..=limit {
            current.push(e);
            self.collect_exponents(ndims, used + e, current, out);
            current.pop();
        }
    }

    /// `coords[d][j]` is coordinate `d` of point `j`; returns
    /// `terms[k][j]` for each exponent tuple `k`.
    pub fn evaluate(&self, coords: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, FitError> {
        let npoints = coords.first().map_or(0, Vec::len);
        if coords.iter().any(|c| c.len() != npoints) {
            return Err(FitError::shape("all dimensions need the same number of points"));
        }
        let per_dim: Vec<Vec<Vec<f64>>> = coords
            .iter()
            .map(|c| self.base.polynomials(c, self.max_order + 1))
            .collect();
        Ok(self
            .exponents(coords.len())
            .into_iter()
            .map(|exps| {
                (0..npoints)
                    .map(|j| {
                        exps.iter()
                            .enumerate()
                            .map(|(d, &e)| per_dim[d][e][j])
                            .product()
                    })
                    .collect()
            })
            .collect())
    }

    /// Expand `(n, ndims)` points into `(n, terms)` features.
    pub fn features(&self, points: &Tensor) -> Result<Tensor, FitError> {
        if points.rank() != 2 {
            return Err(FitError::shape(format!(
                "expected points of shape (n, ndims), got {:?}",
                points.shape()
            )));
        }
        let (n, ndims) = (points.shape()[0], points.shape()[1]);
        let coords: Vec<Vec<f64>> = (0..ndims)
            .map(|d| (0..n).map(|j| points.data()[j * ndims + d] as f64).collect())
            .collect();
        let terms = self.evaluate(&coords)?;
        let mut data = vec![0.0f32; n * terms.len()];
        for (k, term) in terms.iter().enumerate() {
            for (j, v) in term.iter().enumerate() {
                data[j * terms.len() + k] = *v as f32;
            }
        }
        Tensor::new(vec![n, terms.len()], data)
    }
}

/// Expand a 1-D tensor into `(n, order)` features `P_0(x) .. P_{order-1}(x)`.
pub fn basis_features(
    x: &Tensor,
    builder: &dyn PolynomialBuilder,
    order: usize,
) -> Result<Tensor, FitError> {
    if x.rank() != 1 {
        return Err(FitError::shape(format!(
            "basis features need a 1-D tensor, got shape {:?}",
            x.shape()
        )));
    }
    let values: Vec<f64> = x.data().iter().map(|&v| v as f64).collect();
    let polys = builder.polynomials(&values, order);
    let n = values.len();
    let mut data = vec![0.0f32; n * order];
    for (i, poly) in polys.iter().enumerate() {
        for (j, v) in poly.iter().enumerate() {
            data[j * order + i] = *v as f32;
        }
    }
    Tensor::new(vec![n, order], data)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `<P_i, P_i> / norm_i - 1` and `<P_i, P_j>` for `i < j`, by a Riemann
    /// sum over the open domain.
    fn inner_products(builder: &dyn PolynomialBuilder, order: usize) -> Vec<f64> {
        let clamp = |v: f64| v.clamp(-100.0, 100.0);
        let (a, b) = builder.domain();
        let (a, b) = (clamp(a), clamp(b));
        let n = 1_000_000usize;
        let dx = (b - a) / n as f64;
        let x: Vec<f64> = (1..n - 1).map(|k| a + k as f64 * dx).collect();
        let polys = builder.polynomials(&x, order);
        let w: Vec<f64> = x.iter().map(|&v| builder.weighting(v)).collect();

        let integral = |p: &[f64], q: &[f64]| -> f64 {
            p.iter().zip(q).zip(&w).map(|((p, q), w)| p * q * w).sum::<f64>() * dx
        };
        let mut out = Vec::new();
        for i in 0..order {
            out.push(integral(&polys[i], &polys[i]) / builder.normalization_factor(i) - 1.0);
            for j in i + 1..order {
                out.push(integral(&polys[i], &polys[j]));
            }
        }
        out
    }

    fn assert_orthogonal(builder: &dyn PolynomialBuilder) {
        for v in inner_products(builder, 5) {
            assert!(v.abs() < 1e-2, "inner product residual {v}");
        }
    }

    #[test]
    fn test_legendre_orthogonal() {
        assert_orthogonal(&Legendre);
    }

    #[test]
    fn test_chebyshev_first_orthogonal() {
        assert_orthogonal(&FirstChebyshev);
    }

    #[test]
    fn test_chebyshev_second_orthogonal() {
        assert_orthogonal(&SecondChebyshev);
    }

    #[test]
    fn test_hermite_orthogonal() {
        assert_orthogonal(&Hermite);
    }

    #[test]
    fn test_gaussian_hermite_orthogonal() {
        for stddev in [1.0, 2.0] {
            assert_orthogonal(&GaussianHermite { stddev });
        }
    }

    #[test]
    fn test_gegenbauer_orthogonal() {
        for lambda in [0.0, 0.75, 0.85] {
            assert_orthogonal(&Gegenbauer { lambda });
        }
    }

    #[test]
    fn test_gamma() {
        assert!((gamma(5.0) - 24.0).abs() < 1e-9);
        assert!((gamma(0.5) - PI.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_geometric() {
        let x = [0.5, -2.0, 3.0];
        let polys = Geometric.polynomials(&x, 4);
        for (i, row) in polys.iter().enumerate() {
            for (j, v) in row.iter().enumerate() {
                assert!((v - x[j].powi(i as i32)).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_nd_total_order_terms() {
        let builder = NdPolynomialBuilder::new(3, true);
        let exps = builder.exponents(3);
        assert_eq!(exps.len(), 20);
        assert_eq!(exps[0], vec![0, 0, 0]);
        assert_eq!(exps[1], vec![0, 0, 1]);
        assert_eq!(exps[4], vec![0, 1, 0]);
        assert_eq!(exps[9], vec![0, 3, 0]);
        assert_eq!(exps[19], vec![3, 0, 0]);
        assert_eq!(NdPolynomialBuilder::new(3, false).exponents(3).len(), 64);
    }

    #[test]
    fn test_nd_evaluate_products() {
        let builder = NdPolynomialBuilder::new(3, true);
        let coords = vec![vec![2.0, -1.0], vec![3.0, 0.5], vec![0.5, 4.0]];
        let terms = builder.evaluate(&coords).unwrap();
        assert_eq!(terms.len(), 20);
        for (k, exps) in builder.exponents(3).iter().enumerate() {
            for j in 0..2 {
                let expected: f64 = (0..3).map(|d| coords[d][j].powi(exps[d] as i32)).product();
                assert!((terms[k][j] - expected).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_nd_features_shape() {
        let builder = NdPolynomialBuilder::new(3, true);
        let points = Tensor::zeros(&[10, 3]);
        let f = builder.features(&points).unwrap();
        assert_eq!(f.shape(), &[10, 20]);
        assert_eq!(f.data()[0], 1.0);
        assert_eq!(f.data()[1], 0.0);
    }

    #[test]
    fn test_basis_features() {
        let x = Tensor::vector(&[0.5, -0.5]);
        let f = basis_features(&x, &Legendre, 3).unwrap();
        assert_eq!(f.shape(), &[2, 3]);
        // P2(0.5) = (3 * 0.25 - 1) / 2
        assert_eq!(f.data(), &[1.0, 0.5, -0.125, 1.0, -0.5, -0.125]);
        assert!(basis_features(&Tensor::zeros(&[2, 2]), &Legendre, 3).is_err());
    }
}
