//! Numeric feature operations.

pub mod polynomials;

pub use polynomials::{
    FirstChebyshev, GaussianHermite, Gegenbauer, Geometric, Hermite, Legendre,
    NdPolynomialBuilder, PolynomialBuilder, SecondChebyshev, basis_features,
};
