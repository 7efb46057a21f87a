//! Shape/dtype descriptors and the helpers that translate between descriptors,
//! symbolic model inputs and concrete values.

use crate::error::FitError;
use crate::tensor::{DType, RaggedTensor, SparseTensor, Tensor, TensorLike};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Static shape: one entry per dimension, `None` where the size is unknown.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape(Vec<Option<usize>>);

impl Shape {
    pub fn new(dims: Vec<Option<usize>>) -> Self {
        Self(dims)
    }

    /// Fully known shape.
    pub fn known(dims: &[usize]) -> Self {
        Self(dims.iter().map(|&d| Some(d)).collect())
    }

    pub fn dims(&self) -> &[Option<usize>] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn dim(&self, i: usize) -> Option<usize> {
        self.0.get(i).copied().flatten()
    }

    pub fn is_fully_defined(&self) -> bool {
        self.0.iter().all(Option::is_some)
    }

    /// Copy of this shape with the leading dimension replaced.
    pub fn with_leading(&self, leading: Option<usize>) -> Shape {
        let mut dims = self.0.clone();
        if let Some(first) = dims.first_mut() {
            *first = leading;
        }
        Shape(dims)
    }

    /// Concrete dimensions, substituting `fill` for unknown ones.
    pub fn concrete(&self, fill: usize) -> Vec<usize> {
        self.0.iter().map(|d| d.unwrap_or(fill)).collect()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match d {
                Some(d) => write!(f, "{d}")?,
                None => f.write_str("None")?,
            }
        }
        if self.0.len() == 1 {
            f.write_str(",")?;
        }
        f.write_str(")")
    }
}

impl From<Vec<Option<usize>>> for Shape {
    fn from(dims: Vec<Option<usize>>) -> Self {
        Self(dims)
    }
}

/// Shape/dtype descriptor of a tensor-like value, without its data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TensorSpec {
    Dense {
        shape: Shape,
        dtype: DType,
    },
    Ragged {
        shape: Shape,
        dtype: DType,
        ragged_rank: usize,
    },
    Sparse {
        shape: Shape,
        dtype: DType,
    },
}

impl TensorSpec {
    pub fn dense(shape: Shape, dtype: DType) -> Self {
        Self::Dense { shape, dtype }
    }

    pub fn shape(&self) -> &Shape {
        match self {
            Self::Dense { shape, .. } | Self::Ragged { shape, .. } | Self::Sparse { shape, .. } => {
                shape
            }
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Self::Dense { dtype, .. } | Self::Ragged { dtype, .. } | Self::Sparse { dtype, .. } => {
                *dtype
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Dense { .. } => "dense",
            Self::Ragged { .. } => "ragged",
            Self::Sparse { .. } => "sparse",
        }
    }

    fn with_shape(&self, shape: Shape) -> TensorSpec {
        match self {
            Self::Dense { dtype, .. } => Self::Dense {
                shape,
                dtype: *dtype,
            },
            Self::Ragged {
                dtype, ragged_rank, ..
            } => Self::Ragged {
                shape,
                dtype: *dtype,
                ragged_rank: *ragged_rank,
            },
            Self::Sparse { dtype, .. } => Self::Sparse {
                shape,
                dtype: *dtype,
            },
        }
    }
}

impl fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}:{}", self.kind(), self.shape(), self.dtype())
    }
}

/// Symbolic model input: the batch dimension is always left unknown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
    pub shape: Shape,
    pub dtype: DType,
    pub ragged: bool,
    pub sparse: bool,
}

impl Input {
    /// Descriptor matching this placeholder.
    pub fn spec(&self) -> TensorSpec {
        if self.ragged {
            TensorSpec::Ragged {
                shape: self.shape.clone(),
                dtype: self.dtype,
                ragged_rank: self.shape.dims()[1..]
                    .iter()
                    .take_while(|d| d.is_none())
                    .count()
                    .max(1),
            }
        } else if self.sparse {
            TensorSpec::Sparse {
                shape: self.shape.clone(),
                dtype: self.dtype,
            }
        } else {
            TensorSpec::dense(self.shape.clone(), self.dtype)
        }
    }
}

/// Build a symbolic input placeholder matching `spec`.
pub fn to_input(spec: &TensorSpec) -> Result<Input, FitError> {
    let shape = spec.shape();
    if shape.rank() == 0 {
        return Err(FitError::shape(format!(
            "{spec} has no batch dimension to build an input from"
        )));
    }
    let (ragged, sparse) = match spec {
        TensorSpec::Dense { .. } => (false, false),
        TensorSpec::Ragged { ragged_rank, .. } => {
            if *ragged_rank == 0 || *ragged_rank >= shape.rank() {
                return Err(FitError::unrecognized_kind(format!(
                    "ragged spec {spec} with ragged_rank {ragged_rank}"
                )));
            }
            (true, false)
        }
        TensorSpec::Sparse { .. } => (false, true),
    };
    Ok(Input {
        shape: shape.with_leading(None),
        dtype: spec.dtype(),
        ragged,
        sparse,
    })
}

/// Describe a concrete value.
pub fn to_spec(value: &TensorLike) -> Result<TensorSpec, FitError> {
    match value {
        TensorLike::Dense(t) => {
            if t.len() != t.shape().iter().product::<usize>() {
                return Err(FitError::type_mismatch(format!(
                    "dense value with shape {:?} holds {} elements",
                    t.shape(),
                    t.len()
                )));
            }
            Ok(TensorSpec::dense(Shape::known(t.shape()), t.dtype()))
        }
        TensorLike::Ragged(r) => {
            r.validate()?;
            let mut dims = vec![Some(r.nrows())];
            dims.extend(std::iter::repeat_n(None, r.ragged_rank()));
            dims.extend(r.values().shape()[1..].iter().map(|&d| Some(d)));
            Ok(TensorSpec::Ragged {
                shape: Shape::new(dims),
                dtype: r.dtype(),
                ragged_rank: r.ragged_rank(),
            })
        }
        TensorLike::Sparse(s) => {
            s.validate()?;
            Ok(TensorSpec::Sparse {
                shape: Shape::known(s.dense_shape()),
                dtype: s.dtype(),
            })
        }
    }
}

/// A value matching `spec` where every unknown dimension has size zero.
fn zero_batch(spec: &TensorSpec) -> Result<TensorLike, FitError> {
    match spec {
        TensorSpec::Dense { shape, dtype } => {
            Ok(Tensor::zeros(&shape.concrete(0)).with_dtype(*dtype).into())
        }
        TensorSpec::Ragged {
            shape,
            dtype,
            ragged_rank,
        } => {
            let nrows = shape.dim(0).unwrap_or(0);
            let mut splits = vec![vec![0; nrows + 1]];
            splits.extend(std::iter::repeat_n(vec![0], ragged_rank.saturating_sub(1)));
            let mut value_shape = vec![0];
            value_shape.extend(shape.dims().iter().skip(1 + ragged_rank).map(|d| d.unwrap_or(0)));
            let values = Tensor::zeros(&value_shape).with_dtype(*dtype);
            Ok(RaggedTensor::new(values, splits)?.into())
        }
        TensorSpec::Sparse { shape, dtype } => {
            Ok(SparseTensor::new(Vec::new(), Vec::new(), shape.concrete(0), *dtype)?.into())
        }
    }
}

/// Derive the descriptor `transform` would produce for inputs described by
/// `spec`, without real data.
///
/// The transform is traced over a synthetic value in which unknown dimensions
/// have size zero. A zero-sized leading output dimension is reported as
/// unknown when the input batch dimension was unknown; other zero-sized
/// output dimensions are reported as unknown when any inner input dimension
/// was unknown.
pub fn map_spec<F>(transform: F, spec: &TensorSpec) -> Result<TensorSpec, FitError>
where
    F: FnOnce(TensorLike) -> Result<TensorLike, FitError>,
{
    let lead_unknown = spec.shape().rank() > 0 && spec.shape().dim(0).is_none();
    let inner_unknown = spec.shape().dims().iter().skip(1).any(Option::is_none);

    let traced = to_spec(&transform(zero_batch(spec)?)?)?;

    // Only dimensions that came out of the synthetic zero sizes go back to
    // unknown; a reduction over the batch leaves a real leading dimension.
    let mut dims = traced.shape().dims().to_vec();
    for (i, d) in dims.iter_mut().enumerate() {
        let unknown_source = if i == 0 { lead_unknown } else { inner_unknown };
        if unknown_source && *d == Some(0) {
            *d = None;
        }
    }
    tracing::debug!(input = %spec, output = ?dims, "traced spec transform");
    Ok(traced.with_shape(Shape::new(dims)))
}
