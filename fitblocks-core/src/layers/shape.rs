//! Leading-dimension reshaping helpers.
//!
//! Each operation works statically on a [`Shape`] (so model builders can plan
//! layouts with unknown batch sizes) and on concrete [`Tensor`] /
//! [`TensorLike`] values, including ragged and sparse ones.

use crate::error::FitError;
use crate::spec::Shape;
use crate::tensor::{RaggedTensor, SparseTensor, Tensor, TensorLike};

/// Values whose leading dimensions can be merged or split.
pub trait LeadingDims: Sized {
    /// Merge the first `num_dims` dimensions into one. When `leading_dim` is
    /// given, the merged dimension must equal it.
    fn flatten_leading_dims(
        &self,
        num_dims: usize,
        leading_dim: Option<usize>,
    ) -> Result<Self, FitError>;

    /// Split the leading dimension into `dims`; at most one entry may be `-1`.
    fn reshape_leading_dim(&self, dims: &[isize]) -> Result<Self, FitError>;

    /// Split the leading dimension into `(batch_size, element_size)`, inferring
    /// whichever is omitted.
    fn as_batched(
        &self,
        batch_size: Option<usize>,
        element_size: Option<usize>,
    ) -> Result<Self, FitError> {
        let dims = match (batch_size, element_size) {
            (Some(b), Some(e)) => [b as isize, e as isize],
            (Some(b), None) => [b as isize, -1],
            (None, Some(e)) => [-1, e as isize],
            (None, None) => {
                return Err(FitError::shape(
                    "as_batched needs a batch_size or an element_size",
                ));
            }
        };
        self.reshape_leading_dim(&dims)
    }
}

pub fn flatten_leading_dims<T: LeadingDims>(
    x: &T,
    num_dims: usize,
    leading_dim: Option<usize>,
) -> Result<T, FitError> {
    x.flatten_leading_dims(num_dims, leading_dim)
}

pub fn reshape_leading_dim<T: LeadingDims>(x: &T, dims: &[isize]) -> Result<T, FitError> {
    x.reshape_leading_dim(dims)
}

pub fn as_batched<T: LeadingDims>(
    x: &T,
    batch_size: Option<usize>,
    element_size: Option<usize>,
) -> Result<T, FitError> {
    x.as_batched(batch_size, element_size)
}

fn check_num_dims(num_dims: usize, rank: usize) -> Result<(), FitError> {
    if num_dims == 0 || num_dims > rank {
        return Err(FitError::shape(format!(
            "cannot flatten {num_dims} leading dims of a rank {rank} value"
        )));
    }
    Ok(())
}

/// Resolve the concrete (or unknown) sizes that replace a leading dimension.
fn resolve_leading(leading: Option<usize>, dims: &[isize]) -> Result<Vec<Option<usize>>, FitError> {
    if dims.is_empty() {
        return Err(FitError::shape("reshape_leading_dim needs at least one dim"));
    }
    let inferred = dims.iter().filter(|&&d| d == -1).count();
    if inferred > 1 || dims.iter().any(|&d| d < -1) {
        return Err(FitError::shape(format!(
            "invalid leading dims {dims:?}: at most one -1 and no other negatives"
        )));
    }
    let known: usize = dims.iter().filter(|&&d| d >= 0).map(|&d| d as usize).product();

    if inferred == 0 {
        if let Some(l) = leading
            && l != known
        {
            return Err(FitError::shape(format!(
                "Cannot reshape a tensor with leading dimension {l} into {dims:?}"
            )));
        }
        return Ok(dims.iter().map(|&d| Some(d as usize)).collect());
    }

    let fill = match leading {
        Some(l) => {
            if known == 0 || l % known != 0 {
                return Err(FitError::shape(format!(
                    "Cannot reshape a tensor with leading dimension {l} into {dims:?}"
                )));
            }
            Some(l / known)
        }
        None => None,
    };
    Ok(dims
        .iter()
        .map(|&d| if d == -1 { fill } else { Some(d as usize) })
        .collect())
}

impl LeadingDims for Shape {
    fn flatten_leading_dims(
        &self,
        num_dims: usize,
        leading_dim: Option<usize>,
    ) -> Result<Shape, FitError> {
        check_num_dims(num_dims, self.rank())?;
        let head = &self.dims()[..num_dims];
        let merged = head
            .iter()
            .try_fold(1usize, |acc, d| d.map(|d| acc * d));
        let merged = match (merged, leading_dim) {
            (Some(m), Some(l)) if m != l => {
                let what = if self.is_fully_defined() {
                    format!("{} elements", self.concrete(0).iter().product::<usize>())
                } else {
                    format!("leading size {m}")
                };
                let mut target = vec![Some(l)];
                target.extend_from_slice(&self.dims()[num_dims..]);
                return Err(FitError::shape(format!(
                    "Cannot reshape a tensor with {what} to shape {}",
                    Shape::new(target)
                )));
            }
            (Some(m), _) => Some(m),
            (None, l) => l,
        };
        let mut dims = vec![merged];
        dims.extend_from_slice(&self.dims()[num_dims..]);
        Ok(Shape::new(dims))
    }

    fn reshape_leading_dim(&self, dims: &[isize]) -> Result<Shape, FitError> {
        if self.rank() == 0 {
            return Err(FitError::shape("cannot reshape the leading dim of a scalar"));
        }
        let mut out = resolve_leading(self.dims()[0], dims)?;
        out.extend_from_slice(&self.dims()[1..]);
        Ok(Shape::new(out))
    }
}

impl LeadingDims for Tensor {
    fn flatten_leading_dims(
        &self,
        num_dims: usize,
        leading_dim: Option<usize>,
    ) -> Result<Tensor, FitError> {
        let shape = Shape::known(self.shape()).flatten_leading_dims(num_dims, leading_dim)?;
        self.reshape(&shape.concrete(0))
    }

    fn reshape_leading_dim(&self, dims: &[isize]) -> Result<Tensor, FitError> {
        let shape = Shape::known(self.shape()).reshape_leading_dim(dims)?;
        self.reshape(&shape.concrete(0))
    }
}

/// Merge the two outermost dimensions of a ragged value by dropping its
/// outermost row-splits level.
fn merge_ragged_rows(r: &RaggedTensor) -> Result<TensorLike, FitError> {
    if r.ragged_rank() == 1 {
        return Ok(TensorLike::Dense(r.values().clone()));
    }
    let splits = r.row_splits()[1..].to_vec();
    Ok(TensorLike::Ragged(RaggedTensor::new(r.values().clone(), splits)?))
}

fn merge_sparse_leading(s: &SparseTensor, num_dims: usize) -> Result<SparseTensor, FitError> {
    let shape = s.dense_shape();
    let merged: usize = shape[..num_dims].iter().product();
    let indices = s
        .indices()
        .iter()
        .map(|index| {
            let flat = index[..num_dims]
                .iter()
                .zip(&shape[..num_dims])
                .fold(0, |acc, (i, d)| acc * d + i);
            let mut out = vec![flat];
            out.extend_from_slice(&index[num_dims..]);
            out
        })
        .collect();
    let mut dense_shape = vec![merged];
    dense_shape.extend_from_slice(&shape[num_dims..]);
    SparseTensor::new(indices, s.values().to_vec(), dense_shape, s.dtype())
}

fn split_sparse_leading(s: &SparseTensor, dims: &[usize]) -> Result<SparseTensor, FitError> {
    let indices = s
        .indices()
        .iter()
        .map(|index| {
            let mut rest = index[0];
            let mut head = vec![0; dims.len()];
            for (slot, d) in head.iter_mut().zip(dims).rev() {
                *slot = rest % d;
                rest /= d;
            }
            head.extend_from_slice(&index[1..]);
            head
        })
        .collect();
    let mut dense_shape = dims.to_vec();
    dense_shape.extend_from_slice(&s.dense_shape()[1..]);
    SparseTensor::new(indices, s.values().to_vec(), dense_shape, s.dtype())
}

fn leading_len(x: &TensorLike) -> usize {
    match x {
        TensorLike::Dense(t) => t.rows(),
        TensorLike::Ragged(r) => r.nrows(),
        TensorLike::Sparse(s) => s.dense_shape().first().copied().unwrap_or(1),
    }
}

impl LeadingDims for TensorLike {
    fn flatten_leading_dims(
        &self,
        num_dims: usize,
        leading_dim: Option<usize>,
    ) -> Result<TensorLike, FitError> {
        let out = match self {
            TensorLike::Dense(t) => TensorLike::Dense(t.flatten_leading_dims(num_dims, None)?),
            TensorLike::Ragged(r) => {
                check_num_dims(num_dims, r.ragged_rank() + r.values().rank())?;
                let mut cur = TensorLike::Ragged(r.clone());
                for _ in 1..num_dims {
                    cur = match cur {
                        TensorLike::Ragged(r) => merge_ragged_rows(&r)?,
                        other => other.flatten_leading_dims(2, None)?,
                    };
                }
                cur
            }
            TensorLike::Sparse(s) => {
                check_num_dims(num_dims, s.dense_shape().len())?;
                TensorLike::Sparse(merge_sparse_leading(s, num_dims)?)
            }
        };
        if let Some(l) = leading_dim {
            let actual = leading_len(&out);
            if actual != l {
                return Err(FitError::shape(format!(
                    "Cannot reshape a tensor with leading dimension {actual} to {l}"
                )));
            }
        }
        Ok(out)
    }

    fn reshape_leading_dim(&self, dims: &[isize]) -> Result<TensorLike, FitError> {
        match self {
            TensorLike::Dense(t) => Ok(TensorLike::Dense(t.reshape_leading_dim(dims)?)),
            TensorLike::Ragged(r) => {
                let resolved: Vec<usize> = resolve_leading(Some(r.nrows()), dims)?
                    .into_iter()
                    .map(|d| d.unwrap_or(0))
                    .collect();
                let mut levels = Vec::with_capacity(resolved.len() - 1 + r.ragged_rank());
                let mut count = 1;
                for pair in resolved.windows(2) {
                    count *= pair[0];
                    let step = pair[1];
                    levels.push((0..=count).map(|i| i * step).collect());
                }
                levels.extend(r.row_splits().iter().cloned());
                Ok(TensorLike::Ragged(RaggedTensor::new(r.values().clone(), levels)?))
            }
            TensorLike::Sparse(s) => {
                let leading = s
                    .dense_shape()
                    .first()
                    .copied()
                    .ok_or_else(|| FitError::shape("cannot reshape the leading dim of a scalar"))?;
                let resolved: Vec<usize> = resolve_leading(Some(leading), dims)?
                    .into_iter()
                    .map(|d| d.unwrap_or(0))
                    .collect();
                Ok(TensorLike::Sparse(split_sparse_leading(s, &resolved)?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DType;

    fn shape(dims: &[Option<usize>]) -> Shape {
        Shape::new(dims.to_vec())
    }

    #[test]
    fn test_flatten_leading_dims_static() {
        let x = Shape::known(&[2, 3, 4]);
        assert_eq!(flatten_leading_dims(&x, 1, None).unwrap(), Shape::known(&[2, 3, 4]));
        assert_eq!(flatten_leading_dims(&x, 2, None).unwrap(), Shape::known(&[6, 4]));
        assert_eq!(flatten_leading_dims(&x, 3, None).unwrap(), Shape::known(&[24]));

        let err = flatten_leading_dims(&x, 2, Some(8)).unwrap_err();
        assert!(err.to_string().contains("Cannot reshape a tensor with"));
    }

    #[test]
    fn test_flatten_leading_dims_unknown() {
        let x = shape(&[None, None, Some(4)]);
        assert_eq!(flatten_leading_dims(&x, 1, None).unwrap(), x);
        assert_eq!(
            flatten_leading_dims(&x, 2, None).unwrap(),
            shape(&[None, Some(4)])
        );
        assert_eq!(flatten_leading_dims(&x, 3, None).unwrap(), shape(&[None]));
        assert!(flatten_leading_dims(&x, 4, None).is_err());
    }

    #[test]
    fn test_flatten_ragged() {
        let values = Tensor::vector(&[2.0, 3.0, 4.0]);
        let rt: TensorLike = RaggedTensor::from_row_lengths(values, &[2, 1]).unwrap().into();
        let flat = flatten_leading_dims(&rt, 2, None).unwrap();
        assert_eq!(flat.as_dense().unwrap().shape(), &[3]);
    }

    #[test]
    fn test_reshape_leading_dim_static() {
        let x = Shape::known(&[10, 3]);
        assert_eq!(reshape_leading_dim(&x, &[2, 5]).unwrap(), Shape::known(&[2, 5, 3]));
        assert_eq!(reshape_leading_dim(&x, &[5, -1]).unwrap(), Shape::known(&[5, 2, 3]));
        assert!(reshape_leading_dim(&x, &[3, -1]).is_err());
        assert!(reshape_leading_dim(&x, &[-1, -1]).is_err());

        let x = shape(&[None, Some(3)]);
        assert_eq!(
            reshape_leading_dim(&x, &[-1, 2]).unwrap(),
            shape(&[None, Some(2), Some(3)])
        );
        assert_eq!(
            reshape_leading_dim(&x, &[5, 2]).unwrap(),
            Shape::known(&[5, 2, 3])
        );
    }

    #[test]
    fn test_reshape_ragged_leading_dim() {
        let x = Tensor::zeros(&[100]);
        let rt: TensorLike = RaggedTensor::from_row_lengths(x, &[50, 30, 10, 10])
            .unwrap()
            .into();
        let out = reshape_leading_dim(&rt, &[2, 2]).unwrap();
        let TensorLike::Ragged(out) = out else {
            panic!("expected ragged output");
        };
        assert_eq!(out.ragged_rank(), 2);
        assert_eq!(out.row_splits()[0], vec![0, 2, 4]);
        assert_eq!(out.row_splits()[1], vec![0, 50, 80, 90, 100]);
    }

    #[test]
    fn test_as_batched() {
        let x = Shape::known(&[10, 3]);
        let expected = Shape::known(&[5, 2, 3]);
        assert_eq!(as_batched(&x, Some(5), None).unwrap(), expected);
        assert_eq!(as_batched(&x, Some(5), Some(2)).unwrap(), expected);
        assert_eq!(as_batched(&x, None, Some(2)).unwrap(), expected);
        assert!(as_batched(&x, None, None).is_err());
    }

    #[test]
    fn test_dense_values_follow_shape() {
        let t = Tensor::new(vec![4, 2], (0..8).map(|v| v as f32).collect()).unwrap();
        let b = t.as_batched(Some(2), None).unwrap();
        assert_eq!(b.shape(), &[2, 2, 2]);
        assert_eq!(b.data(), t.data());
        assert_eq!(b.flatten_leading_dims(2, Some(4)).unwrap(), t);
    }

    #[test]
    fn test_sparse_round_trip() {
        let s = SparseTensor::new(
            vec![vec![0, 1], vec![3, 0]],
            vec![1.0, 2.0],
            vec![4, 2],
            DType::Float32,
        )
        .unwrap();
        let x: TensorLike = s.into();
        let split = reshape_leading_dim(&x, &[2, 2]).unwrap();
        let TensorLike::Sparse(ref inner) = split else {
            panic!("expected sparse output");
        };
        assert_eq!(inner.dense_shape(), &[2, 2, 2]);
        assert_eq!(inner.indices(), &[vec![0, 0, 1], vec![1, 1, 0]]);
        assert_eq!(flatten_leading_dims(&split, 2, None).unwrap(), x);
    }
}
