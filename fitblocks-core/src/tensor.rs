//! Concrete tensor-like values: dense, ragged and sparse.
//!
//! These are deliberately small: enough arithmetic for the built-in layer,
//! losses and metrics, plus the structural operations the shape helpers need.
//! Storage is always `f32`; the [`DType`] tag records the logical element type.

use crate::error::FitError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// Logical element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    Float32,
    Float64,
    Int32,
    Int64,
    Bool,
}

impl DType {
    pub fn is_floating(&self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Bool => "bool",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Dense row-major tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    dtype: DType,
    data: Vec<f32>,
}

impl Tensor {
    /// Create a `float32` tensor, checking that `data` fills `shape` exactly.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, FitError> {
        Self::from_parts(shape, DType::Float32, data)
    }

    pub fn from_parts(shape: Vec<usize>, dtype: DType, data: Vec<f32>) -> Result<Self, FitError> {
        if numel(&shape) != data.len() {
            return Err(FitError::shape(format!(
                "shape {shape:?} needs {} elements, got {}",
                numel(&shape),
                data.len()
            )));
        }
        Ok(Self { shape, dtype, data })
    }

    pub fn full(shape: &[usize], value: f32) -> Self {
        Self {
            shape: shape.to_vec(),
            dtype: DType::Float32,
            data: vec![value; numel(shape)],
        }
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, 0.0)
    }

    pub fn ones(shape: &[usize]) -> Self {
        Self::full(shape, 1.0)
    }

    pub fn zeros_like(other: &Tensor) -> Self {
        Self {
            shape: other.shape.clone(),
            dtype: other.dtype,
            data: vec![0.0; other.data.len()],
        }
    }

    pub fn scalar(value: f32) -> Self {
        Self {
            shape: Vec::new(),
            dtype: DType::Float32,
            data: vec![value],
        }
    }

    /// 1-D tensor from a slice of values.
    pub fn vector(values: &[f32]) -> Self {
        Self {
            shape: vec![values.len()],
            dtype: DType::Float32,
            data: values.to_vec(),
        }
    }

    /// Retag the logical element type.
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Size of the leading dimension (1 for scalars).
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(1)
    }

    /// Number of elements in one leading-dimension slice.
    pub fn row_len(&self) -> usize {
        numel(self.shape.get(1..).unwrap_or(&[]))
    }

    pub fn reshape(&self, shape: &[usize]) -> Result<Tensor, FitError> {
        if numel(shape) != self.data.len() {
            return Err(FitError::shape(format!(
                "Cannot reshape a tensor with {} elements to shape {shape:?}",
                self.data.len()
            )));
        }
        Ok(Self {
            shape: shape.to_vec(),
            dtype: self.dtype,
            data: self.data.clone(),
        })
    }

    /// Select leading-dimension slices by index.
    pub fn gather_rows(&self, indices: &[usize]) -> Result<Tensor, FitError> {
        if self.rank() == 0 {
            return Err(FitError::shape("cannot gather rows of a scalar"));
        }
        let row_len = self.row_len();
        let rows = self.rows();
        let mut data = Vec::with_capacity(indices.len() * row_len);
        for &i in indices {
            if i >= rows {
                return Err(FitError::shape(format!(
                    "row index {i} out of range for {rows} rows"
                )));
            }
            data.extend_from_slice(&self.data[i * row_len..(i + 1) * row_len]);
        }
        let mut shape = self.shape.clone();
        shape[0] = indices.len();
        Ok(Self {
            shape,
            dtype: self.dtype,
            data,
        })
    }

    fn require_rank(&self, rank: usize, op: &str) -> Result<(), FitError> {
        if self.rank() != rank {
            return Err(FitError::shape(format!(
                "{op} expects rank {rank}, got shape {:?}",
                self.shape
            )));
        }
        Ok(())
    }

    fn require_same_shape(&self, other: &Tensor, op: &str) -> Result<(), FitError> {
        if self.shape != other.shape {
            return Err(FitError::shape(format!(
                "{op}: shapes {:?} and {:?} differ",
                self.shape, other.shape
            )));
        }
        Ok(())
    }

    /// 2-D matrix product.
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor, FitError> {
        self.require_rank(2, "matmul")?;
        other.require_rank(2, "matmul")?;
        let (n, k) = (self.shape[0], self.shape[1]);
        let (k2, m) = (other.shape[0], other.shape[1]);
        if k != k2 {
            return Err(FitError::shape(format!(
                "matmul: inner dimensions {k} and {k2} differ"
            )));
        }
        let mut out = vec![0.0f32; n * m];
        for i in 0..n {
            for p in 0..k {
                let a = self.data[i * k + p];
                if a == 0.0 {
                    continue;
                }
                let row = &other.data[p * m..(p + 1) * m];
                for (o, b) in out[i * m..(i + 1) * m].iter_mut().zip(row) {
                    *o += a * b;
                }
            }
        }
        Tensor::new(vec![n, m], out)
    }

    pub fn transpose(&self) -> Result<Tensor, FitError> {
        self.require_rank(2, "transpose")?;
        let (n, m) = (self.shape[0], self.shape[1]);
        let mut out = vec![0.0f32; n * m];
        for i in 0..n {
            for j in 0..m {
                out[j * n + i] = self.data[i * m + j];
            }
        }
        Ok(Self {
            shape: vec![m, n],
            dtype: self.dtype,
            data: out,
        })
    }

    fn zip_with(
        &self,
        other: &Tensor,
        op: &str,
        f: impl Fn(f32, f32) -> f32,
    ) -> Result<Tensor, FitError> {
        self.require_same_shape(other, op)?;
        Ok(Self {
            shape: self.shape.clone(),
            dtype: self.dtype,
            data: self
                .data
                .iter()
                .zip(&other.data)
                .map(|(&a, &b)| f(a, b))
                .collect(),
        })
    }

    pub fn add(&self, other: &Tensor) -> Result<Tensor, FitError> {
        self.zip_with(other, "add", |a, b| a + b)
    }

    pub fn sub(&self, other: &Tensor) -> Result<Tensor, FitError> {
        self.zip_with(other, "sub", |a, b| a - b)
    }

    pub fn mul(&self, other: &Tensor) -> Result<Tensor, FitError> {
        self.zip_with(other, "mul", |a, b| a * b)
    }

    pub fn map(&self, f: impl Fn(f32) -> f32) -> Tensor {
        Self {
            shape: self.shape.clone(),
            dtype: self.dtype,
            data: self.data.iter().map(|&v| f(v)).collect(),
        }
    }

    pub fn scale(&self, factor: f32) -> Tensor {
        self.map(|v| v * factor)
    }

    /// Add a 1-D `row` to every row of a 2-D tensor.
    pub fn add_row(&self, row: &Tensor) -> Result<Tensor, FitError> {
        self.require_rank(2, "add_row")?;
        row.require_rank(1, "add_row")?;
        let m = self.shape[1];
        if row.shape[0] != m {
            return Err(FitError::shape(format!(
                "add_row: row of length {} does not match {m} columns",
                row.shape[0]
            )));
        }
        let mut out = self.clone();
        for chunk in out.data.chunks_mut(m) {
            for (o, b) in chunk.iter_mut().zip(&row.data) {
                *o += b;
            }
        }
        Ok(out)
    }

    /// Sum a 2-D tensor over its rows, yielding one value per column.
    pub fn sum_rows(&self) -> Result<Tensor, FitError> {
        self.require_rank(2, "sum_rows")?;
        let m = self.shape[1];
        let mut out = vec![0.0f32; m];
        for chunk in self.data.chunks(m.max(1)) {
            for (o, v) in out.iter_mut().zip(chunk) {
                *o += v;
            }
        }
        Tensor::new(vec![m], out)
    }

    /// Keep `range` along the last axis.
    pub fn slice_last(&self, range: Range<usize>) -> Result<Tensor, FitError> {
        let last = *self
            .shape
            .last()
            .ok_or_else(|| FitError::shape("cannot slice a scalar"))?;
        if range.start > range.end || range.end > last {
            return Err(FitError::shape(format!(
                "slice {range:?} out of bounds for last dimension {last}"
            )));
        }
        let width = range.end - range.start;
        let mut data = Vec::with_capacity(self.data.len() / last.max(1) * width);
        if last > 0 {
            for chunk in self.data.chunks(last) {
                data.extend_from_slice(&chunk[range.clone()]);
            }
        }
        let mut shape = self.shape.clone();
        if let Some(l) = shape.last_mut() {
            *l = width;
        }
        Ok(Self {
            shape,
            dtype: self.dtype,
            data,
        })
    }

    /// Numerically stable softmax over the last axis of a 2-D tensor.
    pub fn softmax_rows(&self) -> Result<Tensor, FitError> {
        self.require_rank(2, "softmax_rows")?;
        let m = self.shape[1];
        let mut out = self.clone();
        for row in out.data.chunks_mut(m.max(1)) {
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let mut total = 0.0f32;
            for v in row.iter_mut() {
                *v = (*v - max).exp();
                total += *v;
            }
            for v in row.iter_mut() {
                *v /= total;
            }
        }
        Ok(out)
    }

    /// Index of the maximum along the last axis of a 2-D tensor.
    pub fn argmax_rows(&self) -> Result<Vec<usize>, FitError> {
        self.require_rank(2, "argmax_rows")?;
        let m = self.shape[1];
        Ok(self
            .data
            .chunks(m.max(1))
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
                        if v > best.1 { (i, v) } else { best }
                    })
                    .0
            })
            .collect())
    }

    pub fn sum(&self) -> f64 {
        self.data.iter().map(|&v| v as f64).sum()
    }

    pub fn mean(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.sum() / self.data.len() as f64
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }
}

/// Variable-length rows over a flat values tensor.
///
/// `row_splits[0]` partitions the outermost rows, each following level
/// partitions the level below it, and the last level indexes rows of `values`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaggedTensor {
    values: Tensor,
    row_splits: Vec<Vec<usize>>,
}

impl RaggedTensor {
    pub fn new(values: Tensor, row_splits: Vec<Vec<usize>>) -> Result<Self, FitError> {
        let ragged = Self { values, row_splits };
        ragged.validate()?;
        Ok(ragged)
    }

    /// Build a ragged-rank-1 tensor from per-row lengths.
    pub fn from_row_lengths(values: Tensor, row_lengths: &[usize]) -> Result<Self, FitError> {
        let mut splits = Vec::with_capacity(row_lengths.len() + 1);
        splits.push(0);
        for len in row_lengths {
            splits.push(splits[splits.len() - 1] + len);
        }
        Self::new(values, vec![splits])
    }

    /// Check that every splits level starts at zero, never decreases and ends
    /// at the size of the level below.
    pub fn validate(&self) -> Result<(), FitError> {
        if self.row_splits.is_empty() {
            return Err(FitError::type_mismatch("ragged tensor without row splits"));
        }
        if self.values.rank() == 0 {
            return Err(FitError::type_mismatch("ragged values must have rank >= 1"));
        }
        for (level, splits) in self.row_splits.iter().enumerate() {
            let below = match self.row_splits.get(level + 1) {
                Some(next) => next.len().saturating_sub(1),
                None => self.values.rows(),
            };
            if splits.first() != Some(&0) {
                return Err(FitError::type_mismatch(format!(
                    "row splits level {level} must start at 0"
                )));
            }
            if splits.windows(2).any(|w| w[0] > w[1]) {
                return Err(FitError::type_mismatch(format!(
                    "row splits level {level} must be non-decreasing"
                )));
            }
            if splits.last() != Some(&below) {
                return Err(FitError::type_mismatch(format!(
                    "row splits level {level} ends at {:?}, expected {below}",
                    splits.last()
                )));
            }
        }
        Ok(())
    }

    pub fn values(&self) -> &Tensor {
        &self.values
    }

    pub fn row_splits(&self) -> &[Vec<usize>] {
        &self.row_splits
    }

    pub fn ragged_rank(&self) -> usize {
        self.row_splits.len()
    }

    pub fn nrows(&self) -> usize {
        self.row_splits[0].len() - 1
    }

    pub fn dtype(&self) -> DType {
        self.values.dtype()
    }

    /// Lengths of the outermost rows.
    pub fn row_lengths(&self) -> Vec<usize> {
        self.row_splits[0].windows(2).map(|w| w[1] - w[0]).collect()
    }

    pub fn into_parts(self) -> (Tensor, Vec<Vec<usize>>) {
        (self.values, self.row_splits)
    }
}

/// Coordinate-format sparse tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseTensor {
    indices: Vec<Vec<usize>>,
    values: Vec<f32>,
    dense_shape: Vec<usize>,
    dtype: DType,
}

impl SparseTensor {
    pub fn new(
        indices: Vec<Vec<usize>>,
        values: Vec<f32>,
        dense_shape: Vec<usize>,
        dtype: DType,
    ) -> Result<Self, FitError> {
        let sparse = Self {
            indices,
            values,
            dense_shape,
            dtype,
        };
        sparse.validate()?;
        Ok(sparse)
    }

    pub fn validate(&self) -> Result<(), FitError> {
        if self.indices.len() != self.values.len() {
            return Err(FitError::type_mismatch(format!(
                "{} indices for {} values",
                self.indices.len(),
                self.values.len()
            )));
        }
        for index in &self.indices {
            if index.len() != self.dense_shape.len()
                || index.iter().zip(&self.dense_shape).any(|(i, d)| i >= d)
            {
                return Err(FitError::type_mismatch(format!(
                    "index {index:?} outside dense shape {:?}",
                    self.dense_shape
                )));
            }
        }
        Ok(())
    }

    pub fn indices(&self) -> &[Vec<usize>] {
        &self.indices
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dense_shape(&self) -> &[usize] {
        &self.dense_shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn to_dense(&self) -> Result<Tensor, FitError> {
        let mut data = vec![0.0f32; numel(&self.dense_shape)];
        for (index, &value) in self.indices.iter().zip(&self.values) {
            let mut flat = 0;
            for (i, d) in index.iter().zip(&self.dense_shape) {
                flat = flat * d + i;
            }
            data[flat] += value;
        }
        Tensor::from_parts(self.dense_shape.clone(), self.dtype, data)
    }
}

/// Any concrete tensor-like value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TensorLike {
    Dense(Tensor),
    Ragged(RaggedTensor),
    Sparse(SparseTensor),
}

impl TensorLike {
    pub fn dtype(&self) -> DType {
        match self {
            Self::Dense(t) => t.dtype(),
            Self::Ragged(r) => r.dtype(),
            Self::Sparse(s) => s.dtype(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Dense(_) => "dense",
            Self::Ragged(_) => "ragged",
            Self::Sparse(_) => "sparse",
        }
    }

    pub fn as_dense(&self) -> Option<&Tensor> {
        match self {
            Self::Dense(t) => Some(t),
            _ => None,
        }
    }
}

impl From<Tensor> for TensorLike {
    fn from(t: Tensor) -> Self {
        Self::Dense(t)
    }
}

impl From<RaggedTensor> for TensorLike {
    fn from(r: RaggedTensor) -> Self {
        Self::Ragged(r)
    }
}

impl From<SparseTensor> for TensorLike {
    fn from(s: SparseTensor) -> Self {
        Self::Sparse(s)
    }
}
