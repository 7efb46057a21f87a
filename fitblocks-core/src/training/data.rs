//! Data-source collaborator: batched, repeating streams per split.

use crate::error::FitError;
use crate::spec::{Shape, TensorSpec};
use crate::tensor::{DType, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Train,
    Validation,
    Test,
}

impl FromStr for Split {
    type Err = FitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "train" => Ok(Self::Train),
            "validation" | "val" => Ok(Self::Validation),
            "test" => Ok(Self::Test),
            other => Err(FitError::config(format!(
                "unknown split \"{other}\" - expected train, validation or test"
            ))),
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Train => "train",
            Self::Validation => "validation",
            Self::Test => "test",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub features: Tensor,
    pub labels: Tensor,
}

impl Batch {
    pub fn size(&self) -> usize {
        self.features.rows()
    }
}

pub type Batches = Box<dyn Iterator<Item = Result<Batch, FitError>> + Send>;

/// Shuffling applied to a stream. Each pass over the split reshuffles with
/// `seed + pass`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shuffle {
    /// Size of the sliding shuffle buffer; `None` shuffles the whole split.
    pub buffer: Option<usize>,
    pub seed: u64,
}

pub trait DataSource: Send {
    fn name(&self) -> &str;

    fn examples_per_epoch(&self, split: Split) -> Result<usize, FitError>;

    /// Batches needed to cover one epoch of `split`; the last may be partial.
    fn steps_per_epoch(&self, split: Split, batch_size: usize) -> Result<usize, FitError> {
        if batch_size == 0 {
            return Err(FitError::config("batch_size must be at least 1"));
        }
        Ok(self.examples_per_epoch(split)?.div_ceil(batch_size))
    }

    /// A stream that repeats the split indefinitely, `batch_size` examples at
    /// a time. Consumers decide how many batches make an epoch.
    fn batches(
        &self,
        split: Split,
        batch_size: usize,
        shuffle: Option<Shuffle>,
    ) -> Result<Batches, FitError>;

    fn features_spec(&self) -> TensorSpec;

    fn labels_spec(&self) -> TensorSpec;
}

#[derive(Debug, Clone)]
struct SplitData {
    features: Arc<Tensor>,
    labels: Arc<Tensor>,
}

/// Splits held in memory as `(examples, ...)` feature and label tensors.
#[derive(Debug, Clone)]
pub struct InMemoryDataSource {
    name: String,
    splits: BTreeMap<Split, SplitData>,
}

impl InMemoryDataSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            splits: BTreeMap::new(),
        }
    }

    pub fn with_split(mut self, split: Split, features: Tensor, labels: Tensor) -> Result<Self, FitError> {
        if features.rank() == 0 || labels.rank() == 0 {
            return Err(FitError::shape("split tensors need a leading example dimension"));
        }
        if features.rows() != labels.rows() {
            return Err(FitError::shape(format!(
                "{split}: {} feature rows but {} label rows",
                features.rows(),
                labels.rows()
            )));
        }
        if let Some(existing) = self.splits.values().next()
            && existing.features.shape()[1..] != features.shape()[1..]
        {
            return Err(FitError::shape(format!(
                "{split}: feature shape {:?} differs from other splits {:?}",
                features.shape(),
                existing.features.shape()
            )));
        }
        self.splits.insert(
            split,
            SplitData {
                features: Arc::new(features),
                labels: Arc::new(labels),
            },
        );
        Ok(self)
    }

    /// Noisy linear regression `y = x . w + 0.5` with `w_i = (-1)^i / (i + 1)`.
    /// Splits train/validation 80/20.
    pub fn regression(examples: usize, features: usize, seed: u64) -> Result<Self, FitError> {
        let mut rng = StdRng::seed_from_u64(seed);
        let weights: Vec<f32> = (0..features)
            .map(|i| {
                let sign = if i % 2 == 0 { 1.0 } else { -1.0 };
                sign / (i + 1) as f32
            })
            .collect();
        let mut x = Vec::with_capacity(examples * features);
        let mut y = Vec::with_capacity(examples);
        for _ in 0..examples {
            let row: Vec<f32> = (0..features).map(|_| rng.gen_range(-1.0..1.0)).collect();
            let target: f32 = row.iter().zip(&weights).map(|(a, b)| a * b).sum::<f32>()
                + 0.5
                + rng.gen_range(-0.01..0.01);
            x.extend(row);
            y.push(target);
        }
        let x = Tensor::new(vec![examples, features], x)?;
        let y = Tensor::new(vec![examples, 1], y)?;
        Self::split_80_20("regression", x, y)
    }

    /// Gaussian blobs, one per class, centred on the class's axis.
    pub fn classification(
        examples: usize,
        features: usize,
        classes: usize,
        seed: u64,
    ) -> Result<Self, FitError> {
        if classes < 2 || features == 0 {
            return Err(FitError::config("classification needs at least 2 classes and 1 feature"));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut x = Vec::with_capacity(examples * features);
        let mut y = Vec::with_capacity(examples);
        for _ in 0..examples {
            let class = rng.gen_range(0..classes);
            for f in 0..features {
                let centre = if f == class % features { 2.0 } else { 0.0 };
                let sign = if class >= features { -1.0 } else { 1.0 };
                x.push(sign * centre + rng.gen_range(-0.5..0.5));
            }
            y.push(class as f32);
        }
        let x = Tensor::new(vec![examples, features], x)?;
        let y = Tensor::new(vec![examples], y)?.with_dtype(DType::Int64);
        Self::split_80_20("classification", x, y)
    }

    fn split_80_20(name: &str, x: Tensor, y: Tensor) -> Result<Self, FitError> {
        let n = x.rows();
        let cut = n * 4 / 5;
        let train: Vec<usize> = (0..cut).collect();
        let val: Vec<usize> = (cut..n).collect();
        Self::new(name)
            .with_split(Split::Train, x.gather_rows(&train)?, y.gather_rows(&train)?)?
            .with_split(Split::Validation, x.gather_rows(&val)?, y.gather_rows(&val)?)
    }

    fn split(&self, split: Split) -> Result<&SplitData, FitError> {
        self.splits
            .get(&split)
            .ok_or_else(|| FitError::not_found(format!("{} has no {split} split", self.name)))
    }

    fn spec_of(&self, pick: impl Fn(&SplitData) -> &Tensor) -> TensorSpec {
        match self.splits.values().next() {
            Some(data) => {
                let t = pick(data);
                let mut dims: Vec<Option<usize>> = t.shape().iter().copied().map(Some).collect();
                dims[0] = None;
                TensorSpec::dense(Shape::new(dims), t.dtype())
            }
            None => TensorSpec::dense(Shape::new(vec![None]), DType::Float32),
        }
    }
}

impl DataSource for InMemoryDataSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn examples_per_epoch(&self, split: Split) -> Result<usize, FitError> {
        Ok(self.split(split)?.features.rows())
    }

    fn batches(
        &self,
        split: Split,
        batch_size: usize,
        shuffle: Option<Shuffle>,
    ) -> Result<Batches, FitError> {
        if batch_size == 0 {
            return Err(FitError::config("batch_size must be at least 1"));
        }
        let data = self.split(split)?.clone();
        if data.features.rows() == 0 {
            return Err(FitError::config(format!("{} {split} split is empty", self.name)));
        }
        if shuffle.is_some_and(|s| s.buffer == Some(0)) {
            return Err(FitError::config("shuffle buffer must be at least 1"));
        }
        Ok(Box::new(RepeatingBatches {
            data,
            batch_size,
            shuffle,
            pass: 0,
            order: Vec::new(),
            pos: 0,
        }))
    }

    fn features_spec(&self) -> TensorSpec {
        self.spec_of(|d| &d.features)
    }

    fn labels_spec(&self) -> TensorSpec {
        self.spec_of(|d| &d.labels)
    }
}

struct RepeatingBatches {
    data: SplitData,
    batch_size: usize,
    shuffle: Option<Shuffle>,
    pass: u64,
    order: Vec<usize>,
    pos: usize,
}

/// Emit `0..n` through a sliding buffer of `buffer` slots: each output is
/// drawn uniformly from the buffer and its slot refilled from the input.
fn buffered_order(n: usize, buffer: usize, rng: &mut StdRng) -> Vec<usize> {
    let mut pending = 0..n;
    let mut slots: Vec<usize> = pending.by_ref().take(buffer).collect();
    let mut out = Vec::with_capacity(n);
    while !slots.is_empty() {
        let i = rng.gen_range(0..slots.len());
        out.push(match pending.next() {
            Some(next) => std::mem::replace(&mut slots[i], next),
            None => slots.swap_remove(i),
        });
    }
    out
}

impl RepeatingBatches {
    fn start_pass(&mut self) {
        let n = self.data.features.rows();
        self.order = match self.shuffle {
            None => (0..n).collect(),
            Some(Shuffle { buffer, seed }) => {
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(self.pass));
                match buffer {
                    Some(b) if b < n => buffered_order(n, b, &mut rng),
                    _ => {
                        let mut all: Vec<usize> = (0..n).collect();
                        all.shuffle(&mut rng);
                        all
                    }
                }
            }
        };
        self.pos = 0;
        self.pass += 1;
    }
}

impl Iterator for RepeatingBatches {
    type Item = Result<Batch, FitError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.order.len() {
            self.start_pass();
        }
        let end = (self.pos + self.batch_size).min(self.order.len());
        let indices = &self.order[self.pos..end];
        self.pos = end;
        let batch = self
            .data
            .features
            .gather_rows(indices)
            .and_then(|features| {
                Ok(Batch {
                    features,
                    labels: self.data.labels.gather_rows(indices)?,
                })
            });
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(n: usize) -> InMemoryDataSource {
        let x = Tensor::new(vec![n, 1], (0..n).map(|i| i as f32).collect()).unwrap();
        let y = Tensor::new(vec![n], (0..n).map(|i| i as f32).collect()).unwrap();
        InMemoryDataSource::new("counting")
            .with_split(Split::Train, x.clone(), y.clone())
            .unwrap()
    }

    #[test]
    fn test_split_parse() {
        assert_eq!("val".parse::<Split>().unwrap(), Split::Validation);
        assert_eq!(Split::Test.to_string(), "test");
        assert!(matches!("dev".parse::<Split>(), Err(FitError::Config(_))));
    }

    #[test]
    fn test_steps_per_epoch_rounds_up() {
        let s = source(10);
        assert_eq!(s.steps_per_epoch(Split::Train, 4).unwrap(), 3);
        assert_eq!(s.steps_per_epoch(Split::Train, 5).unwrap(), 2);
        assert!(s.steps_per_epoch(Split::Validation, 4).is_err());
    }

    #[test]
    fn test_unshuffled_stream_repeats_with_partial_last_batch() {
        let s = source(5);
        let sizes: Vec<usize> = s
            .batches(Split::Train, 2, None)
            .unwrap()
            .take(4)
            .map(|b| b.unwrap().size())
            .collect();
        assert_eq!(sizes, vec![2, 2, 1, 2]);

        let mut stream = s.batches(Split::Train, 5, None).unwrap();
        let first = stream.next().unwrap().unwrap();
        let second = stream.next().unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.labels.data(), &[0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_shuffle_is_a_permutation_that_varies_per_pass() {
        let s = source(20);
        let shuffle = Shuffle { buffer: None, seed: 7 };
        let mut stream = s.batches(Split::Train, 20, Some(shuffle)).unwrap();
        let a = stream.next().unwrap().unwrap().labels.into_data();
        let b = stream.next().unwrap().unwrap().labels.into_data();
        assert_ne!(a, b);
        let mut sorted = a.clone();
        sorted.sort_by(f32::total_cmp);
        assert_eq!(sorted, (0..20).map(|i| i as f32).collect::<Vec<_>>());

        // Same seed, same order.
        let again = s.batches(Split::Train, 20, Some(shuffle)).unwrap().next().unwrap().unwrap();
        assert_eq!(again.labels.into_data(), a);
    }

    #[test]
    fn test_buffered_order_is_local() {
        let mut rng = StdRng::seed_from_u64(0);
        let order = buffered_order(100, 3, &mut rng);
        let mut sorted = order.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..100).collect::<Vec<_>>());
        // With 3 slots, position i can only hold elements up to i + 2.
        assert!(order.iter().enumerate().all(|(i, &v)| v <= i + 2));
    }

    #[test]
    fn test_mismatched_rows_rejected() {
        let res = InMemoryDataSource::new("bad").with_split(
            Split::Train,
            Tensor::zeros(&[3, 2]),
            Tensor::zeros(&[2]),
        );
        assert!(matches!(res, Err(FitError::Shape(_))));
    }

    #[test]
    fn test_synthetic_problems() {
        let reg = InMemoryDataSource::regression(50, 3, 1).unwrap();
        assert_eq!(reg.examples_per_epoch(Split::Train).unwrap(), 40);
        assert_eq!(reg.examples_per_epoch(Split::Validation).unwrap(), 10);
        assert_eq!(reg.features_spec().shape().to_string(), "(None, 3)");

        let cls = InMemoryDataSource::classification(30, 2, 3, 1).unwrap();
        assert_eq!(cls.labels_spec().dtype(), DType::Int64);
        let batch = cls.batches(Split::Train, 8, None).unwrap().next().unwrap().unwrap();
        assert!(batch.labels.data().iter().all(|&c| (0.0..3.0).contains(&c)));
    }
}
