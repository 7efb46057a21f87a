//! # fitblocks-core
//!
//! Training-loop glue: checkpoint tracking, batch/epoch value updaters, log
//! aggregation, shape/spec helpers and the [`Trainable`] orchestrator, plus
//! the small model, optimizer, loss and data-source implementations they
//! run against.

pub mod config;
pub mod error;
pub mod initializers;
pub mod layers;
pub mod losses;
pub mod metrics;
pub mod ops;
pub mod persistence;
pub mod regularizers;
pub mod schedules;
pub mod spec;
pub mod tensor;
pub mod training;

pub use config::{FitConfig, StoppingCriterion, load_config};
pub use error::FitError;
pub use spec::{Input, Shape, TensorSpec, map_spec, to_input, to_spec};
pub use tensor::{DType, RaggedTensor, SparseTensor, Tensor, TensorLike};
pub use training::{
    CheckpointTracker, DataSource, Event, Hooks, LogUpdater, Logs, Model, Optimizer, Split,
    Trainable, UpdateFrequency, ValueUpdater, Variable,
};
