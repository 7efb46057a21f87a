//! Training orchestration: the run loop and the collaborators it drives.

pub mod benchmark;
pub mod checkpoint;
pub mod data;
pub mod events;
pub mod log_updater;
pub mod logger;
pub mod model;
pub mod optimizer;
pub mod trainable;
pub mod value_updater;
pub mod variable;

pub use benchmark::{BenchmarkReport, DatasetReport, Phase, ProfileReport, TimingStats};
pub use checkpoint::{
    CheckpointManager, CheckpointRecord, CheckpointStore, CheckpointTracker, MemoryStore,
    RestoreTarget, Restored, RetentionPolicy, Snapshot,
};
pub use data::{Batch, Batches, DataSource, InMemoryDataSource, Shuffle, Split};
pub use events::{Event, EventContext, EventHandler, Hooks, Logs};
pub use log_updater::LogUpdater;
pub use logger::{EpochLogger, TerminateOnNan};
pub use model::{Model, Parameter};
pub use optimizer::{Adam, Optimizer, OptimizerConfig, OptimizerState, Sgd};
pub use trainable::{Trainable, TrainableBuilder};
pub use value_updater::{UpdateFrequency, ValueUpdater};
pub use variable::Variable;
