//! End-to-end tests for the training orchestrator and checkpoint tracking.
//!
//! Runs go through the on-disk checkpoint manager under a temporary model
//! directory unless a test needs to count persistence writes.

use fitblocks_core::config::{ConfigOverrides, FitConfig, TrainConfig, TrainOverrides, load_config};
use fitblocks_core::error::FitError;
use fitblocks_core::initializers::Initializer;
use fitblocks_core::layers::Dense;
use fitblocks_core::losses::{MeanSquaredError, SparseCategoricalCrossentropy};
use fitblocks_core::metrics::SparseCategoricalAccuracy;
use fitblocks_core::training::model::parameter_map;
use fitblocks_core::training::{
    Adam, CheckpointManager, CheckpointRecord, CheckpointStore, CheckpointTracker, Event, Hooks,
    InMemoryDataSource, MemoryStore, RestoreTarget, RetentionPolicy, Snapshot, Split, Trainable,
};
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

fn regression_run(dir: &TempDir, epochs: usize) -> Trainable {
    let config = FitConfig {
        model_dir: dir.path().to_path_buf(),
        train: TrainConfig {
            batch_size: 8,
            epochs: Some(epochs),
            ..TrainConfig::default()
        },
        ..FitConfig::default()
    };
    Trainable::builder(
        Box::new(Dense::new("dense", 3, 1, Initializer::Zeros, 0)),
        Box::new(MeanSquaredError),
        Box::new(InMemoryDataSource::regression(80, 3, 42).unwrap()),
    )
    .config(config)
    .build()
    .unwrap()
}

fn snapshot(epoch: usize) -> Snapshot {
    Snapshot {
        epoch,
        global_step: epoch as u64,
        parameters: BTreeMap::new(),
        optimizer: Default::default(),
    }
}

/// Memory store that reports how many writes reach it.
struct CountingStore {
    inner: MemoryStore,
    writes: Arc<AtomicUsize>,
}

impl CheckpointStore for CountingStore {
    fn save(&mut self, epoch: usize, snapshot: &Snapshot) -> Result<CheckpointRecord, FitError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.save(epoch, snapshot)
    }

    fn load(&self, record: &CheckpointRecord) -> Result<Snapshot, FitError> {
        self.inner.load(record)
    }

    fn checkpoints(&self) -> &[CheckpointRecord] {
        self.inner.checkpoints()
    }
}

#[test]
fn test_fit_writes_model_directory_layout() {
    let dir = TempDir::new().unwrap();
    let mut run = regression_run(&dir, 3);
    let history = run.fit().unwrap();
    assert_eq!(history.len(), 3);

    let chkpts = dir.path().join("chkpts");
    for epoch in 1..=3 {
        assert!(chkpts.join(format!("ckpt-{epoch}.json")).exists());
    }
    assert!(chkpts.join("checkpoint_index.json").exists());
    assert!(dir.path().join("operative_config.json").exists());

    let latest = run.tracker().checkpoint_for(None).unwrap();
    assert!(latest.ends_with("ckpt-3"));
    assert_eq!(run.tracker().checkpoint_for(Some(2)).unwrap(), latest.replace("-3", "-2"));
    assert_eq!(run.tracker().checkpoint_for(Some(9)), None);

    let losses = history.series("loss");
    assert!(losses.last().unwrap() < losses.first().unwrap());
}

#[test]
fn test_second_run_resumes_from_latest_checkpoint() {
    let dir = TempDir::new().unwrap();
    let mut first = regression_run(&dir, 2);
    first.fit().unwrap();
    let after_two = parameter_map(first.model());
    drop(first);

    let mut resumed = regression_run(&dir, 2);
    let history = resumed.fit().unwrap();
    assert!(history.is_empty(), "all epochs already completed");
    assert_eq!(parameter_map(resumed.model()), after_two);
    assert_eq!(resumed.global_step(), 16);
}

#[test]
fn test_max_to_keep_two_keeps_latest_two() {
    let dir = TempDir::new().unwrap();
    let manager = CheckpointManager::open(
        dir.path(),
        "ckpt",
        RetentionPolicy {
            max_to_keep: 2,
            keep_checkpoint_every_n_hours: None,
        },
    )
    .unwrap();
    let mut tracker = CheckpointTracker::new(Box::new(manager), 1, true);
    for epoch in 1..=3 {
        tracker.save(epoch, || snapshot(epoch)).unwrap();
    }

    let kept: Vec<usize> = tracker.store().checkpoints().iter().map(|r| r.epoch).collect();
    assert_eq!(kept, vec![2, 3]);
    assert!(matches!(
        tracker.restore(RestoreTarget::Epoch(1)),
        Err(FitError::NotFound(_))
    ));
    let restored = tracker.restore(RestoreTarget::Epoch(2)).unwrap().unwrap();
    assert_eq!(restored.snapshot, snapshot(2));
}

#[test]
fn test_repeated_save_writes_once() {
    let writes = Arc::new(AtomicUsize::new(0));
    let store = CountingStore {
        inner: MemoryStore::new(5),
        writes: writes.clone(),
    };
    let mut tracker = CheckpointTracker::new(Box::new(store), 1, false);
    assert!(tracker.save(4, || snapshot(4)).unwrap().is_some());
    assert!(tracker.save(4, || snapshot(4)).unwrap().is_none());
    assert_eq!(writes.load(Ordering::SeqCst), 1);

    tracker.save(5, || snapshot(5)).unwrap();
    tracker.save(4, || snapshot(4)).unwrap();
    assert_eq!(writes.load(Ordering::SeqCst), 3);
}

#[test]
fn test_restoring_older_epoch_tracks_it_until_next_save() {
    let mut tracker = CheckpointTracker::new(Box::new(MemoryStore::new(5)), 1, false);
    tracker.save(1, || snapshot(1)).unwrap();
    tracker.save(2, || snapshot(2)).unwrap();

    tracker.restore(RestoreTarget::Epoch(1)).unwrap();
    assert_eq!(tracker.last_saved_epoch(), Some(1));
    assert!(tracker.is_restored());

    // Re-saving epoch 2 on the new timeline replaces the old record.
    tracker.save(2, || snapshot(2)).unwrap();
    assert_eq!(tracker.last_saved_epoch(), Some(2));
    assert!(tracker.checkpoint_for(None).unwrap().ends_with("ckpt-2"));
}

#[test]
fn test_implicit_restore_without_checkpoints_is_a_no_op() {
    let mut tracker = CheckpointTracker::new(Box::new(MemoryStore::new(5)), 1, true);
    assert!(tracker.needs_restore());
    assert!(tracker.on_train_begin().unwrap().is_none());
    assert!(!tracker.needs_restore());
    assert_eq!(tracker.last_saved_epoch(), None);
}

#[test]
fn test_first_epoch_is_saved_as_epoch_one() {
    let dir = TempDir::new().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let mut hooks = Hooks::new();
    hooks.on_fn(Event::EpochEnd, move |ctx| {
        sink.lock().unwrap().push((ctx.epoch, ctx.completed_epochs()));
        Ok(())
    });

    let mut config = FitConfig {
        model_dir: dir.path().to_path_buf(),
        ..FitConfig::default()
    };
    config.train.epochs = Some(2);
    config.train.batch_size = 16;
    let mut run = Trainable::builder(
        Box::new(Dense::new("dense", 3, 1, Initializer::Zeros, 0)),
        Box::new(MeanSquaredError),
        Box::new(InMemoryDataSource::regression(40, 3, 1).unwrap()),
    )
    .config(config)
    .hooks(hooks)
    .checkpoint_store(Box::new(MemoryStore::new(5)))
    .build()
    .unwrap();
    run.fit().unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![(0, 1), (1, 2)]);
    let saved: Vec<usize> = run.tracker().store().checkpoints().iter().map(|r| r.epoch).collect();
    assert_eq!(saved, vec![1, 2]);
}

#[test]
fn test_classification_learns_blobs() {
    let dir = TempDir::new().unwrap();
    let mut config = FitConfig {
        model_dir: dir.path().to_path_buf(),
        ..FitConfig::default()
    };
    config.train.epochs = Some(10);
    config.train.batch_size = 16;
    config.train.seed = 3;
    let mut run = Trainable::builder(
        Box::new(Dense::new("logits", 2, 3, Initializer::GlorotUniform, 7)),
        Box::new(SparseCategoricalCrossentropy { from_logits: true }),
        Box::new(InMemoryDataSource::classification(300, 2, 3, 5).unwrap()),
    )
    .optimizer(Box::new(Adam::new(0.05)))
    .metric(Box::new(SparseCategoricalAccuracy::default()))
    .config(config)
    .checkpoint_store(Box::new(MemoryStore::new(2)))
    .build()
    .unwrap();

    let history = run.fit().unwrap();
    let accuracy = history.series("val_accuracy");
    assert_eq!(accuracy.len(), 10);
    assert!(*accuracy.last().unwrap() > 0.8, "{accuracy:?}");

    let eval = run.evaluate(Split::Validation).unwrap();
    assert!((eval["accuracy"] - accuracy.last().unwrap()).abs() < 1e-9);
}

#[test]
fn test_overrides_pick_the_stopping_criterion() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("fitblocks.toml"),
        "[train]\ntotal_train_steps = 100\nbatch_size = 4\n",
    )
    .unwrap();

    let config = load_config(Some(dir.path()), None, None).unwrap();
    assert_eq!(config.train.total_train_steps, Some(100));
    assert_eq!(config.train.batch_size, 4);

    let overrides = ConfigOverrides {
        model_dir: None,
        train: TrainOverrides {
            epochs: Some(2),
            ..TrainOverrides::default()
        },
    };
    let config = load_config(Some(dir.path()), None, Some(&overrides)).unwrap();
    assert_eq!(config.train.epochs, Some(2));
    assert_eq!(config.train.total_train_steps, None);
    assert!(config.validate().is_empty());
}
