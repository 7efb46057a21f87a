//! Checkpoint persistence and epoch tracking for training runs.
//!
//! [`CheckpointManager`] owns a directory of numbered checkpoint payloads
//! (`<checkpoint_name>-<epoch>.json`) plus an index recording the retention
//! list. [`CheckpointTracker`] sits on top of any [`CheckpointStore`] and
//! decides *when* to save and what to restore: it maps completed-epoch
//! numbers to handles, keeps saves idempotent per epoch, and restores state
//! at the start of a run.

use crate::config::CheckpointConfig;
use crate::error::FitError;
use crate::persistence::{Layout, read_json, read_verified, write_json};
use crate::tensor::Tensor;
use crate::training::optimizer::OptimizerState;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const INDEX_FILE: &str = "checkpoint_index.json";

/// Everything needed to resume a run: model parameters, optimizer state and
/// the step counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub epoch: usize,
    pub global_step: u64,
    pub parameters: BTreeMap<String, Tensor>,
    pub optimizer: OptimizerState,
}

/// A saved checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub epoch: usize,
    /// `<directory>/<checkpoint_name>-<epoch>`
    pub handle: String,
    pub path: PathBuf,
    pub hash: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Parse the epoch number from a `<prefix>-<epoch>` handle.
pub fn epoch_of(handle: &str) -> Option<usize> {
    handle.rsplit('-').next()?.parse().ok()
}

/// Persistence collaborator: stores snapshots under epoch numbers and prunes
/// them according to its retention policy.
pub trait CheckpointStore: Send {
    /// Persist `snapshot` as checkpoint `epoch`, then apply retention.
    fn save(&mut self, epoch: usize, snapshot: &Snapshot) -> Result<CheckpointRecord, FitError>;

    fn load(&self, record: &CheckpointRecord) -> Result<Snapshot, FitError>;

    /// Records retained by the count-based policy, oldest first.
    fn checkpoints(&self) -> &[CheckpointRecord];

    /// Records kept only by the time-based policy.
    fn preserved(&self) -> &[CheckpointRecord] {
        &[]
    }

    fn latest(&self) -> Option<&CheckpointRecord> {
        self.checkpoints().last()
    }

    fn find_epoch(&self, epoch: usize) -> Option<&CheckpointRecord> {
        self.checkpoints()
            .iter()
            .chain(self.preserved())
            .find(|r| r.epoch == epoch)
    }

    fn find_handle(&self, handle: &str) -> Option<&CheckpointRecord> {
        self.checkpoints()
            .iter()
            .chain(self.preserved())
            .find(|r| r.handle == handle)
    }
}

/// Retention settings for a [`CheckpointManager`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub max_to_keep: usize,
    pub keep_checkpoint_every_n_hours: Option<u32>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_to_keep: 5,
            keep_checkpoint_every_n_hours: None,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CheckpointIndex {
    latest: Option<String>,
    checkpoints: Vec<CheckpointRecord>,
    #[serde(default)]
    preserved: Vec<CheckpointRecord>,
}

/// File-backed checkpoint store.
pub struct CheckpointManager {
    directory: PathBuf,
    checkpoint_name: String,
    policy: RetentionPolicy,
    index: CheckpointIndex,
    last_preserved: DateTime<Utc>,
}

impl CheckpointManager {
    /// Open (or create) a checkpoint directory, picking up records written by
    /// earlier processes.
    pub fn open(
        directory: impl Into<PathBuf>,
        checkpoint_name: impl Into<String>,
        policy: RetentionPolicy,
    ) -> Result<Self, FitError> {
        if policy.max_to_keep == 0 {
            return Err(FitError::config("max_to_keep must be at least 1"));
        }
        let directory = directory.into();
        std::fs::create_dir_all(&directory)?;

        let mut index: CheckpointIndex =
            read_json(&directory.join(INDEX_FILE))?.unwrap_or_default();
        let before = index.checkpoints.len() + index.preserved.len();
        index.checkpoints.retain(|r| r.path.exists());
        index.preserved.retain(|r| r.path.exists());
        let dropped = before - index.checkpoints.len() - index.preserved.len();
        if dropped > 0 {
            tracing::warn!(dropped, dir = %directory.display(), "index listed missing checkpoint files");
        }

        let manager = Self {
            directory,
            checkpoint_name: checkpoint_name.into(),
            policy,
            index,
            last_preserved: Utc::now(),
        };
        tracing::debug!(
            dir = %manager.directory.display(),
            checkpoints = manager.index.checkpoints.len(),
            "opened checkpoint directory"
        );
        Ok(manager)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    pub fn handle_for(&self, epoch: usize) -> String {
        format!(
            "{}-{epoch}",
            self.directory.join(&self.checkpoint_name).display()
        )
    }

    fn payload_path(&self, epoch: usize) -> PathBuf {
        self.directory
            .join(format!("{}-{epoch}.json", self.checkpoint_name))
    }

    fn remove_payload(record: &CheckpointRecord) {
        if let Err(e) = std::fs::remove_file(&record.path) {
            tracing::warn!(path = %record.path.display(), error = %e, "failed to delete checkpoint");
        }
    }

    /// Drop records beyond `max_to_keep`, oldest first, sparing one per
    /// configured hour interval.
    fn prune(&mut self) {
        while self.index.checkpoints.len() > self.policy.max_to_keep {
            let oldest = self.index.checkpoints.remove(0);
            if let Some(hours) = self.policy.keep_checkpoint_every_n_hours
                && oldest.created_at - TimeDelta::hours(i64::from(hours)) >= self.last_preserved
            {
                tracing::debug!(epoch = oldest.epoch, "preserving checkpoint past max_to_keep");
                self.last_preserved = oldest.created_at;
                self.index.preserved.push(oldest);
                continue;
            }
            tracing::debug!(epoch = oldest.epoch, "pruning checkpoint");
            Self::remove_payload(&oldest);
        }
    }

    fn write_index(&mut self) -> Result<(), FitError> {
        self.index.latest = self.index.checkpoints.last().map(|r| r.handle.clone());
        write_json(&self.directory.join(INDEX_FILE), &self.index, Layout::Pretty)?;
        Ok(())
    }
}

impl CheckpointStore for CheckpointManager {
    fn save(&mut self, epoch: usize, snapshot: &Snapshot) -> Result<CheckpointRecord, FitError> {
        let path = self.payload_path(epoch);
        let written = write_json(&path, snapshot, Layout::Compact)?;
        let record = CheckpointRecord {
            epoch,
            handle: self.handle_for(epoch),
            path,
            hash: written.sha256,
            size_bytes: written.size_bytes,
            created_at: Utc::now(),
        };

        // Records at or after `epoch` belong to an abandoned timeline.
        let (kept, superseded): (Vec<_>, Vec<_>) = self
            .index
            .checkpoints
            .drain(..)
            .partition(|r| r.epoch < epoch);
        self.index.checkpoints = kept;
        for old in superseded.iter().filter(|r| r.epoch != epoch) {
            Self::remove_payload(old);
        }
        self.index.preserved.retain(|r| r.epoch != epoch);

        self.index.checkpoints.push(record.clone());
        self.prune();
        self.write_index()?;
        Ok(record)
    }

    fn load(&self, record: &CheckpointRecord) -> Result<Snapshot, FitError> {
        read_verified(&record.path, &record.hash)
    }

    fn checkpoints(&self) -> &[CheckpointRecord] {
        &self.index.checkpoints
    }

    fn preserved(&self) -> &[CheckpointRecord] {
        &self.index.preserved
    }
}

/// In-process store with count-based retention. Counts writes, which makes
/// it handy for dry runs and for asserting save behaviour.
#[derive(Debug, Default)]
pub struct MemoryStore {
    max_to_keep: usize,
    records: Vec<CheckpointRecord>,
    payloads: BTreeMap<usize, Snapshot>,
    writes: usize,
}

impl MemoryStore {
    pub fn new(max_to_keep: usize) -> Self {
        Self {
            max_to_keep: max_to_keep.max(1),
            ..Self::default()
        }
    }

    /// Number of `save` calls that reached the store.
    pub fn writes(&self) -> usize {
        self.writes
    }
}

impl CheckpointStore for MemoryStore {
    fn save(&mut self, epoch: usize, snapshot: &Snapshot) -> Result<CheckpointRecord, FitError> {
        self.writes += 1;
        self.records.retain(|r| r.epoch < epoch);
        self.payloads.retain(|&e, _| e < epoch);
        let record = CheckpointRecord {
            epoch,
            handle: format!("memory/ckpt-{epoch}"),
            path: PathBuf::new(),
            hash: String::new(),
            size_bytes: 0,
            created_at: Utc::now(),
        };
        self.records.push(record.clone());
        self.payloads.insert(epoch, snapshot.clone());
        while self.records.len() > self.max_to_keep {
            let old = self.records.remove(0);
            self.payloads.remove(&old.epoch);
        }
        Ok(record)
    }

    fn load(&self, record: &CheckpointRecord) -> Result<Snapshot, FitError> {
        self.payloads
            .get(&record.epoch)
            .cloned()
            .ok_or_else(|| FitError::not_found(format!("checkpoint {}", record.handle)))
    }

    fn checkpoints(&self) -> &[CheckpointRecord] {
        &self.records
    }
}

/// Which checkpoint to restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreTarget {
    Latest,
    Epoch(usize),
    Handle(String),
}

impl From<usize> for RestoreTarget {
    fn from(epoch: usize) -> Self {
        Self::Epoch(epoch)
    }
}

impl From<&str> for RestoreTarget {
    fn from(handle: &str) -> Self {
        Self::Handle(handle.to_string())
    }
}

/// Result of a successful restore.
#[derive(Debug, Clone)]
pub struct Restored {
    pub epoch: usize,
    pub handle: String,
    pub snapshot: Snapshot,
}

/// Decides when checkpoints are written and which one is restored.
pub struct CheckpointTracker {
    store: Box<dyn CheckpointStore>,
    save_freq: usize,
    restore_on_begin: bool,
    restored: bool,
    last_epoch: Option<usize>,
    last_saved_epoch: Option<usize>,
}

impl CheckpointTracker {
    pub fn new(store: Box<dyn CheckpointStore>, save_freq: usize, restore_on_begin: bool) -> Self {
        Self {
            store,
            save_freq: save_freq.max(1),
            restore_on_begin,
            restored: false,
            last_epoch: None,
            last_saved_epoch: None,
        }
    }

    /// Tracker over a [`CheckpointManager`] rooted at `directory`.
    pub fn from_config(directory: &Path, config: &CheckpointConfig) -> Result<Self, FitError> {
        if config.save_freq == 0 {
            return Err(FitError::config("save_freq must be at least 1"));
        }
        let manager = CheckpointManager::open(
            directory,
            config.checkpoint_name.clone(),
            RetentionPolicy {
                max_to_keep: config.max_to_keep,
                keep_checkpoint_every_n_hours: config.keep_checkpoint_every_n_hours,
            },
        )?;
        Ok(Self::new(
            Box::new(manager),
            config.save_freq,
            config.restore_on_begin,
        ))
    }

    pub fn store(&self) -> &dyn CheckpointStore {
        self.store.as_ref()
    }

    /// Handle of the checkpoint for `epoch`, or of the latest checkpoint when
    /// `epoch` is `None`. `None` if nothing matches.
    pub fn checkpoint_for(&self, epoch: Option<usize>) -> Option<String> {
        match epoch {
            None => self.store.latest().map(|r| r.handle.clone()),
            Some(e) => self.store.find_epoch(e).map(|r| r.handle.clone()),
        }
    }

    /// Resolve and read the requested checkpoint without touching restore
    /// state. Pair with [`CheckpointTracker::commit`] once the snapshot is
    /// applied, so a failed apply leaves the tracker unrestored.
    ///
    /// `Ok(None)` means nothing was saved yet and the target was
    /// [`RestoreTarget::Latest`]; there is nothing to restore, so the tracker
    /// counts as restored. An explicit epoch or handle that does not resolve
    /// is a [`FitError::NotFound`].
    pub fn load(&mut self, target: RestoreTarget) -> Result<Option<Restored>, FitError> {
        let record = match &target {
            RestoreTarget::Latest => match self.store.latest() {
                Some(r) => r.clone(),
                None => {
                    tracing::info!("No previous checkpoints found. Skipping restoration");
                    self.restored = true;
                    return Ok(None);
                }
            },
            RestoreTarget::Epoch(epoch) => {
                self.store.find_epoch(*epoch).cloned().ok_or_else(|| {
                    let saved: Vec<usize> =
                        self.store.checkpoints().iter().map(|r| r.epoch).collect();
                    FitError::not_found(format!(
                        "checkpoint for epoch {epoch} not in saved checkpoints {saved:?}"
                    ))
                })?
            }
            RestoreTarget::Handle(handle) => self
                .store
                .find_handle(handle)
                .cloned()
                .ok_or_else(|| FitError::not_found(format!("checkpoint {handle}")))?,
        };

        let snapshot = self.store.load(&record)?;
        Ok(Some(Restored {
            epoch: record.epoch,
            handle: record.handle,
            snapshot,
        }))
    }

    /// Record that `restored` was applied to the model.
    pub fn commit(&mut self, restored: &Restored) {
        tracing::info!(epoch = restored.epoch, handle = %restored.handle, "Restored model");
        self.restored = true;
        self.last_saved_epoch = Some(restored.epoch);
    }

    /// [`CheckpointTracker::load`] followed by [`CheckpointTracker::commit`],
    /// for callers with nothing to apply that can fail.
    pub fn restore(&mut self, target: RestoreTarget) -> Result<Option<Restored>, FitError> {
        let restored = self.load(target)?;
        if let Some(r) = &restored {
            self.commit(r);
        }
        Ok(restored)
    }

    /// Save under `epoch` unless that epoch was the last one saved.
    /// `snapshot` is only evaluated when a write happens.
    pub fn save<F>(&mut self, epoch: usize, snapshot: F) -> Result<Option<CheckpointRecord>, FitError>
    where
        F: FnOnce() -> Snapshot,
    {
        if self.last_saved_epoch == Some(epoch) {
            return Ok(None);
        }
        tracing::info!(epoch, "Saving model");
        let record = self.store.save(epoch, &snapshot())?;
        self.last_saved_epoch = Some(epoch);
        Ok(Some(record))
    }

    /// Load the latest checkpoint if configured to. The caller commits it
    /// once applied.
    pub fn on_train_begin(&mut self) -> Result<Option<Restored>, FitError> {
        if self.restore_on_begin {
            self.load(RestoreTarget::Latest)
        } else {
            Ok(None)
        }
    }

    /// Called with the zero-based index of the epoch that just finished.
    /// Saving decisions use the number of completed epochs.
    pub fn on_epoch_end<F>(
        &mut self,
        epoch_index: usize,
        snapshot: F,
    ) -> Result<Option<CheckpointRecord>, FitError>
    where
        F: FnOnce() -> Snapshot,
    {
        let completed = epoch_index + 1;
        self.last_epoch = Some(completed);
        if completed % self.save_freq == 0 {
            self.save(completed, snapshot)
        } else {
            Ok(None)
        }
    }

    /// Save the final epoch of the run (no-op if it was already saved).
    pub fn on_train_end<F>(&mut self, snapshot: F) -> Result<Option<CheckpointRecord>, FitError>
    where
        F: FnOnce() -> Snapshot,
    {
        match self.last_epoch {
            Some(epoch) => self.save(epoch, snapshot),
            None => Ok(None),
        }
    }

    /// Whether evaluation/prediction should restore before running.
    pub fn needs_restore(&self) -> bool {
        self.restore_on_begin && !self.restored
    }

    /// Forget restore state, e.g. after the model instance changed.
    pub fn reset(&mut self) {
        self.restored = false;
    }

    pub fn is_restored(&self) -> bool {
        self.restored
    }

    pub fn last_epoch(&self) -> Option<usize> {
        self.last_epoch
    }

    pub fn last_saved_epoch(&self) -> Option<usize> {
        self.last_saved_epoch
    }

    pub fn save_freq(&self) -> usize {
        self.save_freq
    }
}
