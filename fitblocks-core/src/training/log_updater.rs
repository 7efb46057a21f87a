//! Extra values merged into the per-batch / per-epoch logs.

use crate::error::FitError;
use crate::training::events::Logs;
use crate::training::value_updater::UpdateFrequency;
use crate::training::variable::Variable;

/// Named variables whose current values are written into the loop's logs.
#[derive(Debug, Default)]
pub struct LogUpdater {
    batch_logs: Vec<(String, Variable)>,
    epoch_logs: Vec<(String, Variable)>,
}

impl LogUpdater {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log `value` under `key` at `freq`. Keys are unique across both scopes.
    pub fn register(
        &mut self,
        key: impl Into<String>,
        value: &Variable,
        freq: UpdateFrequency,
    ) -> Result<(), FitError> {
        let key = key.into();
        if self.contains(&key) {
            return Err(FitError::duplicate_key(format!("key {key} already exists")));
        }
        let slot = match freq {
            UpdateFrequency::Batch => &mut self.batch_logs,
            UpdateFrequency::Epoch => &mut self.epoch_logs,
        };
        slot.push((key, value.clone()));
        Ok(())
    }

    pub fn log_each_batch(&mut self, key: impl Into<String>, value: &Variable) -> Result<(), FitError> {
        self.register(key, value, UpdateFrequency::Batch)
    }

    pub fn log_each_epoch(&mut self, key: impl Into<String>, value: &Variable) -> Result<(), FitError> {
        self.register(key, value, UpdateFrequency::Epoch)
    }

    /// Register `value` at the frequency named by `freq` and hand it back,
    /// so it can be used inline while building a model.
    pub fn logged_value(
        &mut self,
        key: impl Into<String>,
        value: &Variable,
        freq: &str,
    ) -> Result<Variable, FitError> {
        let freq: UpdateFrequency = freq.parse()?;
        self.register(key, value, freq)?;
        Ok(value.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.batch_logs
            .iter()
            .chain(&self.epoch_logs)
            .any(|(k, _)| k == key)
    }

    /// Read every value registered at `freq` into `logs`, overwriting entries
    /// the loop already put there under the same key.
    pub fn merge_into(&self, freq: UpdateFrequency, logs: &mut Logs) {
        let slot = match freq {
            UpdateFrequency::Batch => &self.batch_logs,
            UpdateFrequency::Epoch => &self.epoch_logs,
        };
        for (key, value) in slot {
            logs.insert(key.clone(), value.get());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.batch_logs.is_empty() && self.epoch_logs.is_empty()
    }
}
