//! Batch- and epoch-scoped value updates.
//!
//! A registered [`Variable`] is reassigned from its recompute function every
//! time the matching loop boundary is reached, e.g. to decay a scalar without
//! a dedicated schedule object inside the optimizer.

use crate::error::FitError;
use crate::training::variable::Variable;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Loop boundary at which a registration fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateFrequency {
    Batch,
    Epoch,
}

impl FromStr for UpdateFrequency {
    type Err = FitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "batch" => Ok(Self::Batch),
            "epoch" => Ok(Self::Epoch),
            other => Err(FitError::config(format!(
                "invalid update frequency \"{other}\" - must be one of \"batch\" or \"epoch\""
            ))),
        }
    }
}

impl fmt::Display for UpdateFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Batch => f.write_str("batch"),
            Self::Epoch => f.write_str("epoch"),
        }
    }
}

/// Zero-argument recomputation of a variable's value.
pub type RecomputeFn = Box<dyn FnMut() -> f64 + Send>;

/// Registry of per-batch and per-epoch variable updates.
#[derive(Default)]
pub struct ValueUpdater {
    batch_updates: Vec<(Variable, RecomputeFn)>,
    epoch_updates: Vec<(Variable, RecomputeFn)>,
}

impl ValueUpdater {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `variable` to be reassigned from `recompute` at `freq`.
    ///
    /// A variable may live in only one scope; registering it again in either
    /// scope fails with [`FitError::DuplicateKey`].
    pub fn register<F>(
        &mut self,
        variable: &Variable,
        recompute: F,
        freq: UpdateFrequency,
    ) -> Result<Variable, FitError>
    where
        F: FnMut() -> f64 + Send + 'static,
    {
        if self.is_registered(variable) {
            return Err(FitError::duplicate_key(format!(
                "variable '{}' already has a scheduled update",
                variable.name()
            )));
        }
        let slot = match freq {
            UpdateFrequency::Batch => &mut self.batch_updates,
            UpdateFrequency::Epoch => &mut self.epoch_updates,
        };
        slot.push((variable.clone(), Box::new(recompute)));
        tracing::debug!(variable = variable.name(), %freq, "scheduled value update");
        Ok(variable.clone())
    }

    pub fn schedule_batch_update<F>(&mut self, variable: &Variable, recompute: F) -> Result<Variable, FitError>
    where
        F: FnMut() -> f64 + Send + 'static,
    {
        self.register(variable, recompute, UpdateFrequency::Batch)
    }

    pub fn schedule_epoch_update<F>(&mut self, variable: &Variable, recompute: F) -> Result<Variable, FitError>
    where
        F: FnMut() -> f64 + Send + 'static,
    {
        self.register(variable, recompute, UpdateFrequency::Epoch)
    }

    /// String-keyed variant used by configuration code: `freq` must be
    /// `"batch"` or `"epoch"`.
    pub fn schedule_update<F>(&mut self, variable: &Variable, recompute: F, freq: &str) -> Result<Variable, FitError>
    where
        F: FnMut() -> f64 + Send + 'static,
    {
        let freq: UpdateFrequency = freq.parse()?;
        self.register(variable, recompute, freq)
    }

    pub fn is_registered(&self, variable: &Variable) -> bool {
        self.batch_updates
            .iter()
            .chain(&self.epoch_updates)
            .any(|(v, _)| v == variable)
    }

    /// Reassign every variable registered at `freq`, in registration order.
    pub fn update(&mut self, freq: UpdateFrequency) {
        let slot = match freq {
            UpdateFrequency::Batch => &mut self.batch_updates,
            UpdateFrequency::Epoch => &mut self.epoch_updates,
        };
        for (variable, recompute) in slot.iter_mut() {
            variable.set(recompute());
        }
    }

    pub fn on_batch_end(&mut self) {
        self.update(UpdateFrequency::Batch);
    }

    pub fn on_epoch_end(&mut self) {
        self.update(UpdateFrequency::Epoch);
    }

    pub fn len(&self, freq: UpdateFrequency) -> usize {
        match freq {
            UpdateFrequency::Batch => self.batch_updates.len(),
            UpdateFrequency::Epoch => self.epoch_updates.len(),
        }
    }

    /// Whether anything has been registered.
    pub fn used(&self) -> bool {
        !self.batch_updates.is_empty() || !self.epoch_updates.is_empty()
    }
}
