//! The training orchestrator.
//!
//! [`Trainable`] owns a model, optimizer, loss, metrics and data source and
//! drives the run: restore on begin, epoch/step loops with batch- and
//! epoch-scoped updates, periodic validation, checkpointing by completed
//! epoch, plus benchmark/profile/dataset-throughput entry points that never
//! write checkpoints.

use crate::config::{FitConfig, StoppingCriterion};
use crate::error::FitError;
use crate::losses::Loss;
use crate::metrics::{History, Mean, Metric};
use crate::persistence::{Layout, write_json};
use crate::training::benchmark::{
    BenchmarkReport, DatasetReport, Phase, PhaseSamples, ProfileReport, TimingStats, millis,
};
use crate::training::checkpoint::{
    CheckpointStore, CheckpointTracker, RestoreTarget, Snapshot,
};
use crate::training::data::{Batch, Batches, DataSource, Shuffle, Split};
use crate::training::events::{Event, Hooks, Logs};
use crate::training::log_updater::LogUpdater;
use crate::training::logger::{EpochLogger, TerminateOnNan};
use crate::training::model::{Model, fill_disconnected, load_parameters, parameter_map};
use crate::training::optimizer::Optimizer;
use crate::training::value_updater::{UpdateFrequency, ValueUpdater};
use chrono::Utc;
use std::path::Path;
use std::time::{Duration, Instant};

const OPERATIVE_CONFIG: &str = "operative_config.json";
const PROFILE_FILE: &str = "profile.json";

fn take_snapshot(
    model: &dyn Model,
    optimizer: &dyn Optimizer,
    epoch: usize,
    global_step: u64,
) -> Snapshot {
    Snapshot {
        epoch,
        global_step,
        parameters: parameter_map(model),
        optimizer: optimizer.state(),
    }
}

fn record(timer: &mut Option<&mut PhaseSamples>, phase: Phase, elapsed: Duration) {
    if let Some(t) = timer.as_deref_mut() {
        t.record(phase, elapsed);
    }
}

fn next_batch(stream: &mut Batches, split: Split) -> Result<Batch, FitError> {
    stream
        .next()
        .ok_or_else(|| FitError::training(format!("{split} data ran out mid-run")))?
}

/// Epoch count and per-epoch step budget derived from the stopping criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EpochPlan {
    epochs: usize,
    steps_per_epoch: usize,
    total_steps: Option<u64>,
}

impl EpochPlan {
    fn new(criterion: StoppingCriterion, steps_per_epoch: usize) -> Self {
        match criterion {
            StoppingCriterion::Epochs(epochs) => Self {
                epochs,
                steps_per_epoch,
                total_steps: None,
            },
            StoppingCriterion::Steps(total) => Self {
                epochs: total.div_ceil(steps_per_epoch as u64) as usize,
                steps_per_epoch,
                total_steps: Some(total),
            },
        }
    }

    /// Steps run in `epoch`; only the last epoch of a step budget is short.
    fn steps_in(&self, epoch: usize) -> usize {
        match self.total_steps {
            None => self.steps_per_epoch,
            Some(total) => {
                let done = (epoch * self.steps_per_epoch) as u64;
                total.saturating_sub(done).min(self.steps_per_epoch as u64) as usize
            }
        }
    }
}

/// Assembles a [`Trainable`]. Registries and hooks are injected here rather
/// than looked up from ambient state.
pub struct TrainableBuilder {
    model: Box<dyn Model>,
    loss: Box<dyn Loss>,
    data: Box<dyn DataSource>,
    optimizer: Option<Box<dyn Optimizer>>,
    metrics: Vec<Box<dyn Metric>>,
    config: FitConfig,
    values: ValueUpdater,
    logs: LogUpdater,
    hooks: Hooks,
    store: Option<Box<dyn CheckpointStore>>,
}

impl TrainableBuilder {
    /// Use this optimizer instead of building one from `config.optimizer`.
    pub fn optimizer(mut self, optimizer: Box<dyn Optimizer>) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    pub fn metric(mut self, metric: Box<dyn Metric>) -> Self {
        self.metrics.push(metric);
        self
    }

    pub fn config(mut self, config: FitConfig) -> Self {
        self.config = config;
        self
    }

    pub fn value_updater(mut self, values: ValueUpdater) -> Self {
        self.values = values;
        self
    }

    pub fn log_updater(mut self, logs: LogUpdater) -> Self {
        self.logs = logs;
        self
    }

    /// User hooks; they run after the built-in epoch logger and NaN guard.
    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Persist checkpoints through `store` instead of a
    /// [`CheckpointManager`](crate::training::checkpoint::CheckpointManager)
    /// under `<model_dir>/chkpts`.
    pub fn checkpoint_store(mut self, store: Box<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<Trainable, FitError> {
        let config = self.config;
        let problems: Vec<String> = config
            .checkpoint
            .validate()
            .into_iter()
            .chain(config.benchmark.validate())
            .chain(config.optimizer.validate())
            .collect();
        if !problems.is_empty() {
            return Err(FitError::config(problems.join("; ")));
        }

        let tracker = match self.store {
            Some(store) => CheckpointTracker::new(
                store,
                config.checkpoint.save_freq,
                config.checkpoint.restore_on_begin,
            ),
            None => CheckpointTracker::from_config(&config.checkpoint_dir(), &config.checkpoint)?,
        };

        let mut hooks = Hooks::new();
        hooks.on(Event::EpochEnd, EpochLogger);
        hooks.on(Event::BatchEnd, TerminateOnNan::new());
        hooks.on(Event::EpochEnd, TerminateOnNan::new());
        hooks.extend(self.hooks);

        Ok(Trainable {
            optimizer: self.optimizer.unwrap_or_else(|| config.optimizer.build()),
            model: self.model,
            loss: self.loss,
            data: self.data,
            metrics: self.metrics,
            config,
            values: self.values,
            logs: self.logs,
            hooks,
            tracker,
            history: History::default(),
            global_step: 0,
        })
    }
}

pub struct Trainable {
    model: Box<dyn Model>,
    optimizer: Box<dyn Optimizer>,
    loss: Box<dyn Loss>,
    metrics: Vec<Box<dyn Metric>>,
    data: Box<dyn DataSource>,
    config: FitConfig,
    values: ValueUpdater,
    logs: LogUpdater,
    hooks: Hooks,
    tracker: CheckpointTracker,
    history: History,
    global_step: u64,
}

impl Trainable {
    pub fn builder(
        model: Box<dyn Model>,
        loss: Box<dyn Loss>,
        data: Box<dyn DataSource>,
    ) -> TrainableBuilder {
        TrainableBuilder {
            model,
            loss,
            data,
            optimizer: None,
            metrics: Vec::new(),
            config: FitConfig::default(),
            values: ValueUpdater::new(),
            logs: LogUpdater::new(),
            hooks: Hooks::new(),
            store: None,
        }
    }

    pub fn model(&self) -> &dyn Model {
        self.model.as_ref()
    }

    pub fn model_mut(&mut self) -> &mut dyn Model {
        self.model.as_mut()
    }

    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    pub fn data(&self) -> &dyn DataSource {
        self.data.as_ref()
    }

    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    pub fn model_dir(&self) -> &Path {
        &self.config.model_dir
    }

    pub fn tracker(&self) -> &CheckpointTracker {
        &self.tracker
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    pub fn value_updater_mut(&mut self) -> &mut ValueUpdater {
        &mut self.values
    }

    pub fn log_updater_mut(&mut self) -> &mut LogUpdater {
        &mut self.logs
    }

    pub fn hooks_mut(&mut self) -> &mut Hooks {
        &mut self.hooks
    }

    /// Swap in a new model instance. The tracker forgets that it restored,
    /// so the next evaluation restores into the new model.
    pub fn replace_model(&mut self, model: Box<dyn Model>) -> Box<dyn Model> {
        self.tracker.reset();
        std::mem::replace(&mut self.model, model)
    }

    fn snapshot(&self, epoch: usize) -> Snapshot {
        take_snapshot(self.model.as_ref(), self.optimizer.as_ref(), epoch, self.global_step)
    }

    /// Load a snapshot into model and optimizer, all or nothing.
    fn apply_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), FitError> {
        let backup = parameter_map(self.model.as_ref());
        load_parameters(self.model.as_mut(), &snapshot.parameters)?;
        if let Err(e) = self.optimizer.load_state(&snapshot.optimizer) {
            load_parameters(self.model.as_mut(), &backup)?;
            return Err(e);
        }
        self.global_step = snapshot.global_step;
        Ok(())
    }

    /// Restore a checkpoint into the model. Returns the restored epoch, or
    /// `None` when `Latest` was requested and nothing is saved.
    pub fn restore(&mut self, target: impl Into<RestoreTarget>) -> Result<Option<usize>, FitError> {
        match self.tracker.load(target.into())? {
            Some(restored) => {
                self.apply_snapshot(&restored.snapshot)?;
                self.tracker.commit(&restored);
                Ok(Some(restored.epoch))
            }
            None => Ok(None),
        }
    }

    fn reset_metrics(&mut self) {
        for m in &mut self.metrics {
            m.reset();
        }
    }

    fn metric_logs(&self, prefix: &str, loss: f64) -> Logs {
        let mut logs = Logs::new();
        logs.insert(format!("{prefix}loss"), loss);
        for m in &self.metrics {
            logs.insert(format!("{prefix}{}", m.name()), m.result());
        }
        logs
    }

    /// One optimization step; returns the total (primary + auxiliary) loss.
    fn train_step(&mut self, batch: &Batch, mut timer: Option<&mut PhaseSamples>) -> Result<f64, FitError> {
        let t = Instant::now();
        let preds = self.model.forward(&batch.features, true)?;
        let primary = self.loss.value(&batch.labels, &preds)?;
        let auxiliary: f64 = self.model.auxiliary_losses().iter().sum();
        record(&mut timer, Phase::Forward, t.elapsed());

        let t = Instant::now();
        let grad_output = self.loss.gradient(&batch.labels, &preds)?;
        let grads = self.model.backward(&grad_output)?;
        record(&mut timer, Phase::Backward, t.elapsed());

        let t = Instant::now();
        let grads = fill_disconnected(self.model.parameters(), grads)?;
        self.optimizer
            .apply_gradients(self.model.parameters_mut(), &grads)?;
        record(&mut timer, Phase::Apply, t.elapsed());

        for m in &mut self.metrics {
            m.update(&batch.labels, &preds)?;
        }
        Ok(primary + auxiliary)
    }

    /// Forward passes and metric updates over one epoch of `split`, without
    /// touching parameters. Keys are prefixed with `prefix`.
    fn evaluate_split(&mut self, split: Split, prefix: &str) -> Result<Logs, FitError> {
        let batch_size = self.config.train.batch_size;
        let steps = self.data.steps_per_epoch(split, batch_size)?;
        let mut stream = self.data.batches(split, batch_size, None)?;
        self.reset_metrics();
        let mut loss = Mean::new();
        for _ in 0..steps {
            let batch = next_batch(&mut stream, split)?;
            let preds = self.model.forward(&batch.features, false)?;
            let value = self.loss.value(&batch.labels, &preds)?
                + self.model.auxiliary_losses().iter().sum::<f64>();
            loss.update(value, batch.size() as f64);
            for m in &mut self.metrics {
                m.update(&batch.labels, &preds)?;
            }
        }
        Ok(self.metric_logs(prefix, loss.result()))
    }

    fn has_split(&self, split: Split) -> bool {
        matches!(self.data.examples_per_epoch(split), Ok(n) if n > 0)
    }

    /// Run the configured training loop and return the history of this run.
    ///
    /// Configuration problems, including a missing or doubled stopping
    /// criterion, are reported before any batch is drawn.
    pub fn fit(&mut self) -> Result<History, FitError> {
        let problems = self.config.train.validate();
        if !problems.is_empty() {
            return Err(FitError::config(problems.join("; ")));
        }
        let criterion = self.config.train.stopping_criterion()?;
        let batch_size = self.config.train.batch_size;
        let steps_per_epoch = self.data.steps_per_epoch(Split::Train, batch_size)?;
        if steps_per_epoch == 0 {
            return Err(FitError::config(format!("{} has an empty train split", self.data.name())));
        }
        let plan = EpochPlan::new(criterion, steps_per_epoch);
        let validation_freq = self.config.train.validation_freq;
        let validate = self.has_split(Split::Validation);

        std::fs::create_dir_all(&self.config.model_dir)?;
        write_json(&self.config.model_dir.join(OPERATIVE_CONFIG), &self.config, Layout::Pretty)?;
        tracing::info!("{}", self.model.summary());

        let initial_epoch = match self.tracker.on_train_begin()? {
            Some(restored) => {
                self.apply_snapshot(&restored.snapshot)?;
                self.tracker.commit(&restored);
                restored.epoch
            }
            None => 0,
        };
        if initial_epoch >= plan.epochs {
            tracing::info!(initial_epoch, epochs = plan.epochs, "nothing left to train");
        } else {
            tracing::info!(
                initial_epoch,
                epochs = plan.epochs,
                steps_per_epoch,
                batch_size,
                "starting training"
            );
        }

        let shuffle = Shuffle {
            buffer: self.config.train.shuffle_buffer,
            seed: self.config.train.seed,
        };
        let mut train = self.data.batches(Split::Train, batch_size, Some(shuffle))?;

        let mut run_logs = Logs::new();
        let mut stop = self
            .hooks
            .fire(Event::RunBegin, initial_epoch, None, &mut run_logs)?;
        self.history = History::default();

        for epoch in initial_epoch..plan.epochs {
            if stop {
                break;
            }
            let started = Instant::now();
            let mut epoch_logs = Logs::new();
            stop |= self.hooks.fire(Event::EpochBegin, epoch, None, &mut epoch_logs)?;

            self.reset_metrics();
            let mut loss = Mean::new();
            for batch_index in 0..plan.steps_in(epoch) {
                let batch = next_batch(&mut train, Split::Train)?;
                let value = self.train_step(&batch, None)?;
                loss.update(value, batch.size() as f64);
                self.global_step += 1;

                self.values.on_batch_end();
                let mut batch_logs = self.metric_logs("", loss.result());
                self.logs.merge_into(UpdateFrequency::Batch, &mut batch_logs);
                if self
                    .hooks
                    .fire(Event::BatchEnd, epoch, Some(batch_index), &mut batch_logs)?
                {
                    stop = true;
                    break;
                }
            }
            epoch_logs.extend(self.metric_logs("", loss.result()));

            if validate && (epoch + 1) % validation_freq == 0 {
                let val_logs = self.evaluate_split(Split::Validation, "val_")?;
                epoch_logs.extend(val_logs);
            }

            self.values.on_epoch_end();
            self.logs.merge_into(UpdateFrequency::Epoch, &mut epoch_logs);
            stop |= self.hooks.fire(Event::EpochEnd, epoch, None, &mut epoch_logs)?;
            self.history.record_epoch(epoch + 1, &epoch_logs);

            let (model, optimizer, step) = (self.model.as_ref(), self.optimizer.as_ref(), self.global_step);
            self.tracker
                .on_epoch_end(epoch, || take_snapshot(model, optimizer, epoch + 1, step))?;
            tracing::debug!(
                epoch = epoch + 1,
                step = self.global_step,
                elapsed_ms = millis(started.elapsed()),
                "epoch finished"
            );
        }

        let (model, optimizer, step) = (self.model.as_ref(), self.optimizer.as_ref(), self.global_step);
        let last_epoch = self.tracker.last_epoch();
        self.tracker.on_train_end(|| {
            take_snapshot(model, optimizer, last_epoch.unwrap_or_default(), step)
        })?;

        let mut final_logs = self.history.last().cloned().unwrap_or_default();
        let final_epoch = self.tracker.last_epoch().unwrap_or(initial_epoch);
        self.hooks
            .fire(Event::RunEnd, final_epoch.saturating_sub(1), None, &mut final_logs)?;
        Ok(self.history.clone())
    }

    /// Loss and metrics over one epoch of `split`. Restores the latest
    /// checkpoint first when configured to and not yet restored.
    pub fn evaluate(&mut self, split: Split) -> Result<Logs, FitError> {
        if self.tracker.needs_restore() {
            self.restore(RestoreTarget::Latest)?;
        }
        let mut logs = Logs::new();
        self.hooks.fire(Event::EvalBegin, 0, None, &mut logs)?;
        let mut logs = self.evaluate_split(split, "")?;
        self.hooks.fire(Event::EvalEnd, 0, None, &mut logs)?;
        tracing::info!(%split, ?logs, "evaluation finished");
        Ok(logs)
    }

    /// Run `burn` discarded then `iters` measured steps, passing each
    /// step's timer to `step`. Model, optimizer and step counter are rolled
    /// back afterwards, even on error.
    fn measure<F>(&mut self, burn: usize, iters: usize, mut step: F) -> Result<(), FitError>
    where
        F: FnMut(&mut Self, &mut Batches, bool) -> Result<(), FitError>,
    {
        let saved = self.snapshot(self.tracker.last_epoch().unwrap_or_default());
        let batch_size = self.config.train.batch_size;
        let result = self
            .data
            .batches(Split::Train, batch_size, None)
            .and_then(|mut stream| {
                for i in 0..burn + iters {
                    step(self, &mut stream, i >= burn)?;
                }
                Ok(())
            });
        self.apply_snapshot(&saved)?;
        self.reset_metrics();
        result
    }

    /// Time full training steps. Never writes checkpoints and leaves the
    /// model as it found it.
    pub fn benchmark(&mut self) -> Result<BenchmarkReport, FitError> {
        let burn = self.config.benchmark.burn_iters;
        let iters = self.config.benchmark.min_iters;
        let mut step_ms = Vec::with_capacity(iters);
        self.measure(burn, iters, |this, stream, measured| {
            let batch = next_batch(stream, Split::Train)?;
            let t = Instant::now();
            this.train_step(&batch, None)?;
            if measured {
                step_ms.push(millis(t.elapsed()));
            }
            Ok(())
        })?;
        let report = BenchmarkReport::new(
            self.model.name(),
            self.config.train.batch_size,
            burn,
            &step_ms,
        );
        tracing::info!(%report, "benchmark finished");
        Ok(report)
    }

    /// Like [`Trainable::benchmark`], but timing the data, forward, backward
    /// and apply phases separately. The report is also written to
    /// `<model_dir>/profile.json`.
    pub fn profile(&mut self) -> Result<ProfileReport, FitError> {
        let burn = self.config.benchmark.burn_iters;
        let iters = self.config.benchmark.min_iters;
        let mut phases = PhaseSamples::default();
        let mut step_ms = Vec::with_capacity(iters);
        self.measure(burn, iters, |this, stream, measured| {
            let mut scratch = PhaseSamples::default();
            let started = Instant::now();
            let batch = next_batch(stream, Split::Train)?;
            scratch.record(Phase::Data, started.elapsed());
            this.train_step(&batch, Some(&mut scratch))?;
            if measured {
                step_ms.push(millis(started.elapsed()));
                phases.absorb(scratch);
            }
            Ok(())
        })?;
        let report = ProfileReport {
            model: self.model.name().to_string(),
            batch_size: self.config.train.batch_size,
            burn_iters: burn,
            phases: phases.summarize(),
            step: TimingStats::from_samples(&step_ms),
            timestamp: Utc::now(),
        };
        std::fs::create_dir_all(&self.config.model_dir)?;
        write_json(&self.config.model_dir.join(PROFILE_FILE), &report, Layout::Pretty)?;
        tracing::info!("{report}");
        Ok(report)
    }

    /// Draw `batches` batches from `split` and report data-source throughput.
    pub fn run_dataset(&self, split: Split, batches: usize) -> Result<DatasetReport, FitError> {
        let batch_size = self.config.train.batch_size;
        let shuffle = (split == Split::Train).then_some(Shuffle {
            buffer: self.config.train.shuffle_buffer,
            seed: self.config.train.seed,
        });
        let mut stream = self.data.batches(split, batch_size, shuffle)?;
        let started = Instant::now();
        let mut examples = 0;
        for _ in 0..batches {
            examples += next_batch(&mut stream, split)?.size();
        }
        let report = DatasetReport::new(
            self.data.name(),
            &split.to_string(),
            batches,
            examples,
            started.elapsed(),
        );
        tracing::info!(%report, "dataset run finished");
        Ok(report)
    }
}
