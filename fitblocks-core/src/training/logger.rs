//! Built-in event handlers: epoch log reporting and NaN termination.

use crate::error::FitError;
use crate::training::events::{EventContext, EventHandler, Logs};

/// Reports the epoch logs through `tracing`, one aligned line per key.
#[derive(Debug, Default, Clone)]
pub struct EpochLogger;

impl EpochLogger {
    /// Render `logs` as the multi-line epoch summary.
    pub fn format(completed_epochs: usize, logs: &Logs) -> String {
        let width = logs.keys().map(String::len).max().unwrap_or(0);
        let mut lines = vec![format!("Finished epoch {completed_epochs}")];
        for (key, value) in logs {
            lines.push(format!("{key:<w$}: {value}", w = width + 1));
        }
        lines.join("\n")
    }
}

impl EventHandler for EpochLogger {
    fn handle(&mut self, ctx: &mut EventContext<'_>) -> Result<(), FitError> {
        if !ctx.logs.is_empty() {
            tracing::info!("{}", Self::format(ctx.completed_epochs(), ctx.logs));
        }
        Ok(())
    }
}

/// Stops the run as soon as the reported loss is NaN or infinite.
#[derive(Debug, Clone)]
pub struct TerminateOnNan {
    key: String,
}

impl TerminateOnNan {
    pub fn new() -> Self {
        Self { key: "loss".into() }
    }

    /// Watch a log key other than `loss`.
    pub fn watching(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl Default for TerminateOnNan {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for TerminateOnNan {
    fn handle(&mut self, ctx: &mut EventContext<'_>) -> Result<(), FitError> {
        if let Some(&value) = ctx.logs.get(&self.key)
            && !value.is_finite()
        {
            tracing::warn!(
                epoch = ctx.epoch,
                batch = ?ctx.batch,
                key = %self.key,
                "invalid loss, terminating training"
            );
            ctx.request_stop();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::events::{Event, Hooks};

    #[test]
    fn test_format_aligns_sorted_keys() {
        let mut logs = Logs::new();
        logs.insert("val_loss".into(), 0.25);
        logs.insert("loss".into(), 0.5);
        let text = EpochLogger::format(3, &logs);
        assert_eq!(text, "Finished epoch 3\nloss     : 0.5\nval_loss : 0.25");
    }

    #[test]
    fn test_terminate_on_nan() {
        let mut hooks = Hooks::new();
        hooks.on(Event::BatchEnd, TerminateOnNan::new());

        let mut logs = Logs::new();
        logs.insert("loss".into(), 0.3);
        assert!(!hooks.fire(Event::BatchEnd, 0, Some(0), &mut logs).unwrap());

        logs.insert("loss".into(), f64::NAN);
        assert!(hooks.fire(Event::BatchEnd, 0, Some(1), &mut logs).unwrap());

        logs.insert("loss".into(), f64::INFINITY);
        assert!(hooks.fire(Event::BatchEnd, 0, Some(2), &mut logs).unwrap());
    }

    #[test]
    fn test_terminate_on_nan_ignores_missing_key() {
        let mut handler = TerminateOnNan::watching("val_loss");
        let mut logs = Logs::new();
        logs.insert("loss".into(), f64::NAN);
        let mut ctx = EventContext::new(Event::EpochEnd, 0, None, &mut logs);
        handler.handle(&mut ctx).unwrap();
        assert!(!ctx.stop_requested());
    }
}
