//! Event handlers fired by the training loop.
//!
//! Instead of overriding optional methods of a callback base, handlers are
//! registered against an [`Event`] and run in registration order whenever
//! that event fires.

use crate::error::FitError;
use std::collections::BTreeMap;
use std::fmt;

/// Per-boundary scalar logs (loss, metrics, logged values).
pub type Logs = BTreeMap<String, f64>;

/// Points in the run at which handlers fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    RunBegin,
    EpochBegin,
    BatchEnd,
    EpochEnd,
    RunEnd,
    EvalBegin,
    EvalEnd,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RunBegin => "run_begin",
            Self::EpochBegin => "epoch_begin",
            Self::BatchEnd => "batch_end",
            Self::EpochEnd => "epoch_end",
            Self::RunEnd => "run_end",
            Self::EvalBegin => "eval_begin",
            Self::EvalEnd => "eval_end",
        };
        f.write_str(name)
    }
}

/// What a handler sees when it fires.
pub struct EventContext<'a> {
    pub event: Event,
    /// Zero-based index of the current epoch.
    pub epoch: usize,
    /// Zero-based batch index within the epoch, for batch events.
    pub batch: Option<usize>,
    pub logs: &'a mut Logs,
    stop: bool,
}

impl<'a> EventContext<'a> {
    pub fn new(event: Event, epoch: usize, batch: Option<usize>, logs: &'a mut Logs) -> Self {
        Self {
            event,
            epoch,
            batch,
            logs,
            stop: false,
        }
    }

    /// Number of epochs completed once the current one finishes.
    pub fn completed_epochs(&self) -> usize {
        self.epoch + 1
    }

    /// Ask the loop to halt after this boundary.
    pub fn request_stop(&mut self) {
        self.stop = true;
    }

    pub fn stop_requested(&self) -> bool {
        self.stop
    }
}

/// Something that reacts to loop events.
pub trait EventHandler: Send {
    fn handle(&mut self, ctx: &mut EventContext<'_>) -> Result<(), FitError>;
}

struct FnHandler<F>(F);

impl<F> EventHandler for FnHandler<F>
where
    F: FnMut(&mut EventContext<'_>) -> Result<(), FitError> + Send,
{
    fn handle(&mut self, ctx: &mut EventContext<'_>) -> Result<(), FitError> {
        (self.0)(ctx)
    }
}

/// Ordered `(event, handler)` registrations.
#[derive(Default)]
pub struct Hooks {
    handlers: Vec<(Event, Box<dyn EventHandler>)>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<H>(&mut self, event: Event, handler: H) -> &mut Self
    where
        H: EventHandler + 'static,
    {
        self.handlers.push((event, Box::new(handler)));
        self
    }

    pub fn on_fn<F>(&mut self, event: Event, handler: F) -> &mut Self
    where
        F: FnMut(&mut EventContext<'_>) -> Result<(), FitError> + Send + 'static,
    {
        self.on(event, FnHandler(handler))
    }

    /// Append all registrations from `other`, keeping their order.
    pub fn extend(&mut self, other: Hooks) {
        self.handlers.extend(other.handlers);
    }

    /// Run every handler registered for `event`. Returns whether any handler
    /// requested a stop. The first handler error aborts the dispatch.
    pub fn fire(
        &mut self,
        event: Event,
        epoch: usize,
        batch: Option<usize>,
        logs: &mut Logs,
    ) -> Result<bool, FitError> {
        let mut ctx = EventContext::new(event, epoch, batch, logs);
        for (_, handler) in self.handlers.iter_mut().filter(|(e, _)| *e == event) {
            handler.handle(&mut ctx)?;
        }
        Ok(ctx.stop_requested())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_fire_runs_matching_handlers_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = Hooks::new();
        for tag in ["first", "second"] {
            let seen = seen.clone();
            hooks.on_fn(Event::EpochEnd, move |ctx| {
                seen.lock().unwrap().push((tag, ctx.completed_epochs()));
                Ok(())
            });
        }
        let other = seen.clone();
        hooks.on_fn(Event::BatchEnd, move |_| {
            other.lock().unwrap().push(("batch", 0));
            Ok(())
        });

        let mut logs = Logs::new();
        let stop = hooks.fire(Event::EpochEnd, 0, None, &mut logs).unwrap();
        assert!(!stop);
        assert_eq!(*seen.lock().unwrap(), vec![("first", 1), ("second", 1)]);
    }

    #[test]
    fn test_handlers_can_edit_logs_and_stop() {
        let mut hooks = Hooks::new();
        hooks.on_fn(Event::BatchEnd, |ctx| {
            ctx.logs.insert("extra".into(), 1.5);
            ctx.request_stop();
            Ok(())
        });
        let mut logs = Logs::new();
        assert!(hooks.fire(Event::BatchEnd, 2, Some(7), &mut logs).unwrap());
        assert_eq!(logs["extra"], 1.5);
    }

    #[test]
    fn test_handler_error_propagates() {
        let mut hooks = Hooks::new();
        hooks.on_fn(Event::RunBegin, |_| Err(FitError::training("nope")));
        let mut logs = Logs::new();
        assert!(hooks.fire(Event::RunBegin, 0, None, &mut logs).is_err());
        assert!(hooks.fire(Event::RunEnd, 0, None, &mut logs).is_ok());
    }
}
