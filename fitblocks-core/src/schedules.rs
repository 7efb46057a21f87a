//! Learning-rate schedules.
//!
//! A schedule maps a step count to a value. [`scheduled`] turns one into a
//! recompute function for the value updater, so an optimizer's learning
//! rate variable can follow it at batch or epoch boundaries.

use crate::error::FitError;
use crate::training::variable::Variable;

pub trait LearningRateSchedule: Send {
    fn value(&self, step: f64) -> f64;
}

/// `initial * decay_rate ^ (step / decay_steps)`, with the exponent floored
/// when `staircase` is set.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialDecay {
    pub initial: f64,
    pub decay_steps: f64,
    pub decay_rate: f64,
    pub staircase: bool,
}

impl LearningRateSchedule for ExponentialDecay {
    fn value(&self, step: f64) -> f64 {
        let mut p = step / self.decay_steps;
        if self.staircase {
            p = p.floor();
        }
        self.initial * self.decay_rate.powf(p)
    }
}

/// `values[0]` up to and including `boundaries[0]`, `values[1]` up to
/// `boundaries[1]`, ..., and the last value afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct PiecewiseConstantDecay {
    boundaries: Vec<f64>,
    values: Vec<f64>,
}

impl PiecewiseConstantDecay {
    pub fn new(boundaries: Vec<f64>, values: Vec<f64>) -> Result<Self, FitError> {
        if values.len() != boundaries.len() + 1 {
            return Err(FitError::config(format!(
                "piecewise schedule needs one more value than boundaries, got {} and {}",
                values.len(),
                boundaries.len()
            )));
        }
        if boundaries.windows(2).any(|w| w[0] > w[1]) {
            return Err(FitError::config("piecewise boundaries must be increasing"));
        }
        Ok(Self { boundaries, values })
    }
}

impl LearningRateSchedule for PiecewiseConstantDecay {
    fn value(&self, step: f64) -> f64 {
        let i = self.boundaries.partition_point(|&b| b < step);
        self.values[i]
    }
}

/// Polynomial interpolation from `initial` to `end` over `decay_steps`.
/// With `cycle`, the horizon extends to the next multiple of `decay_steps`
/// instead of holding at `end`.
#[derive(Debug, Clone, PartialEq)]
pub struct PolynomialDecay {
    pub initial: f64,
    pub decay_steps: f64,
    pub end: f64,
    pub power: f64,
    pub cycle: bool,
}

impl LearningRateSchedule for PolynomialDecay {
    fn value(&self, step: f64) -> f64 {
        let (step, horizon) = if self.cycle {
            let mult = if step == 0.0 {
                1.0
            } else {
                (step / self.decay_steps).ceil()
            };
            (step, self.decay_steps * mult)
        } else {
            (step.min(self.decay_steps), self.decay_steps)
        };
        (self.initial - self.end) * (1.0 - step / horizon).powf(self.power) + self.end
    }
}

/// Recompute function evaluating `schedule` at the current value of `step`.
pub fn scheduled<S>(schedule: S, step: Variable) -> impl FnMut() -> f64 + Send + 'static
where
    S: LearningRateSchedule + 'static,
{
    move || schedule.value(step.get())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::value_updater::ValueUpdater;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_exponential_decay() {
        let s = ExponentialDecay {
            initial: 1.0,
            decay_steps: 10.0,
            decay_rate: 0.5,
            staircase: false,
        };
        assert!(close(s.value(0.0), 1.0));
        assert!(close(s.value(10.0), 0.5));
        assert!(close(s.value(5.0), 0.5f64.sqrt()));

        let stairs = ExponentialDecay { staircase: true, ..s };
        assert!(close(stairs.value(19.0), 0.5));
    }

    #[test]
    fn test_piecewise_constant() {
        let s = PiecewiseConstantDecay::new(vec![10.0, 20.0], vec![1.0, 0.5, 0.1]).unwrap();
        assert_eq!(s.value(0.0), 1.0);
        assert_eq!(s.value(10.0), 1.0);
        assert_eq!(s.value(10.5), 0.5);
        assert_eq!(s.value(20.0), 0.5);
        assert_eq!(s.value(100.0), 0.1);
        assert!(PiecewiseConstantDecay::new(vec![1.0], vec![1.0]).is_err());
        assert!(PiecewiseConstantDecay::new(vec![2.0, 1.0], vec![1.0, 1.0, 1.0]).is_err());
    }

    #[test]
    fn test_polynomial_decay() {
        let s = PolynomialDecay {
            initial: 1.0,
            decay_steps: 10.0,
            end: 0.0,
            power: 1.0,
            cycle: false,
        };
        assert!(close(s.value(5.0), 0.5));
        assert!(close(s.value(50.0), 0.0));

        let cyc = PolynomialDecay { cycle: true, ..s };
        assert!(close(cyc.value(15.0), 0.25));
    }

    #[test]
    fn test_scheduled_drives_variable_through_updater() {
        let step = Variable::new("step", 0.0);
        let lr = Variable::new("lr", 1.0);
        let mut updater = ValueUpdater::new();
        let schedule = ExponentialDecay {
            initial: 1.0,
            decay_steps: 1.0,
            decay_rate: 0.5,
            staircase: true,
        };
        updater
            .schedule_epoch_update(&lr, scheduled(schedule, step.clone()))
            .unwrap();
        step.set(2.0);
        updater.on_epoch_end();
        assert_eq!(lr.get(), 0.25);
    }
}
