//! Gradient-apply optimizers.
//!
//! Learning rate and iteration count are exposed as [`Variable`]s so that
//! value updaters and log updaters can drive and report them.

use crate::error::FitError;
use crate::tensor::Tensor;
use crate::training::model::Parameter;
use crate::training::variable::Variable;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Serializable optimizer state stored alongside model parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub iterations: u64,
    pub learning_rate: f64,
    /// Per-parameter slot tensors keyed `<slot>/<parameter>`.
    #[serde(default)]
    pub slots: BTreeMap<String, Tensor>,
}

pub trait Optimizer: Send {
    fn name(&self) -> &str;

    /// Apply one update. `grads[i]` belongs to the i-th *trainable* entry of
    /// `params`; non-trainable parameters are left alone.
    fn apply_gradients(&mut self, params: &mut [Parameter], grads: &[Tensor]) -> Result<(), FitError>;

    fn learning_rate(&self) -> &Variable;

    /// Number of updates applied so far.
    fn iterations(&self) -> &Variable;

    fn state(&self) -> OptimizerState;

    fn load_state(&mut self, state: &OptimizerState) -> Result<(), FitError>;
}

/// Pair trainable parameters with their gradients, checking count and shape.
fn trainable_pairs<'p, 'g>(
    params: &'p mut [Parameter],
    grads: &'g [Tensor],
) -> Result<Vec<(&'p mut Parameter, &'g Tensor)>, FitError> {
    let trainable: Vec<&mut Parameter> = params.iter_mut().filter(|p| p.trainable).collect();
    if trainable.len() != grads.len() {
        return Err(FitError::training(format!(
            "got {} gradients for {} trainable parameters",
            grads.len(),
            trainable.len()
        )));
    }
    let pairs: Vec<_> = trainable.into_iter().zip(grads).collect();
    for (param, grad) in &pairs {
        if param.value.shape() != grad.shape() {
            return Err(FitError::shape(format!(
                "gradient for {} has shape {:?}, expected {:?}",
                param.name,
                grad.shape(),
                param.value.shape()
            )));
        }
    }
    Ok(pairs)
}

fn check_slots(slots: &BTreeMap<String, Tensor>, prefixes: &[&str]) -> Result<(), FitError> {
    match slots
        .keys()
        .find(|k| !prefixes.iter().any(|p| k.starts_with(&format!("{p}/"))))
    {
        Some(k) => Err(FitError::checkpoint(format!("unexpected optimizer slot {k}"))),
        None => Ok(()),
    }
}

/// Stochastic gradient descent with optional momentum.
pub struct Sgd {
    learning_rate: Variable,
    momentum: f32,
    iterations: Variable,
    velocity: BTreeMap<String, Tensor>,
}

impl Sgd {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate: Variable::new("learning_rate", learning_rate),
            momentum: 0.0,
            iterations: Variable::new("iterations", 0.0),
            velocity: BTreeMap::new(),
        }
    }

    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }
}

impl Optimizer for Sgd {
    fn name(&self) -> &str {
        "sgd"
    }

    fn apply_gradients(&mut self, params: &mut [Parameter], grads: &[Tensor]) -> Result<(), FitError> {
        let lr = self.learning_rate.get() as f32;
        for (param, grad) in trainable_pairs(params, grads)? {
            let step = if self.momentum == 0.0 {
                grad.scale(-lr)
            } else {
                let v = self
                    .velocity
                    .entry(param.name.clone())
                    .or_insert_with(|| Tensor::zeros_like(grad));
                *v = v.scale(self.momentum).sub(&grad.scale(lr))?;
                v.clone()
            };
            param.value = param.value.add(&step)?;
        }
        self.iterations.add(1.0);
        Ok(())
    }

    fn learning_rate(&self) -> &Variable {
        &self.learning_rate
    }

    fn iterations(&self) -> &Variable {
        &self.iterations
    }

    fn state(&self) -> OptimizerState {
        OptimizerState {
            iterations: self.iterations.get() as u64,
            learning_rate: self.learning_rate.get(),
            slots: self
                .velocity
                .iter()
                .map(|(k, v)| (format!("velocity/{k}"), v.clone()))
                .collect(),
        }
    }

    fn load_state(&mut self, state: &OptimizerState) -> Result<(), FitError> {
        check_slots(&state.slots, &["velocity"])?;
        self.iterations.set(state.iterations as f64);
        self.learning_rate.set(state.learning_rate);
        self.velocity = state
            .slots
            .iter()
            .filter_map(|(k, v)| Some((k.strip_prefix("velocity/")?.to_string(), v.clone())))
            .collect();
        Ok(())
    }
}

/// Adam with bias correction.
pub struct Adam {
    learning_rate: Variable,
    beta_1: f32,
    beta_2: f32,
    epsilon: f32,
    iterations: Variable,
    m: BTreeMap<String, Tensor>,
    v: BTreeMap<String, Tensor>,
}

impl Adam {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate: Variable::new("learning_rate", learning_rate),
            beta_1: 0.9,
            beta_2: 0.999,
            epsilon: 1e-7,
            iterations: Variable::new("iterations", 0.0),
            m: BTreeMap::new(),
            v: BTreeMap::new(),
        }
    }

    pub fn with_betas(mut self, beta_1: f32, beta_2: f32) -> Self {
        self.beta_1 = beta_1;
        self.beta_2 = beta_2;
        self
    }
}

impl Optimizer for Adam {
    fn name(&self) -> &str {
        "adam"
    }

    fn apply_gradients(&mut self, params: &mut [Parameter], grads: &[Tensor]) -> Result<(), FitError> {
        let t = self.iterations.get() as i32 + 1;
        let lr = self.learning_rate.get() as f32;
        let alpha = lr * (1.0 - self.beta_2.powi(t)).sqrt() / (1.0 - self.beta_1.powi(t));
        let (b1, b2, eps) = (self.beta_1, self.beta_2, self.epsilon);

        for (param, grad) in trainable_pairs(params, grads)? {
            let m = self
                .m
                .entry(param.name.clone())
                .or_insert_with(|| Tensor::zeros_like(grad));
            *m = m.scale(b1).add(&grad.scale(1.0 - b1))?;
            let v = self
                .v
                .entry(param.name.clone())
                .or_insert_with(|| Tensor::zeros_like(grad));
            *v = v.scale(b2).add(&grad.mul(grad)?.scale(1.0 - b2))?;

            let mut value = param.value.clone();
            for ((w, &mi), &vi) in value.data_mut().iter_mut().zip(m.data()).zip(v.data()) {
                *w -= alpha * mi / (vi.sqrt() + eps);
            }
            param.value = value;
        }
        self.iterations.add(1.0);
        Ok(())
    }

    fn learning_rate(&self) -> &Variable {
        &self.learning_rate
    }

    fn iterations(&self) -> &Variable {
        &self.iterations
    }

    fn state(&self) -> OptimizerState {
        let slots = self
            .m
            .iter()
            .map(|(k, t)| (format!("m/{k}"), t.clone()))
            .chain(self.v.iter().map(|(k, t)| (format!("v/{k}"), t.clone())))
            .collect();
        OptimizerState {
            iterations: self.iterations.get() as u64,
            learning_rate: self.learning_rate.get(),
            slots,
        }
    }

    fn load_state(&mut self, state: &OptimizerState) -> Result<(), FitError> {
        check_slots(&state.slots, &["m", "v"])?;
        self.iterations.set(state.iterations as f64);
        self.learning_rate.set(state.learning_rate);
        let pick = |prefix: &str| -> BTreeMap<String, Tensor> {
            state
                .slots
                .iter()
                .filter_map(|(k, t)| Some((k.strip_prefix(prefix)?.to_string(), t.clone())))
                .collect()
        };
        self.m = pick("m/");
        self.v = pick("v/");
        Ok(())
    }
}

/// Optimizer selection as it appears in configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OptimizerConfig {
    Sgd { lr: f64, momentum: f32 },
    Adam { lr: f64 },
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self::Sgd {
            lr: 0.01,
            momentum: 0.9,
        }
    }
}

impl OptimizerConfig {
    pub fn build(&self) -> Box<dyn Optimizer> {
        match *self {
            Self::Sgd { lr, momentum } => Box::new(Sgd::new(lr).with_momentum(momentum)),
            Self::Adam { lr } => Box::new(Adam::new(lr)),
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let lr = match *self {
            Self::Sgd { lr, momentum } => {
                if !(0.0..1.0).contains(&momentum) {
                    problems.push(format!("momentum {momentum} must be in [0, 1)"));
                }
                lr
            }
            Self::Adam { lr } => lr,
        };
        if !(lr.is_finite() && lr > 0.0) {
            problems.push(format!("learning rate {lr} must be positive"));
        }
        problems
    }
}
