//! The model collaborator: forward pass, gradients and parameter access.

use crate::error::FitError;
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// A named weight tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: Tensor,
    pub trainable: bool,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: Tensor) -> Self {
        Self {
            name: name.into(),
            value,
            trainable: true,
        }
    }

    /// A parameter the optimizer never updates.
    pub fn frozen(name: impl Into<String>, value: Tensor) -> Self {
        Self {
            trainable: false,
            ..Self::new(name, value)
        }
    }
}

pub trait Model: Send {
    fn name(&self) -> &str;

    /// Run the model. With `training` set, the model keeps whatever it needs
    /// for the following [`Model::backward`] call.
    fn forward(&mut self, inputs: &Tensor, training: bool) -> Result<Tensor, FitError>;

    /// Gradients of the total loss with respect to each trainable parameter,
    /// in parameter order, given the gradient with respect to the output of
    /// the last training forward pass. Auxiliary-loss gradients are included.
    /// `None` marks a parameter the loss does not depend on.
    fn backward(&mut self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>, FitError>;

    /// Extra loss terms (e.g. weight penalties) added to the primary loss.
    fn auxiliary_losses(&self) -> Vec<f64> {
        Vec::new()
    }

    fn parameters(&self) -> &[Parameter];

    fn parameters_mut(&mut self) -> &mut [Parameter];

    /// Human-readable parameter table.
    fn summary(&self) -> String {
        let mut out = format!("Model: {}\n", self.name());
        let mut trainable = 0;
        let mut frozen = 0;
        for p in self.parameters() {
            let _ = writeln!(out, "  {:<24} {:?}", p.name, p.value.shape());
            if p.trainable {
                trainable += p.value.len();
            } else {
                frozen += p.value.len();
            }
        }
        let _ = write!(
            out,
            "Trainable params: {trainable}\nNon-trainable params: {frozen}"
        );
        out
    }
}

/// Replace disconnected (`None`) gradients with zeros shaped like their
/// parameter, so the optimizer sees one gradient per trainable parameter.
pub fn fill_disconnected(
    params: &[Parameter],
    grads: Vec<Option<Tensor>>,
) -> Result<Vec<Tensor>, FitError> {
    let trainable: Vec<&Parameter> = params.iter().filter(|p| p.trainable).collect();
    if trainable.len() != grads.len() {
        return Err(FitError::training(format!(
            "model produced {} gradients for {} trainable parameters",
            grads.len(),
            trainable.len()
        )));
    }
    Ok(trainable
        .into_iter()
        .zip(grads)
        .map(|(p, g)| {
            g.unwrap_or_else(|| {
                tracing::trace!(parameter = %p.name, "no gradient, using zeros");
                Tensor::zeros_like(&p.value)
            })
        })
        .collect())
}

/// Copy of every parameter keyed by name.
pub fn parameter_map(model: &dyn Model) -> BTreeMap<String, Tensor> {
    model
        .parameters()
        .iter()
        .map(|p| (p.name.clone(), p.value.clone()))
        .collect()
}

/// Assign stored values to the model's parameters.
///
/// Every parameter must be present with a matching shape; otherwise nothing
/// is assigned and a [`FitError::Checkpoint`] is returned.
pub fn load_parameters(
    model: &mut dyn Model,
    values: &BTreeMap<String, Tensor>,
) -> Result<(), FitError> {
    for p in model.parameters() {
        match values.get(&p.name) {
            None => {
                return Err(FitError::checkpoint(format!(
                    "checkpoint has no value for parameter {}",
                    p.name
                )));
            }
            Some(v) if v.shape() != p.value.shape() => {
                return Err(FitError::checkpoint(format!(
                    "parameter {} has shape {:?} but checkpoint holds {:?}",
                    p.name,
                    p.value.shape(),
                    v.shape()
                )));
            }
            Some(_) => {}
        }
    }
    if values.len() != model.parameters().len() {
        tracing::warn!(
            stored = values.len(),
            expected = model.parameters().len(),
            "checkpoint holds values for unknown parameters"
        );
    }
    for p in model.parameters_mut() {
        if let Some(v) = values.get(&p.name) {
            p.value = v.clone();
        }
    }
    Ok(())
}
