//! Fully connected layer usable as a standalone [`Model`].

use crate::error::FitError;
use crate::initializers::Initializer;
use crate::regularizers::Regularizer;
use crate::spec::{Shape, TensorSpec};
use crate::tensor::{DType, Tensor};
use crate::training::model::{Model, Parameter};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Linear,
    Relu,
}

/// `y = activation(x . kernel + bias)` over inputs of shape `(batch, input_dim)`.
pub struct Dense {
    name: String,
    activation: Activation,
    kernel_regularizer: Option<Regularizer>,
    params: Vec<Parameter>,
    cache: Option<(Tensor, Tensor)>,
}

impl Dense {
    /// Kernel drawn from `initializer` with `seed`, bias zero-initialized.
    pub fn new(
        name: impl Into<String>,
        input_dim: usize,
        units: usize,
        initializer: Initializer,
        seed: u64,
    ) -> Self {
        let name = name.into();
        let mut rng = StdRng::seed_from_u64(seed);
        let kernel = initializer.initialize(&[input_dim, units], &mut rng);
        Self {
            params: vec![
                Parameter::new(format!("{name}/kernel"), kernel),
                Parameter::new(format!("{name}/bias"), Tensor::zeros(&[units])),
            ],
            name,
            activation: Activation::Linear,
            kernel_regularizer: None,
            cache: None,
        }
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Penalize the kernel; the penalty is reported as an auxiliary loss.
    pub fn with_kernel_regularizer(mut self, regularizer: Regularizer) -> Self {
        self.kernel_regularizer = Some(regularizer);
        self
    }

    /// Keep the bias fixed at its current value.
    pub fn with_frozen_bias(mut self) -> Self {
        self.params[1].trainable = false;
        self
    }

    pub fn input_dim(&self) -> usize {
        self.kernel().shape()[0]
    }

    pub fn units(&self) -> usize {
        self.kernel().shape()[1]
    }

    pub fn kernel(&self) -> &Tensor {
        &self.params[0].value
    }

    pub fn bias(&self) -> &Tensor {
        &self.params[1].value
    }

    pub fn input_spec(&self) -> TensorSpec {
        TensorSpec::dense(Shape::new(vec![None, Some(self.input_dim())]), DType::Float32)
    }
}

impl Model for Dense {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&mut self, inputs: &Tensor, training: bool) -> Result<Tensor, FitError> {
        if inputs.rank() != 2 || inputs.shape()[1] != self.input_dim() {
            return Err(FitError::shape(format!(
                "{} expects inputs of shape (batch, {}), got {:?}",
                self.name,
                self.input_dim(),
                inputs.shape()
            )));
        }
        let z = inputs.matmul(self.kernel())?.add_row(self.bias())?;
        let y = match self.activation {
            Activation::Linear => z.clone(),
            Activation::Relu => z.map(|v| v.max(0.0)),
        };
        self.cache = training.then(|| (inputs.clone(), z));
        Ok(y)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>, FitError> {
        let (inputs, z) = self
            .cache
            .take()
            .ok_or_else(|| FitError::training("backward called without a training forward pass"))?;
        let dz = match self.activation {
            Activation::Linear => grad_output.clone(),
            Activation::Relu => grad_output.mul(&z.map(|v| if v > 0.0 { 1.0 } else { 0.0 }))?,
        };

        let mut d_kernel = inputs.transpose()?.matmul(&dz)?;
        if let Some(reg) = &self.kernel_regularizer {
            d_kernel = d_kernel.add(&reg.gradient(self.kernel()))?;
        }
        let mut grads = vec![Some(d_kernel)];
        if self.params[1].trainable {
            grads.push(Some(dz.sum_rows()?));
        }
        Ok(grads)
    }

    fn auxiliary_losses(&self) -> Vec<f64> {
        self.kernel_regularizer
            .iter()
            .map(|r| r.penalty(self.kernel()))
            .collect()
    }

    fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut [Parameter] {
        &mut self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer() -> Dense {
        let mut d = Dense::new("dense", 2, 1, Initializer::Zeros, 0);
        d.parameters_mut()[0].value = Tensor::new(vec![2, 1], vec![1.0, -1.0]).unwrap();
        d.parameters_mut()[1].value = Tensor::vector(&[0.5]);
        d
    }

    #[test]
    fn test_forward() {
        let mut d = layer();
        let x = Tensor::new(vec![2, 2], vec![1.0, 2.0, 3.0, 1.0]).unwrap();
        let y = d.forward(&x, false).unwrap();
        assert_eq!(y.shape(), &[2, 1]);
        assert_eq!(y.data(), &[-0.5, 2.5]);
    }

    #[test]
    fn test_backward_gradients() {
        let mut d = layer();
        let x = Tensor::new(vec![2, 2], vec![1.0, 2.0, 3.0, 1.0]).unwrap();
        d.forward(&x, true).unwrap();
        let grads = d
            .backward(&Tensor::new(vec![2, 1], vec![1.0, 1.0]).unwrap())
            .unwrap();
        assert_eq!(grads.len(), 2);
        assert_eq!(grads[0].as_ref().unwrap().data(), &[4.0, 3.0]);
        assert_eq!(grads[1].as_ref().unwrap().data(), &[2.0]);
    }

    #[test]
    fn test_backward_requires_training_forward() {
        let mut d = layer();
        let x = Tensor::zeros(&[1, 2]);
        d.forward(&x, false).unwrap();
        assert!(d.backward(&Tensor::zeros(&[1, 1])).is_err());
    }

    #[test]
    fn test_relu_masks_gradient() {
        let mut d = layer().with_activation(Activation::Relu);
        let x = Tensor::new(vec![2, 2], vec![1.0, 2.0, 3.0, 1.0]).unwrap();
        let y = d.forward(&x, true).unwrap();
        assert_eq!(y.data(), &[0.0, 2.5]);
        let grads = d.backward(&Tensor::ones(&[2, 1])).unwrap();
        assert_eq!(grads[0].as_ref().unwrap().data(), &[3.0, 1.0]);
    }

    #[test]
    fn test_frozen_bias_and_regularizer() {
        let mut d = layer()
            .with_frozen_bias()
            .with_kernel_regularizer(Regularizer::L2 { l2: 0.5 });
        assert_eq!(d.auxiliary_losses(), vec![1.0]);
        let x = Tensor::zeros(&[1, 2]);
        d.forward(&x, true).unwrap();
        let grads = d.backward(&Tensor::zeros(&[1, 1])).unwrap();
        assert_eq!(grads.len(), 1);
        assert_eq!(grads[0].as_ref().unwrap().data(), &[1.0, -1.0]);
    }

    #[test]
    fn test_rejects_wrong_input_width() {
        let mut d = layer();
        assert!(matches!(
            d.forward(&Tensor::zeros(&[3, 4]), false),
            Err(FitError::Shape(_))
        ));
    }

    #[test]
    fn test_input_spec() {
        let d = layer();
        assert_eq!(d.input_spec().shape().to_string(), "(None, 2)");
    }
}
