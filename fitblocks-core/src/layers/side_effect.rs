//! Identity layer that runs an observer on its inputs.

use crate::error::FitError;
use crate::tensor::TensorLike;

/// Passes inputs through unchanged after handing them to `observer`.
///
/// Useful for recording batch statistics into a [`Variable`](crate::training::Variable)
/// from inside a model without altering the data flow.
pub struct SideEffect<F>
where
    F: FnMut(&TensorLike) -> Result<(), FitError>,
{
    observer: F,
    name: String,
}

impl<F> SideEffect<F>
where
    F: FnMut(&TensorLike) -> Result<(), FitError>,
{
    pub fn new(name: impl Into<String>, observer: F) -> Self {
        Self {
            observer,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the observer, then return the inputs. Observer errors propagate.
    pub fn call(&mut self, inputs: TensorLike) -> Result<TensorLike, FitError> {
        (self.observer)(&inputs)?;
        Ok(inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;
    use crate::training::Variable;

    #[test]
    fn test_side_effect_is_identity() {
        let seen = Variable::new("batch_mean", 0.0);
        let sink = seen.clone();
        let mut layer = SideEffect::new("record_mean", move |x: &TensorLike| {
            if let Some(t) = x.as_dense() {
                sink.set(t.mean());
            }
            Ok(())
        });
        let input: TensorLike = Tensor::vector(&[1.0, 2.0, 3.0]).into();
        let out = layer.call(input.clone()).unwrap();
        assert_eq!(out, input);
        assert_eq!(seen.get(), 2.0);
        assert_eq!(layer.name(), "record_mean");
    }

    #[test]
    fn test_side_effect_error_propagates() {
        let mut layer = SideEffect::new("fail", |_: &TensorLike| Err(FitError::shape("bad")));
        assert!(layer.call(Tensor::scalar(1.0).into()).is_err());
    }
}
