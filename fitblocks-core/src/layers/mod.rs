//! Model-building layers.

pub mod dense;
pub mod shape;
pub mod side_effect;

pub use dense::{Activation, Dense};
pub use shape::{LeadingDims, as_batched, flatten_leading_dims, reshape_leading_dim};
pub use side_effect::SideEffect;
