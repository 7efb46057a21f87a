//! Shared mutable scalars.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// A named scalar with identity, cheap to clone and share.
///
/// Clones alias the same storage. Equality and hashing use identity, not the
/// current value, so a variable can key the update and log registries.
#[derive(Clone)]
pub struct Variable {
    id: Uuid,
    name: Arc<str>,
    bits: Arc<AtomicU64>,
}

impl Variable {
    pub fn new(name: impl AsRef<str>, value: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: Arc::from(name.as_ref()),
            bits: Arc::new(AtomicU64::new(value.to_bits())),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }

    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Release);
    }

    /// Add `delta` and return the new value.
    pub fn add(&self, delta: f64) -> f64 {
        let value = self.get() + delta;
        self.set(value);
        value
    }
}

impl PartialEq for Variable {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Variable {}

impl Hash for Variable {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variable")
            .field("name", &self.name())
            .field("value", &self.get())
            .finish()
    }
}
