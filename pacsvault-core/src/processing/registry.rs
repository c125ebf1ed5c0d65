use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::dispatcher::{ItemProcessor, QueueEntry};
use crate::error::Result;

/// Builds a fresh processor for one entry.
pub type ProcessorFactory<E> =
    Arc<dyn Fn() -> Result<Arc<dyn ItemProcessor<E>>> + Send + Sync>;

/// Explicit map from an entry's kind to the constructor of its processor.
pub struct ProcessorRegistry<E: QueueEntry> {
    factories: HashMap<E::Kind, ProcessorFactory<E>>,
}

impl<E: QueueEntry> Default for ProcessorRegistry<E> {
    fn default() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }
}

impl<E: QueueEntry> fmt::Debug for ProcessorRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl<E: QueueEntry> ProcessorRegistry<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` for `kind`, replacing any earlier registration.
    pub fn register<F>(&mut self, kind: E::Kind, factory: F) -> &mut Self
    where
        F: Fn() -> Result<Arc<dyn ItemProcessor<E>>> + Send + Sync + 'static,
    {
        self.factories.insert(kind, Arc::new(factory));
        self
    }

    pub fn contains(&self, kind: E::Kind) -> bool {
        self.factories.contains_key(&kind)
    }

    /// `None` when nothing is registered for `kind`.
    pub fn create(&self, kind: E::Kind) -> Option<Result<Arc<dyn ItemProcessor<E>>>> {
        self.factories.get(&kind).map(|factory| factory())
    }

    pub fn kinds(&self) -> Vec<E::Kind> {
        self.factories.keys().copied().collect()
    }
}
