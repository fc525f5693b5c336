//! Lookup from task type to adapter.

use crate::adapter::{ProviderAdapter, TaskType};
use crate::chat::{GlmAdapter, LlamaAdapter};
use crate::image::TextToImageAdapter;
use std::collections::HashMap;
use std::sync::Arc;

/// Set of adapters the engine can dispatch to.
#[derive(Debug, Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<TaskType, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with one default adapter per known family.
    pub fn with_defaults() -> Self {
        Self::new()
            .register(GlmAdapter::new())
            .register(LlamaAdapter::new())
            .register(TextToImageAdapter::new())
    }

    /// Add or replace the adapter for its family.
    pub fn register(mut self, adapter: impl ProviderAdapter + 'static) -> Self {
        self.adapters.insert(adapter.task_type(), Arc::new(adapter));
        self
    }

    /// Adapter for `task_type`, if registered.
    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&task_type).cloned()
    }

    /// Families that have an adapter.
    pub fn task_types(&self) -> Vec<TaskType> {
        let mut types: Vec<_> = self.adapters.keys().copied().collect();
        types.sort();
        types
    }
}
