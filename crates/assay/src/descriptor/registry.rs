//! Typed registry of component factories.

use std::sync::Arc;

use indexmap::IndexMap;

use super::component::ComponentFactory;
use super::{ComponentDescriptor, ComponentKind};
use crate::components;
use crate::error::{ConfigurationError, Result};

/// Component factories by descriptor name.
///
/// Registries are plain values handed to the builder; there is no process-wide
/// instance.
#[derive(Default, Clone)]
pub struct ComponentRegistry {
    factories: IndexMap<String, Arc<dyn ComponentFactory>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in components.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        components::register_builtins(&mut registry);
        registry
    }

    /// Register a factory, replacing any factory with the same name.
    pub fn register(&mut self, factory: impl ComponentFactory + 'static) -> &mut Self {
        self.register_arc(Arc::new(factory))
    }

    pub fn register_arc(&mut self, factory: Arc<dyn ComponentFactory>) -> &mut Self {
        let name = factory.descriptor().name.clone();
        self.factories.insert(name, factory);
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ComponentFactory>> {
        self.factories
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigurationError::UnknownComponent(name.to_string()).into())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ComponentDescriptor> {
        self.factories.values().map(|f| f.descriptor())
    }

    pub fn descriptors_of(&self, kind: ComponentKind) -> impl Iterator<Item = &ComponentDescriptor> {
        self.descriptors().filter(move |d| d.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}
