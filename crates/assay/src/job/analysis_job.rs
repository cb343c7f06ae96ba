//! Frozen, immutable analysis jobs.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use super::{ComponentId, ComponentRequirement};
use crate::descriptor::{
    ComponentConfiguration, ComponentDescriptor, ComponentFactory, ComponentKind,
};
use crate::error::{ConfigurationError, Result};
use crate::schema::InputColumn;

/// One configured component inside a frozen job.
pub struct ComponentJob {
    pub(crate) id: ComponentId,
    pub(crate) name: String,
    pub(crate) factory: Arc<dyn ComponentFactory>,
    pub(crate) configuration: ComponentConfiguration,
    pub(crate) outputs: Vec<InputColumn>,
    pub(crate) requirement: Option<ComponentRequirement>,
}

impl ComponentJob {
    pub fn id(&self) -> ComponentId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &ComponentDescriptor {
        self.factory.descriptor()
    }

    pub fn kind(&self) -> ComponentKind {
        self.descriptor().kind
    }

    pub fn factory(&self) -> &Arc<dyn ComponentFactory> {
        &self.factory
    }

    pub fn configuration(&self) -> &ComponentConfiguration {
        &self.configuration
    }

    pub fn inputs(&self) -> &[InputColumn] {
        &self.configuration.inputs
    }

    pub fn outputs(&self) -> &[InputColumn] {
        &self.outputs
    }

    pub fn requirement(&self) -> Option<&ComponentRequirement> {
        self.requirement.as_ref()
    }
}

impl fmt::Debug for ComponentJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentJob")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("inputs", &self.configuration.inputs)
            .field("outputs", &self.outputs)
            .field("requirement", &self.requirement)
            .finish()
    }
}

/// An immutable job, safe to share across worker threads.
///
/// Components are stored in execution order: every component comes after
/// the components it depends on.
#[derive(Debug)]
pub struct AnalysisJob {
    pub(crate) name: String,
    pub(crate) datastore: Option<String>,
    pub(crate) source_columns: Vec<InputColumn>,
    pub(crate) components: Vec<ComponentJob>,
}

impl AnalysisJob {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the datastore the job was built against, if any.
    pub fn datastore(&self) -> Option<&str> {
        self.datastore.as_deref()
    }

    pub fn source_columns(&self) -> &[InputColumn] {
        &self.source_columns
    }

    pub fn components(&self) -> &[ComponentJob] {
        &self.components
    }

    pub fn component(&self, id: ComponentId) -> Option<&ComponentJob> {
        self.components.iter().find(|c| c.id == id)
    }

    pub fn component_by_name(&self, name: &str) -> Option<&ComponentJob> {
        self.components.iter().find(|c| c.name == name)
    }

    pub fn components_of(&self, kind: ComponentKind) -> impl Iterator<Item = &ComponentJob> {
        self.components.iter().filter(move |c| c.kind() == kind)
    }

    pub fn analyzers(&self) -> impl Iterator<Item = &ComponentJob> {
        self.components_of(ComponentKind::Analyzer)
    }

    /// Position of a component in execution order.
    pub fn position(&self, id: ComponentId) -> Option<usize> {
        self.components.iter().position(|c| c.id == id)
    }

    /// Requirements carried by the components whose generated columns flow,
    /// directly or transitively, into `id`.
    pub fn source_requirements(&self, id: ComponentId) -> Vec<ComponentRequirement> {
        let mut requirements = Vec::new();
        let mut seen = HashSet::new();
        let mut stack: Vec<ComponentId> = self
            .component(id)
            .map(|c| c.inputs().iter().filter_map(|col| col.producer()).collect())
            .unwrap_or_default();

        while let Some(next) = stack.pop() {
            if !seen.insert(next) {
                continue;
            }
            if let Some(source) = self.component(next) {
                if let Some(requirement) = &source.requirement {
                    requirements.push(requirement.clone());
                }
                stack.extend(source.inputs().iter().filter_map(|col| col.producer()));
            }
        }
        requirements
    }

    /// Check that every analyzer can merge partial results.
    pub fn check_partitionable(&self) -> Result<()> {
        for analyzer in self.analyzers() {
            if analyzer.factory.reducer().is_none() {
                return Err(ConfigurationError::NotPartitionable(analyzer.name.clone()).into());
            }
        }
        Ok(())
    }
}
