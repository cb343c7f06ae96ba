//! Mutable job graph builder.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, info};

use super::analysis_job::{AnalysisJob, ComponentJob};
use super::graph::DependencyGraph;
use super::requirement::{ComponentRequirement, FilterOutcome};
use super::ComponentId;
use crate::descriptor::{
    ComponentConfiguration, ComponentDescriptor, ComponentFactory, ComponentKind,
    ComponentRegistry,
};
use crate::error::{ConfigurationError, Result};
use crate::input::Datastore;
use crate::schema::{ColumnId, DataType, InputColumn};

/// Receives notifications about changes to a job builder.
pub trait JobChangeListener: Send {
    fn on_component_added(&mut self, _component: &ComponentBuilder) {}

    fn on_component_changed(&mut self, _component: &ComponentBuilder) {}

    fn on_component_removed(&mut self, _component: &ComponentBuilder) {}

    fn on_source_column_added(&mut self, _column: &InputColumn) {}

    fn on_source_column_removed(&mut self, _column: &InputColumn) {}
}

/// A component being configured.
pub struct ComponentBuilder {
    id: ComponentId,
    name: String,
    factory: Arc<dyn ComponentFactory>,
    properties: IndexMap<String, serde_json::Value>,
    inputs: Vec<InputColumn>,
    outputs: Vec<InputColumn>,
    requirement: Option<ComponentRequirement>,
    /// Default requirement in force when the component was added.
    default_requirement: Option<FilterOutcome>,
}

impl ComponentBuilder {
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

    pub fn properties(&self) -> &IndexMap<String, serde_json::Value> {
        &self.properties
    }

    pub fn inputs(&self) -> &[InputColumn] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[InputColumn] {
        &self.outputs
    }

    /// The requirement set on this component, ignoring any default requirement.
    pub fn explicit_requirement(&self) -> Option<&ComponentRequirement> {
        self.requirement.as_ref()
    }

    pub fn configuration(&self) -> ComponentConfiguration {
        ComponentConfiguration {
            properties: self.properties.clone(),
            inputs: self.inputs.clone(),
        }
        .with_defaults(self.descriptor())
    }
}

impl std::fmt::Debug for ComponentBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentBuilder")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("requirement", &self.requirement)
            .finish()
    }
}

/// Builds an analysis job graph and freezes it into an [`AnalysisJob`].
///
/// Wiring that would introduce a dependency cycle is rejected as it is made.
pub struct AnalysisJobBuilder {
    registry: Arc<ComponentRegistry>,
    name: String,
    datastore: Option<String>,
    source_columns: Vec<InputColumn>,
    components: IndexMap<ComponentId, ComponentBuilder>,
    next_component: usize,
    next_column: u64,
    default_requirement: Option<FilterOutcome>,
    listeners: Vec<Box<dyn JobChangeListener>>,
}

impl AnalysisJobBuilder {
    pub fn new(registry: Arc<ComponentRegistry>) -> Self {
        Self {
            registry,
            name: "analysis".to_string(),
            datastore: None,
            source_columns: Vec::new(),
            components: IndexMap::new(),
            next_component: 0,
            next_column: 0,
            default_requirement: None,
            listeners: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    pub fn add_listener(&mut self, listener: Box<dyn JobChangeListener>) {
        self.listeners.push(listener);
    }

    // ---------------------------------------------------------------------
    // Source columns
    // ---------------------------------------------------------------------

    /// Add every column of a datastore as a source column.
    pub fn set_datastore(&mut self, datastore: &dyn Datastore) -> Result<Vec<InputColumn>> {
        let connection = datastore.open()?;
        let columns: Vec<InputColumn> = connection
            .columns()
            .iter()
            .map(|c| self.add_source_column(c.name.clone(), c.data_type))
            .collect();
        self.datastore = Some(datastore.name().to_string());
        Ok(columns)
    }

    /// Add a source column, or return the existing column with that name.
    pub fn add_source_column(&mut self, name: impl Into<String>, data_type: DataType) -> InputColumn {
        let name = name.into();
        if let Some(existing) = self.source_column(&name) {
            return existing;
        }
        let column = InputColumn::source(self.next_column_id(), name, data_type);
        self.source_columns.push(column.clone());
        for listener in &mut self.listeners {
            listener.on_source_column_added(&column);
        }
        column
    }

    pub fn source_column(&self, name: &str) -> Option<InputColumn> {
        self.source_columns.iter().find(|c| c.name() == name).cloned()
    }

    pub fn source_columns(&self) -> &[InputColumn] {
        &self.source_columns
    }

    /// Remove a source column and unwire it from every component.
    pub fn remove_source_column(&mut self, column: &InputColumn) -> bool {
        let before = self.source_columns.len();
        self.source_columns.retain(|c| c != column);
        if self.source_columns.len() == before {
            return false;
        }

        let affected: Vec<ComponentId> = self
            .components
            .values()
            .filter(|c| c.inputs.contains(column))
            .map(|c| c.id)
            .collect();
        for id in affected {
            if let Some(component) = self.components.get_mut(&id) {
                component.inputs.retain(|c| c != column);
            }
            self.refresh_outputs(id);
            self.notify_changed(id);
        }
        for listener in &mut self.listeners {
            listener.on_source_column_removed(column);
        }
        true
    }

    // ---------------------------------------------------------------------
    // Components
    // ---------------------------------------------------------------------

    /// Add an unconfigured component by descriptor name.
    pub fn add_component(&mut self, descriptor_name: &str) -> Result<ComponentId> {
        let factory = self.registry.get(descriptor_name)?;
        let id = ComponentId(self.next_component);
        self.next_component += 1;

        let component = ComponentBuilder {
            id,
            name: factory.descriptor().name.clone(),
            factory,
            properties: IndexMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            requirement: None,
            default_requirement: self.default_requirement.clone(),
        };
        self.components.insert(id, component);
        self.refresh_outputs(id);

        if let Some(component) = self.components.get(&id) {
            debug!(component = %component.name, id = %id, "added component");
            for listener in &mut self.listeners {
                listener.on_component_added(component);
            }
        }
        Ok(id)
    }

    /// Add a component with its input columns and properties in one step.
    pub fn add_component_with<I, K>(
        &mut self,
        descriptor_name: &str,
        inputs: &[InputColumn],
        properties: I,
    ) -> Result<ComponentId>
    where
        I: IntoIterator<Item = (K, serde_json::Value)>,
        K: AsRef<str>,
    {
        let id = self.add_component(descriptor_name)?;
        for (name, value) in properties {
            self.set_property(id, name.as_ref(), value)?;
        }
        self.add_input_columns(id, inputs)?;
        Ok(id)
    }

    pub fn component(&self, id: ComponentId) -> Option<&ComponentBuilder> {
        self.components.get(&id)
    }

    pub fn components(&self) -> impl Iterator<Item = &ComponentBuilder> {
        self.components.values()
    }

    pub fn components_of(&self, kind: ComponentKind) -> impl Iterator<Item = &ComponentBuilder> {
        self.components.values().filter(move |c| c.kind() == kind)
    }

    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    fn get(&self, id: ComponentId) -> Result<&ComponentBuilder> {
        self.components
            .get(&id)
            .ok_or_else(|| ConfigurationError::UnknownComponent(id.to_string()).into())
    }

    fn get_mut(&mut self, id: ComponentId) -> Result<&mut ComponentBuilder> {
        self.components
            .get_mut(&id)
            .ok_or_else(|| ConfigurationError::UnknownComponent(id.to_string()).into())
    }

    pub fn set_component_name(&mut self, id: ComponentId, name: impl Into<String>) -> Result<()> {
        self.get_mut(id)?.name = name.into();
        self.notify_changed(id);
        Ok(())
    }

    /// Set (or with a JSON null, unset) a property.
    pub fn set_property(
        &mut self,
        id: ComponentId,
        property: &str,
        value: impl Into<serde_json::Value>,
    ) -> Result<()> {
        let value = value.into();
        let component = self.get(id)?;
        let Some(descriptor) = component.descriptor().property(property) else {
            return Err(ConfigurationError::InvalidProperty {
                component: component.name.clone(),
                property: property.to_string(),
                message: "no such property".to_string(),
            }
            .into());
        };
        if !value.is_null() && !descriptor.property_type.matches(&value) {
            return Err(ConfigurationError::InvalidProperty {
                component: component.name.clone(),
                property: property.to_string(),
                message: format!("expected {:?}, got {}", descriptor.property_type, value),
            }
            .into());
        }

        let component = self.get_mut(id)?;
        if value.is_null() {
            component.properties.shift_remove(property);
        } else {
            component.properties.insert(property.to_string(), value);
        }
        self.refresh_outputs(id);
        self.notify_changed(id);
        Ok(())
    }

    /// Wire a column into a component.
    pub fn add_input_column(&mut self, id: ComponentId, column: &InputColumn) -> Result<()> {
        let component = self.get(id)?;
        if component.inputs.contains(column) {
            return Ok(());
        }
        if !self.is_known_column(column) {
            return Err(ConfigurationError::UnknownColumn(column.name()).into());
        }
        if let Some(producer) = column.producer() {
            let (graph, _) = self.resolve_requirements();
            if producer == id || graph.descendants(id).contains(&producer) {
                return Err(ConfigurationError::Cycle(component.name.clone()).into());
            }
        }

        self.get_mut(id)?.inputs.push(column.clone());
        self.refresh_outputs(id);
        self.notify_changed(id);
        Ok(())
    }

    pub fn add_input_columns(&mut self, id: ComponentId, columns: &[InputColumn]) -> Result<()> {
        for column in columns {
            self.add_input_column(id, column)?;
        }
        Ok(())
    }

    pub fn remove_input_column(&mut self, id: ComponentId, column: &InputColumn) -> Result<()> {
        self.get_mut(id)?.inputs.retain(|c| c != column);
        self.refresh_outputs(id);
        self.notify_changed(id);
        Ok(())
    }

    /// Set or clear the explicit requirement of a component.
    pub fn set_requirement(
        &mut self,
        id: ComponentId,
        requirement: Option<ComponentRequirement>,
    ) -> Result<()> {
        let component = self.get(id)?;
        if let Some(requirement) = &requirement {
            for outcome in requirement.outcomes() {
                self.check_outcome(outcome)?;
            }
            let (graph, _) = self.resolve_requirements();
            let descendants = graph.descendants(id);
            for filter in requirement.filters() {
                if filter == id || descendants.contains(&filter) {
                    return Err(ConfigurationError::Cycle(component.name.clone()).into());
                }
            }
        }

        self.get_mut(id)?.requirement = requirement;
        self.notify_changed(id);
        Ok(())
    }

    /// The requirement in force for a component: its explicit requirement, or
    /// the default requirement it inherited.
    pub fn requirement(&self, id: ComponentId) -> Option<ComponentRequirement> {
        let (_, requirements) = self.resolve_requirements();
        requirements.get(&id).cloned().flatten()
    }

    /// Set the requirement that components added from now on inherit when
    /// they end up downstream of the filter.
    pub fn set_default_requirement(&mut self, outcome: Option<FilterOutcome>) -> Result<()> {
        if let Some(outcome) = &outcome {
            self.check_outcome(outcome)?;
        }
        self.default_requirement = outcome;
        Ok(())
    }

    pub fn default_requirement(&self) -> Option<&FilterOutcome> {
        self.default_requirement.as_ref()
    }

    /// Columns a component may consume without creating a cycle.
    ///
    /// With `None`, every column in the graph.
    pub fn available_input_columns(&self, id: Option<ComponentId>) -> Vec<InputColumn> {
        let excluded: HashSet<ComponentId> = match id {
            Some(id) => {
                let (graph, _) = self.resolve_requirements();
                let mut excluded = graph.descendants(id);
                excluded.insert(id);
                excluded
            }
            None => HashSet::new(),
        };

        let mut columns = self.source_columns.clone();
        for component in self.components.values() {
            if !excluded.contains(&component.id) {
                columns.extend(component.outputs.iter().cloned());
            }
        }
        columns
    }

    /// Remove a component.
    ///
    /// Components that required one of its outcomes fall back to its own
    /// requirement, consumers of its generated columns are unwired, and a
    /// default requirement on it is cleared.
    pub fn remove_component(&mut self, id: ComponentId) -> Result<()> {
        let fallback = self.requirement(id);
        let removed = self
            .components
            .shift_remove(&id)
            .ok_or_else(|| ConfigurationError::UnknownComponent(id.to_string()))?;

        if self.default_requirement.as_ref().is_some_and(|d| d.filter == id) {
            self.default_requirement = None;
        }

        let mut changed = Vec::new();
        for component in self.components.values_mut() {
            let before = component.inputs.len();
            component.inputs.retain(|c| !removed.outputs.contains(c));
            let mut touched = component.inputs.len() != before;

            if let Some(requirement) = &component.requirement {
                if requirement.references(id) {
                    component.requirement = replace_filter(requirement, id, fallback.clone());
                    touched = true;
                }
            }
            if component.default_requirement.as_ref().is_some_and(|d| d.filter == id) {
                component.default_requirement = None;
            }
            if touched {
                changed.push(component.id);
            }
        }

        debug!(component = %removed.name, id = %id, "removed component");
        for listener in &mut self.listeners {
            listener.on_component_removed(&removed);
        }
        for id in changed {
            self.refresh_outputs(id);
            self.notify_changed(id);
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Validation and freezing
    // ---------------------------------------------------------------------

    pub fn validate(&self) -> Result<()> {
        self.to_analysis_job().map(|_| ())
    }

    pub fn is_configured(&self) -> bool {
        self.validate().is_ok()
    }

    /// Validate the graph and freeze it.
    pub fn to_analysis_job(&self) -> Result<AnalysisJob> {
        let (graph, requirements) = self.resolve_requirements();

        for component in self.components.values() {
            self.check_component(component)?;
            if let Some(Some(requirement)) = requirements.get(&component.id) {
                for outcome in requirement.outcomes() {
                    self.check_outcome(outcome)?;
                }
            }
        }

        let order = graph.topological_order().map_err(|id| {
            let name = self
                .components
                .get(&id)
                .map(|c| c.name.clone())
                .unwrap_or_else(|| id.to_string());
            ConfigurationError::Cycle(name)
        })?;

        let mut snapshots: HashMap<ColumnId, InputColumn> = HashMap::new();
        let source_columns: Vec<InputColumn> = self
            .source_columns
            .iter()
            .map(|c| {
                let snapshot = c.snapshot();
                snapshots.insert(c.id(), snapshot.clone());
                snapshot
            })
            .collect();
        for component in self.components.values() {
            for column in &component.outputs {
                snapshots.insert(column.id(), column.snapshot());
            }
        }
        let frozen = |column: &InputColumn| {
            snapshots
                .get(&column.id())
                .cloned()
                .unwrap_or_else(|| column.snapshot())
        };

        let mut components = Vec::with_capacity(order.len());
        for id in order {
            let component = self.get(id)?;
            let mut configuration = component.configuration();
            configuration.inputs = configuration.inputs.iter().map(frozen).collect();
            components.push(ComponentJob {
                id,
                name: component.name.clone(),
                factory: Arc::clone(&component.factory),
                configuration,
                outputs: component.outputs.iter().map(frozen).collect(),
                requirement: requirements.get(&id).cloned().flatten(),
            });
        }

        info!(job = %self.name, components = components.len(), "analysis job frozen");
        Ok(AnalysisJob {
            name: self.name.clone(),
            datastore: self.datastore.clone(),
            source_columns,
            components,
        })
    }

    /// Release the builder. Jobs already frozen are unaffected.
    pub fn close(mut self) {
        self.listeners.clear();
        debug!(job = %self.name, "job builder closed");
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    fn next_column_id(&mut self) -> ColumnId {
        let id = ColumnId(self.next_column);
        self.next_column += 1;
        id
    }

    fn is_known_column(&self, column: &InputColumn) -> bool {
        self.source_columns.contains(column)
            || self
                .components
                .values()
                .any(|c| c.outputs.contains(column))
    }

    fn notify_changed(&mut self, id: ComponentId) {
        if let Some(component) = self.components.get(&id) {
            for listener in &mut self.listeners {
                listener.on_component_changed(component);
            }
        }
    }

    fn check_outcome(&self, outcome: &FilterOutcome) -> Result<()> {
        let filter = self.get(outcome.filter)?;
        if filter.kind() != ComponentKind::Filter {
            return Err(ConfigurationError::UnknownComponent(format!(
                "{} is not a filter",
                filter.name
            ))
            .into());
        }
        if !filter.descriptor().has_category(&outcome.category) {
            return Err(ConfigurationError::UnknownCategory {
                filter: filter.name.clone(),
                category: outcome.category.clone(),
            }
            .into());
        }
        Ok(())
    }

    fn check_component(&self, component: &ComponentBuilder) -> Result<()> {
        let descriptor = component.descriptor();

        for (name, value) in &component.properties {
            match descriptor.property(name) {
                None => {
                    return Err(ConfigurationError::InvalidProperty {
                        component: component.name.clone(),
                        property: name.clone(),
                        message: "no such property".to_string(),
                    }
                    .into());
                }
                Some(property) if !property.property_type.matches(value) => {
                    return Err(ConfigurationError::InvalidProperty {
                        component: component.name.clone(),
                        property: name.clone(),
                        message: format!("expected {:?}", property.property_type),
                    }
                    .into());
                }
                Some(_) => {}
            }
        }

        for property in &descriptor.properties {
            let configured = component
                .properties
                .get(&property.name)
                .is_some_and(|v| !v.is_null());
            if property.required && !configured && property.default.is_none() {
                return Err(ConfigurationError::MissingProperty {
                    component: component.name.clone(),
                    property: property.name.clone(),
                }
                .into());
            }
        }

        if !descriptor.input.accepts_count(component.inputs.len()) {
            return Err(ConfigurationError::MissingInput {
                component: component.name.clone(),
                expected: descriptor.input.describe_count(),
                found: component.inputs.len(),
            }
            .into());
        }

        for column in &component.inputs {
            if !self.is_known_column(column) {
                return Err(ConfigurationError::UnknownColumn(column.name()).into());
            }
            if !descriptor.input.data_type.accepts(column.data_type()) {
                return Err(ConfigurationError::TypeMismatch {
                    component: component.name.clone(),
                    column: column.name(),
                    expected: descriptor.input.data_type.to_string(),
                    found: column.data_type().to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Recompute a transformer's generated columns after its configuration
    /// changed. Columns keep their identity where position and type still
    /// match; dropped columns are unwired from their consumers.
    fn refresh_outputs(&mut self, id: ComponentId) {
        let Some(component) = self.components.get(&id) else {
            return;
        };
        if component.kind() != ComponentKind::Transformer {
            return;
        }
        let specs = component.factory.output_columns(&component.configuration());
        let existing = component.outputs.clone();

        let mut outputs = Vec::with_capacity(specs.len());
        let mut dropped = Vec::new();
        for (i, spec) in specs.iter().enumerate() {
            match existing.get(i) {
                Some(column) if column.data_type() == spec.data_type => {
                    column.set_name(spec.name.clone());
                    outputs.push(column.clone());
                }
                other => {
                    if let Some(column) = other {
                        dropped.push(column.clone());
                    }
                    let column_id = self.next_column_id();
                    outputs.push(InputColumn::generated(
                        column_id,
                        spec.name.clone(),
                        spec.data_type,
                        id,
                    ));
                }
            }
        }
        dropped.extend(existing.iter().skip(specs.len()).cloned());

        if let Some(component) = self.components.get_mut(&id) {
            component.outputs = outputs;
        }
        if dropped.is_empty() {
            return;
        }

        let affected: Vec<ComponentId> = self
            .components
            .values()
            .filter(|c| c.inputs.iter().any(|i| dropped.contains(i)))
            .map(|c| c.id)
            .collect();
        for consumer in affected {
            if let Some(component) = self.components.get_mut(&consumer) {
                component.inputs.retain(|i| !dropped.contains(i));
            }
            self.refresh_outputs(consumer);
        }
    }

    fn explicit_graph(&self) -> DependencyGraph {
        let mut graph = DependencyGraph::new(self.components.keys().copied());
        for component in self.components.values() {
            for column in &component.inputs {
                if let Some(producer) = column.producer() {
                    graph.add_edge(producer, component.id);
                }
            }
            if let Some(requirement) = &component.requirement {
                for filter in requirement.filters() {
                    graph.add_edge(filter, component.id);
                }
            }
        }
        graph
    }

    /// Effective requirements and the dependency graph including them.
    ///
    /// A component inherits its captured default requirement only if it has
    /// no explicit requirement, is not upstream of the filter, and shares the
    /// filter's lineage. Defaults are resolved in insertion order against the
    /// graph built so far, so resolution never closes a cycle.
    fn resolve_requirements(
        &self,
    ) -> (DependencyGraph, HashMap<ComponentId, Option<ComponentRequirement>>) {
        let mut graph = self.explicit_graph();
        let mut requirements: HashMap<ComponentId, Option<ComponentRequirement>> = self
            .components
            .values()
            .map(|c| (c.id, c.requirement.clone()))
            .collect();

        for component in self.components.values() {
            if component.requirement.is_some() {
                continue;
            }
            let Some(outcome) = &component.default_requirement else {
                continue;
            };
            let filter = outcome.filter;
            if filter == component.id
                || !self.components.contains_key(&filter)
                || graph.is_ancestor(component.id, filter)
            {
                continue;
            }
            if self.shares_lineage(&graph, component, filter) {
                graph.add_edge(filter, component.id);
                requirements.insert(
                    component.id,
                    Some(ComponentRequirement::Outcome(outcome.clone())),
                );
            }
        }
        (graph, requirements)
    }

    fn shares_lineage(
        &self,
        graph: &DependencyGraph,
        component: &ComponentBuilder,
        filter: ComponentId,
    ) -> bool {
        if graph.descendants(filter).contains(&component.id) {
            return true;
        }
        let Some(filter_builder) = self.components.get(&filter) else {
            return false;
        };

        let mut lineage: HashSet<&InputColumn> = filter_builder.inputs.iter().collect();
        for ancestor in graph.ancestors(filter) {
            if let Some(upstream) = self.components.get(&ancestor) {
                lineage.extend(upstream.inputs.iter());
                lineage.extend(upstream.outputs.iter());
            }
        }
        component.inputs.iter().any(|c| lineage.contains(c))
    }
}

fn replace_filter(
    requirement: &ComponentRequirement,
    removed: ComponentId,
    fallback: Option<ComponentRequirement>,
) -> Option<ComponentRequirement> {
    match requirement {
        ComponentRequirement::Outcome(_) => fallback,
        ComponentRequirement::Any => Some(ComponentRequirement::Any),
        ComponentRequirement::Compound(list) => {
            let rest: Vec<FilterOutcome> =
                list.iter().filter(|o| o.filter != removed).cloned().collect();
            match rest.len() {
                0 => fallback,
                1 => rest.into_iter().next().map(ComponentRequirement::Outcome),
                _ => Some(ComponentRequirement::Compound(rest)),
            }
        }
    }
}
