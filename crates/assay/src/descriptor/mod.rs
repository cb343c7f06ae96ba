//! Component descriptors, component contracts and the typed registry.
//!
//! Every component implementation describes itself with a
//! [`ComponentDescriptor`] and registers a [`ComponentFactory`] in a
//! [`ComponentRegistry`]. The builder validates configurations against the
//! descriptor; the runner instantiates components through the factory.

mod component;
mod registry;

pub use component::{
    Analyzer, Component, ComponentContext, ComponentFactory, Filter, OutputColumnSpec,
    OutputRowCollector, Transformer,
};
pub use registry::ComponentRegistry;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::schema::{DataType, InputColumn};

/// The three kinds of row-processing component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    /// Categorizes rows into named outcomes.
    Filter,
    /// Derives new columns, possibly emitting several rows per input row.
    Transformer,
    /// Accumulates rows into a result.
    Analyzer,
}

/// Type of a configurable property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    String,
    Integer,
    Float,
    Boolean,
    StringList,
}

impl PropertyType {
    pub fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            PropertyType::String => value.is_string(),
            PropertyType::Integer => value.is_i64() || value.is_u64(),
            PropertyType::Float => value.is_number(),
            PropertyType::Boolean => value.is_boolean(),
            PropertyType::StringList => value
                .as_array()
                .is_some_and(|items| items.iter().all(|i| i.is_string())),
        }
    }
}

/// A configurable property of a component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDescriptor {
    pub name: String,
    pub property_type: PropertyType,
    pub required: bool,
    pub default: Option<serde_json::Value>,
    pub description: String,
}

impl PropertyDescriptor {
    pub fn required(name: impl Into<String>, property_type: PropertyType) -> Self {
        Self {
            name: name.into(),
            property_type,
            required: true,
            default: None,
            description: String::new(),
        }
    }

    pub fn optional(name: impl Into<String>, property_type: PropertyType) -> Self {
        Self {
            required: false,
            ..Self::required(name, property_type)
        }
    }

    pub fn with_default(mut self, default: impl Into<serde_json::Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// How many input columns a component takes, and of what type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSpec {
    pub data_type: DataType,
    pub min: usize,
    pub max: Option<usize>,
}

impl InputSpec {
    pub fn any(data_type: DataType) -> Self {
        Self {
            data_type,
            min: 1,
            max: None,
        }
    }

    pub fn exactly(data_type: DataType, count: usize) -> Self {
        Self {
            data_type,
            min: count,
            max: Some(count),
        }
    }

    pub fn accepts_count(&self, count: usize) -> bool {
        count >= self.min && self.max.is_none_or(|max| count <= max)
    }

    pub fn describe_count(&self) -> String {
        match self.max {
            Some(max) if max == self.min => max.to_string(),
            Some(max) => format!("{}..={}", self.min, max),
            None => format!("at least {}", self.min),
        }
    }
}

/// Static description of a component implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentDescriptor {
    pub name: String,
    pub kind: ComponentKind,
    pub description: String,
    pub properties: Vec<PropertyDescriptor>,
    pub input: InputSpec,
    /// Safe to invoke from several threads at once.
    pub concurrent: bool,
    /// Outcome categories (filters only).
    pub categories: Vec<String>,
    /// May emit zero or more rows per input row (transformers only).
    pub multi_row: bool,
}

impl ComponentDescriptor {
    fn new(name: impl Into<String>, kind: ComponentKind) -> Self {
        Self {
            name: name.into(),
            kind,
            description: String::new(),
            properties: Vec::new(),
            input: InputSpec::any(DataType::Any),
            concurrent: false,
            categories: Vec::new(),
            multi_row: false,
        }
    }

    pub fn filter<I, S>(name: impl Into<String>, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut descriptor = Self::new(name, ComponentKind::Filter);
        descriptor.categories = categories.into_iter().map(Into::into).collect();
        descriptor
    }

    pub fn transformer(name: impl Into<String>) -> Self {
        Self::new(name, ComponentKind::Transformer)
    }

    pub fn analyzer(name: impl Into<String>) -> Self {
        Self::new(name, ComponentKind::Analyzer)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_property(mut self, property: PropertyDescriptor) -> Self {
        self.properties.push(property);
        self
    }

    pub fn with_input(mut self, input: InputSpec) -> Self {
        self.input = input;
        self
    }

    pub fn concurrent(mut self, concurrent: bool) -> Self {
        self.concurrent = concurrent;
        self
    }

    pub fn multi_row(mut self) -> Self {
        self.multi_row = true;
        self
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn has_category(&self, category: &str) -> bool {
        self.categories.iter().any(|c| c == category)
    }
}

/// Configured properties and input columns of one component.
#[derive(Debug, Clone, Default)]
pub struct ComponentConfiguration {
    pub properties: IndexMap<String, serde_json::Value>,
    pub inputs: Vec<InputColumn>,
}

impl ComponentConfiguration {
    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.properties.get(name).filter(|v| !v.is_null())
    }

    pub fn string(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.as_str())
    }

    pub fn integer(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(|v| v.as_i64())
    }

    pub fn float(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(|v| v.as_f64())
    }

    pub fn boolean(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(|v| v.as_bool())
    }

    pub fn string_list(&self, name: &str) -> Vec<String> {
        self.get(name)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Fill unset properties from descriptor defaults.
    pub fn with_defaults(mut self, descriptor: &ComponentDescriptor) -> Self {
        for property in &descriptor.properties {
            if let Some(default) = &property.default {
                if self.get(&property.name).is_none() {
                    self.properties.insert(property.name.clone(), default.clone());
                }
            }
        }
        self
    }
}
