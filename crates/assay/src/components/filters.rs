//! Row filters.

use std::collections::HashSet;

use super::{required_inputs, single_input};
use crate::descriptor::{
    Component, ComponentConfiguration, ComponentDescriptor, ComponentFactory, Filter, InputSpec,
    PropertyDescriptor, PropertyType,
};
use crate::error::{ConfigurationError, Result};
use crate::input::InputRow;
use crate::schema::{DataType, InputColumn, Value};

const NOT_NULL: &str = "NOT_NULL";
const NULL: &str = "NULL";
const VALID: &str = "VALID";
const INVALID: &str = "INVALID";

const EMPTY_AS_NULL: &str = "Consider empty string as null";
const VALUES: &str = "Values";

/// NOT_NULL when every input carries a value, NULL otherwise.
pub struct NullCheckFilter {
    columns: Vec<InputColumn>,
    empty_as_null: bool,
}

impl NullCheckFilter {
    pub fn new(columns: Vec<InputColumn>, empty_as_null: bool) -> Self {
        Self {
            columns,
            empty_as_null,
        }
    }

    fn is_null(&self, value: &Value) -> bool {
        match value {
            Value::Null => true,
            Value::String(s) => self.empty_as_null && s.is_empty(),
            _ => false,
        }
    }
}

impl Filter for NullCheckFilter {
    fn categorize(&self, row: &InputRow) -> Result<String> {
        let any_null = self.columns.iter().any(|c| self.is_null(row.value(c)));
        Ok(if any_null { NULL } else { NOT_NULL }.to_string())
    }
}

pub struct NullCheckFactory {
    descriptor: ComponentDescriptor,
}

impl NullCheckFactory {
    pub fn new() -> Self {
        Self {
            descriptor: ComponentDescriptor::filter("Null check", [NOT_NULL, NULL])
                .with_description("Checks whether the input columns hold values")
                .with_input(InputSpec::any(DataType::Any))
                .with_property(
                    PropertyDescriptor::optional(EMPTY_AS_NULL, PropertyType::Boolean)
                        .with_default(false),
                )
                .concurrent(true),
        }
    }
}

impl Default for NullCheckFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentFactory for NullCheckFactory {
    fn descriptor(&self) -> &ComponentDescriptor {
        &self.descriptor
    }

    fn create(&self, config: &ComponentConfiguration) -> Result<Component> {
        let columns = required_inputs(&self.descriptor.name, config)?;
        let empty_as_null = config.boolean(EMPTY_AS_NULL).unwrap_or(false);
        Ok(Component::Filter(Box::new(NullCheckFilter::new(
            columns,
            empty_as_null,
        ))))
    }
}

/// VALID when the input, rendered as text, is one of the configured values.
pub struct EqualsFilter {
    column: InputColumn,
    values: HashSet<String>,
}

impl EqualsFilter {
    pub fn new(column: InputColumn, values: impl IntoIterator<Item = String>) -> Self {
        Self {
            column,
            values: values.into_iter().collect(),
        }
    }
}

impl Filter for EqualsFilter {
    fn categorize(&self, row: &InputRow) -> Result<String> {
        let valid = match row.value(&self.column) {
            Value::Null => false,
            Value::String(s) => self.values.contains(s),
            other => self.values.contains(&other.to_string()),
        };
        Ok(if valid { VALID } else { INVALID }.to_string())
    }
}

pub struct EqualsFactory {
    descriptor: ComponentDescriptor,
}

impl EqualsFactory {
    pub fn new() -> Self {
        Self {
            descriptor: ComponentDescriptor::filter("Equals", [VALID, INVALID])
                .with_description("Compares a value against a list of accepted values")
                .with_input(InputSpec::exactly(DataType::Any, 1))
                .with_property(PropertyDescriptor::required(VALUES, PropertyType::StringList))
                .concurrent(true),
        }
    }
}

impl Default for EqualsFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentFactory for EqualsFactory {
    fn descriptor(&self) -> &ComponentDescriptor {
        &self.descriptor
    }

    fn create(&self, config: &ComponentConfiguration) -> Result<Component> {
        let column = single_input(&self.descriptor.name, config)?;
        if config.get(VALUES).is_none() {
            return Err(ConfigurationError::MissingProperty {
                component: self.descriptor.name.clone(),
                property: VALUES.to_string(),
            }
            .into());
        }
        Ok(Component::Filter(Box::new(EqualsFilter::new(
            column,
            config.string_list(VALUES),
        ))))
    }
}
