//! Built-in components.
//!
//! A small catalog covering each component kind: null and equality filters,
//! name, token and concatenation transformers, and value distribution,
//! completeness and row collecting analyzers.

mod analyzers;
mod filters;
mod transformers;

pub use analyzers::{
    CompletenessAnalyzer, CompletenessFactory, RowCollectorAnalyzer, RowCollectorFactory,
    ValueDistributionAnalyzer, ValueDistributionFactory, ValueDistributionReducer, value_counts,
};
pub use filters::{EqualsFilter, EqualsFactory, NullCheckFactory, NullCheckFilter};
pub use transformers::{
    Concatenator, ConcatenatorFactory, NameStandardizer, NameStandardizerFactory, TokenSplitter,
    TokenSplitterFactory, Tokenizer, TokenizerFactory,
};

use crate::descriptor::{ComponentConfiguration, ComponentRegistry};
use crate::error::{ConfigurationError, Result};
use crate::schema::InputColumn;

/// Register every built-in component.
pub fn register_builtins(registry: &mut ComponentRegistry) {
    registry
        .register(NullCheckFactory::new())
        .register(EqualsFactory::new())
        .register(NameStandardizerFactory::new())
        .register(TokenizerFactory::new())
        .register(TokenSplitterFactory::new())
        .register(ConcatenatorFactory::new())
        .register(ValueDistributionFactory::new())
        .register(CompletenessFactory::new())
        .register(RowCollectorFactory::new());
}

/// The first input column, for components that take exactly one.
fn single_input(component: &str, config: &ComponentConfiguration) -> Result<InputColumn> {
    config.inputs.first().cloned().ok_or_else(|| {
        ConfigurationError::MissingInput {
            component: component.to_string(),
            expected: "1".to_string(),
            found: 0,
        }
        .into()
    })
}

fn required_inputs(component: &str, config: &ComponentConfiguration) -> Result<Vec<InputColumn>> {
    if config.inputs.is_empty() {
        return Err(ConfigurationError::MissingInput {
            component: component.to_string(),
            expected: "at least 1".to_string(),
            found: 0,
        }
        .into());
    }
    Ok(config.inputs.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ComponentKind;

    #[test]
    fn test_builtins_cover_every_kind() {
        let registry = ComponentRegistry::with_builtins();
        assert_eq!(registry.len(), 9);
        assert_eq!(registry.descriptors_of(ComponentKind::Filter).count(), 2);
        assert_eq!(registry.descriptors_of(ComponentKind::Transformer).count(), 4);
        assert_eq!(registry.descriptors_of(ComponentKind::Analyzer).count(), 3);
        assert!(registry.get("Token splitter").unwrap().descriptor().multi_row);
    }

    #[test]
    fn test_every_builtin_analyzer_is_partitionable() {
        let registry = ComponentRegistry::with_builtins();
        for descriptor in registry.descriptors_of(ComponentKind::Analyzer) {
            let factory = registry.get(&descriptor.name).unwrap();
            assert!(factory.reducer().is_some(), "{} has no reducer", descriptor.name);
        }
    }
}
