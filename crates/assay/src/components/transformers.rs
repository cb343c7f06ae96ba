//! Column-deriving transformers.

use once_cell::sync::Lazy;
use regex::Regex;

use super::{required_inputs, single_input};
use crate::descriptor::{
    Component, ComponentConfiguration, ComponentDescriptor, ComponentFactory, InputSpec,
    OutputColumnSpec, OutputRowCollector, PropertyDescriptor, PropertyType, Transformer,
};
use crate::error::{ConfigurationError, Result};
use crate::input::InputRow;
use crate::schema::{DataType, InputColumn, Value};

static NAME_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"FIRSTNAME|LASTNAME|MIDDLENAME|TITULATION").unwrap());

const NAME_PATTERNS: &str = "Name patterns";
const NUMBER_OF_TOKENS: &str = "Number of tokens";
const DELIMITERS: &str = "Delimiters";
const SEPARATOR: &str = "Separator";

const DEFAULT_NAME_PATTERNS: [&str; 6] = [
    "FIRSTNAME LASTNAME",
    "TITULATION. FIRSTNAME LASTNAME",
    "TITULATION FIRSTNAME LASTNAME",
    "FIRSTNAME MIDDLENAME LASTNAME",
    "LASTNAME, FIRSTNAME",
    "LASTNAME, FIRSTNAME MIDDLENAME",
];

const NAME_OUTPUTS: [&str; 4] = ["Firstname", "Lastname", "Middlename", "Titulation"];

fn text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// A name pattern compiled to a regex, with the output slot of each group.
struct NamePattern {
    regex: Regex,
    slots: Vec<usize>,
}

impl NamePattern {
    fn compile(pattern: &str) -> Result<Self> {
        let mut expr = String::from("^");
        let mut slots = Vec::new();
        let mut last = 0;
        for token in NAME_TOKEN.find_iter(pattern) {
            push_literal(&mut expr, &pattern[last..token.start()]);
            expr.push_str(r"([^\s,.]+)");
            slots.push(match token.as_str() {
                "FIRSTNAME" => 0,
                "LASTNAME" => 1,
                "MIDDLENAME" => 2,
                _ => 3,
            });
            last = token.end();
        }
        push_literal(&mut expr, &pattern[last..]);
        expr.push('$');

        Ok(Self {
            regex: Regex::new(&expr)?,
            slots,
        })
    }

    fn apply(&self, name: &str) -> Option<Vec<Value>> {
        let captures = self.regex.captures(name)?;
        let mut parts = vec![Value::Null; NAME_OUTPUTS.len()];
        for (group, slot) in self.slots.iter().enumerate() {
            if let Some(m) = captures.get(group + 1) {
                parts[*slot] = Value::from(m.as_str());
            }
        }
        Some(parts)
    }
}

fn push_literal(expr: &mut String, literal: &str) {
    let mut in_space = false;
    for c in literal.chars() {
        if c.is_whitespace() {
            if !in_space {
                expr.push_str(r"\s+");
            }
            in_space = true;
        } else {
            expr.push_str(&regex::escape(&c.to_string()));
            in_space = false;
        }
    }
}

/// Splits a full name into first, last and middle name and title, using
/// the first pattern that matches the whole value.
pub struct NameStandardizer {
    column: InputColumn,
    patterns: Vec<NamePattern>,
}

impl NameStandardizer {
    pub fn new(column: InputColumn, patterns: &[String]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| NamePattern::compile(p))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { column, patterns })
    }
}

impl Transformer for NameStandardizer {
    fn transform(&self, row: &InputRow, out: &mut OutputRowCollector) -> Result<()> {
        let parts = text(row.value(&self.column)).and_then(|name| {
            let name = name.trim();
            self.patterns.iter().find_map(|p| p.apply(name))
        });
        out.emit(parts.unwrap_or_else(|| vec![Value::Null; NAME_OUTPUTS.len()]))
    }
}

pub struct NameStandardizerFactory {
    descriptor: ComponentDescriptor,
}

impl NameStandardizerFactory {
    pub fn new() -> Self {
        Self {
            descriptor: ComponentDescriptor::transformer("Name standardizer")
                .with_description("Identifies the parts of a full name")
                .with_input(InputSpec::exactly(DataType::String, 1))
                .with_property(
                    PropertyDescriptor::optional(NAME_PATTERNS, PropertyType::StringList)
                        .with_default(DEFAULT_NAME_PATTERNS.to_vec()),
                )
                .concurrent(true),
        }
    }
}

impl Default for NameStandardizerFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentFactory for NameStandardizerFactory {
    fn descriptor(&self) -> &ComponentDescriptor {
        &self.descriptor
    }

    fn output_columns(&self, _config: &ComponentConfiguration) -> Vec<OutputColumnSpec> {
        NAME_OUTPUTS
            .iter()
            .map(|name| OutputColumnSpec::new(*name, DataType::String))
            .collect()
    }

    fn create(&self, config: &ComponentConfiguration) -> Result<Component> {
        let column = single_input(&self.descriptor.name, config)?;
        let standardizer = NameStandardizer::new(column, &config.string_list(NAME_PATTERNS))?;
        Ok(Component::Transformer(Box::new(standardizer)))
    }
}

fn split_tokens<'a>(value: &'a str, delimiters: &'a str) -> impl Iterator<Item = &'a str> {
    value
        .split(move |c: char| delimiters.contains(c))
        .filter(|t| !t.is_empty())
}

/// Splits a value into a fixed number of token columns.
pub struct Tokenizer {
    column: InputColumn,
    count: usize,
    delimiters: String,
}

impl Tokenizer {
    pub fn new(column: InputColumn, count: usize, delimiters: impl Into<String>) -> Self {
        Self {
            column,
            count,
            delimiters: delimiters.into(),
        }
    }
}

impl Transformer for Tokenizer {
    fn transform(&self, row: &InputRow, out: &mut OutputRowCollector) -> Result<()> {
        let mut values = vec![Value::Null; self.count];
        if let Some(text) = text(row.value(&self.column)) {
            for (slot, token) in values.iter_mut().zip(split_tokens(&text, &self.delimiters)) {
                *slot = Value::from(token);
            }
        }
        out.emit(values)
    }
}

pub struct TokenizerFactory {
    descriptor: ComponentDescriptor,
}

impl TokenizerFactory {
    pub fn new() -> Self {
        Self {
            descriptor: ComponentDescriptor::transformer("Tokenizer")
                .with_description("Splits a value into a fixed number of tokens")
                .with_input(InputSpec::exactly(DataType::String, 1))
                .with_property(
                    PropertyDescriptor::optional(NUMBER_OF_TOKENS, PropertyType::Integer)
                        .with_default(2),
                )
                .with_property(
                    PropertyDescriptor::optional(DELIMITERS, PropertyType::String).with_default(" "),
                )
                .concurrent(true),
        }
    }

    fn token_count(&self, config: &ComponentConfiguration) -> Result<usize> {
        let count = config.integer(NUMBER_OF_TOKENS).unwrap_or(2);
        if count < 1 {
            return Err(ConfigurationError::InvalidProperty {
                component: self.descriptor.name.clone(),
                property: NUMBER_OF_TOKENS.to_string(),
                message: format!("must be at least 1, got {}", count),
            }
            .into());
        }
        Ok(count as usize)
    }
}

impl Default for TokenizerFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentFactory for TokenizerFactory {
    fn descriptor(&self) -> &ComponentDescriptor {
        &self.descriptor
    }

    fn output_columns(&self, config: &ComponentConfiguration) -> Vec<OutputColumnSpec> {
        let prefix = config
            .inputs
            .first()
            .map(|c| c.name())
            .unwrap_or_else(|| "token".to_string());
        let count = self.token_count(config).unwrap_or(0);
        (1..=count)
            .map(|i| OutputColumnSpec::new(format!("{} (token {})", prefix, i), DataType::String))
            .collect()
    }

    fn create(&self, config: &ComponentConfiguration) -> Result<Component> {
        let column = single_input(&self.descriptor.name, config)?;
        let count = self.token_count(config)?;
        let delimiters = config.string(DELIMITERS).unwrap_or(" ");
        Ok(Component::Transformer(Box::new(Tokenizer::new(
            column, count, delimiters,
        ))))
    }
}

/// Emits one row per token of the input value.
pub struct TokenSplitter {
    column: InputColumn,
    delimiters: String,
}

impl TokenSplitter {
    pub fn new(column: InputColumn, delimiters: impl Into<String>) -> Self {
        Self {
            column,
            delimiters: delimiters.into(),
        }
    }
}

impl Transformer for TokenSplitter {
    fn transform(&self, row: &InputRow, out: &mut OutputRowCollector) -> Result<()> {
        let Some(text) = text(row.value(&self.column)) else {
            return Ok(());
        };
        for token in split_tokens(&text, &self.delimiters) {
            out.emit(vec![Value::from(token)])?;
        }
        Ok(())
    }
}

pub struct TokenSplitterFactory {
    descriptor: ComponentDescriptor,
}

impl TokenSplitterFactory {
    pub fn new() -> Self {
        Self {
            descriptor: ComponentDescriptor::transformer("Token splitter")
                .with_description("Emits a row for every token of a value")
                .with_input(InputSpec::exactly(DataType::String, 1))
                .with_property(
                    PropertyDescriptor::optional(DELIMITERS, PropertyType::String).with_default(" "),
                )
                .concurrent(true)
                .multi_row(),
        }
    }
}

impl Default for TokenSplitterFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentFactory for TokenSplitterFactory {
    fn descriptor(&self) -> &ComponentDescriptor {
        &self.descriptor
    }

    fn output_columns(&self, _config: &ComponentConfiguration) -> Vec<OutputColumnSpec> {
        vec![OutputColumnSpec::new("Token", DataType::String)]
    }

    fn create(&self, config: &ComponentConfiguration) -> Result<Component> {
        let column = single_input(&self.descriptor.name, config)?;
        let delimiters = config.string(DELIMITERS).unwrap_or(" ");
        Ok(Component::Transformer(Box::new(TokenSplitter::new(
            column, delimiters,
        ))))
    }
}

/// Joins the non-null input values with a separator.
pub struct Concatenator {
    columns: Vec<InputColumn>,
    separator: String,
}

impl Concatenator {
    pub fn new(columns: Vec<InputColumn>, separator: impl Into<String>) -> Self {
        Self {
            columns,
            separator: separator.into(),
        }
    }
}

impl Transformer for Concatenator {
    fn transform(&self, row: &InputRow, out: &mut OutputRowCollector) -> Result<()> {
        let parts: Vec<String> = self
            .columns
            .iter()
            .filter_map(|c| text(row.value(c)))
            .collect();
        let value = if parts.is_empty() {
            Value::Null
        } else {
            Value::String(parts.join(&self.separator))
        };
        out.emit(vec![value])
    }
}

pub struct ConcatenatorFactory {
    descriptor: ComponentDescriptor,
}

impl ConcatenatorFactory {
    pub fn new() -> Self {
        Self {
            descriptor: ComponentDescriptor::transformer("Concatenator")
                .with_description("Concatenates the input values")
                .with_input(InputSpec::any(DataType::Any))
                .with_property(
                    PropertyDescriptor::optional(SEPARATOR, PropertyType::String).with_default(""),
                )
                .concurrent(true),
        }
    }
}

impl Default for ConcatenatorFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentFactory for ConcatenatorFactory {
    fn descriptor(&self) -> &ComponentDescriptor {
        &self.descriptor
    }

    fn output_columns(&self, _config: &ComponentConfiguration) -> Vec<OutputColumnSpec> {
        vec![OutputColumnSpec::new("Concat", DataType::String)]
    }

    fn create(&self, config: &ComponentConfiguration) -> Result<Component> {
        let columns = required_inputs(&self.descriptor.name, config)?;
        let separator = config.string(SEPARATOR).unwrap_or("");
        Ok(Component::Transformer(Box::new(Concatenator::new(
            columns, separator,
        ))))
    }
}
