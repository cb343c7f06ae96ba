//! Error types for the Assay engine.

use std::path::PathBuf;
use thiserror::Error;

use crate::input::RowId;

/// Errors that prevent a job graph from being frozen into an executable job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// A required property has no value and no default.
    #[error("Component '{component}' is missing required property '{property}'")]
    MissingProperty { component: String, property: String },

    /// A property value does not have the declared type.
    #[error("Component '{component}' has an invalid value for property '{property}': {message}")]
    InvalidProperty {
        component: String,
        property: String,
        message: String,
    },

    /// The component has too few or too many input columns.
    #[error("Component '{component}' expects {expected} input column(s), found {found}")]
    MissingInput {
        component: String,
        expected: String,
        found: usize,
    },

    /// An input column has a data type the component does not accept.
    #[error("Component '{component}' cannot consume column '{column}' of type {found}, expected {expected}")]
    TypeMismatch {
        component: String,
        column: String,
        expected: String,
        found: String,
    },

    /// A column is referenced that no source or component provides.
    #[error("Unknown column '{0}'")]
    UnknownColumn(String),

    /// A component name or id could not be resolved.
    #[error("Unknown component '{0}'")]
    UnknownComponent(String),

    /// A requirement refers to a category the filter does not declare.
    #[error("Filter '{filter}' has no outcome category '{category}'")]
    UnknownCategory { filter: String, category: String },

    /// The wiring would introduce a dependency cycle.
    #[error("Dependency cycle detected involving component '{0}'")]
    Cycle(String),

    /// At least one analyzer has no result reducer.
    #[error("Job cannot be partitioned: analyzer '{0}' has no result reducer")]
    NotPartitionable(String),
}

/// Main error type for Assay operations.
#[derive(Debug, Error)]
pub enum AssayError {
    /// The job graph is invalid.
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// A component failed while processing a row or during its lifecycle.
    #[error("Component '{component}' failed{}: {message}", row_suffix(.row_id))]
    Component {
        component: String,
        row_id: Option<RowId>,
        message: String,
    },

    /// The overflow storage layer failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Error from the embedded SQLite store.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Error reading or accessing a file.
    #[error("IO error for '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Error from the CSV library.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Empty file or no data to read.
    #[error("Empty data: {0}")]
    EmptyData(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Regex compilation error.
    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    /// Results of one analyzer could not be merged.
    #[error("Result shape mismatch: {0}")]
    ResultShape(String),

    /// The execution machinery itself failed (worker threads, coordinator).
    #[error("Execution error: {0}")]
    Execution(String),

    /// The execution was cancelled.
    #[error("Execution cancelled")]
    Cancelled,
}

fn row_suffix(row_id: &Option<RowId>) -> String {
    match row_id {
        Some(id) => format!(" on row {}", id),
        None => String::new(),
    }
}

impl AssayError {
    /// Build a component runtime error.
    pub fn component(component: impl Into<String>, message: impl Into<String>) -> Self {
        AssayError::Component {
            component: component.into(),
            row_id: None,
            message: message.into(),
        }
    }

    /// Storage, I/O and execution machinery failures end an execution since
    /// its results can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AssayError::Storage(_)
                | AssayError::Sqlite(_)
                | AssayError::Io { .. }
                | AssayError::Execution(_)
        )
    }
}

/// Result type alias for Assay operations.
pub type Result<T> = std::result::Result<T, AssayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_error_mentions_row() {
        let err = AssayError::Component {
            component: "Tokenizer".to_string(),
            row_id: Some(RowId::physical(7)),
            message: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "Component 'Tokenizer' failed on row 7: boom");

        let err = AssayError::component("Tokenizer", "boom");
        assert_eq!(err.to_string(), "Component 'Tokenizer' failed: boom");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(AssayError::Storage("disk full".to_string()).is_fatal());
        assert!(!AssayError::component("x", "y").is_fatal());
        assert!(!AssayError::Cancelled.is_fatal());
    }
}
