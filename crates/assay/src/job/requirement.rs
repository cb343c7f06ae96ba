//! Filter outcomes and the requirements that gate components on them.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::ComponentId;

/// One outcome category of one filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterOutcome {
    pub filter: ComponentId,
    pub category: String,
}

impl FilterOutcome {
    pub fn new(filter: ComponentId, category: impl Into<String>) -> Self {
        Self {
            filter,
            category: category.into(),
        }
    }
}

impl fmt::Display for FilterOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.filter, self.category)
    }
}

/// Condition under which a component processes a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "outcomes", rename_all = "snake_case")]
pub enum ComponentRequirement {
    /// The filter categorized the row into this category.
    Outcome(FilterOutcome),
    /// Always satisfied, regardless of any gating upstream.
    Any,
    /// Satisfied when at least one of the outcomes is.
    Compound(Vec<FilterOutcome>),
}

impl ComponentRequirement {
    pub fn outcome(filter: ComponentId, category: impl Into<String>) -> Self {
        ComponentRequirement::Outcome(FilterOutcome::new(filter, category))
    }

    pub fn is_satisfied(&self, outcomes: &FilterOutcomes) -> bool {
        match self {
            ComponentRequirement::Outcome(outcome) => outcomes.matches(outcome),
            ComponentRequirement::Any => true,
            ComponentRequirement::Compound(list) => list.iter().any(|o| outcomes.matches(o)),
        }
    }

    /// The outcomes this requirement refers to.
    pub fn outcomes(&self) -> &[FilterOutcome] {
        match self {
            ComponentRequirement::Outcome(outcome) => std::slice::from_ref(outcome),
            ComponentRequirement::Any => &[],
            ComponentRequirement::Compound(list) => list,
        }
    }

    /// Filters this requirement depends on.
    pub fn filters(&self) -> Vec<ComponentId> {
        let mut filters: Vec<ComponentId> = self.outcomes().iter().map(|o| o.filter).collect();
        filters.dedup();
        filters
    }

    pub fn references(&self, filter: ComponentId) -> bool {
        self.outcomes().iter().any(|o| o.filter == filter)
    }
}

impl From<FilterOutcome> for ComponentRequirement {
    fn from(outcome: FilterOutcome) -> Self {
        ComponentRequirement::Outcome(outcome)
    }
}

impl fmt::Display for ComponentRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentRequirement::Outcome(outcome) => write!(f, "{}", outcome),
            ComponentRequirement::Any => f.write_str("*"),
            ComponentRequirement::Compound(list) => {
                let parts: Vec<String> = list.iter().map(|o| o.to_string()).collect();
                f.write_str(&parts.join(" OR "))
            }
        }
    }
}

/// Categories assigned to one row by the filters that have seen it.
///
/// A filter categorizes a row at most once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterOutcomes {
    categories: HashMap<ComponentId, String>,
}

impl FilterOutcomes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a category. Returns false if the filter already categorized the row.
    pub fn record(&mut self, filter: ComponentId, category: impl Into<String>) -> bool {
        if self.categories.contains_key(&filter) {
            return false;
        }
        self.categories.insert(filter, category.into());
        true
    }

    pub fn category(&self, filter: ComponentId) -> Option<&str> {
        self.categories.get(&filter).map(String::as_str)
    }

    pub fn matches(&self, outcome: &FilterOutcome) -> bool {
        self.category(outcome.filter) == Some(outcome.category.as_str())
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}
