//! Job graphs: building, validating and freezing.

mod analysis_job;
mod builder;
mod graph;
mod requirement;

pub use analysis_job::{AnalysisJob, ComponentJob};
pub use builder::{AnalysisJobBuilder, ComponentBuilder, JobChangeListener};
pub use graph::DependencyGraph;
pub use requirement::{ComponentRequirement, FilterOutcome, FilterOutcomes};

use std::fmt;

use serde::{Deserialize, Serialize};

/// Index of a component within its job builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentId(pub usize);

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
