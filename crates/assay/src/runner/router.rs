//! Per-row eligibility of components.

use crate::job::{AnalysisJob, ComponentRequirement, FilterOutcomes};

struct Route {
    explicit: Option<ComponentRequirement>,
    /// Requirements of the components feeding this one.
    inherited: Vec<ComponentRequirement>,
}

/// Decides, from the outcomes recorded so far for a row, which components
/// process it.
///
/// Routes are resolved once per job and indexed by execution position, so
/// evaluation only reads the row's outcomes and never blocks.
pub struct RequirementRouter {
    routes: Vec<Route>,
}

impl RequirementRouter {
    pub fn new(job: &AnalysisJob) -> Self {
        let routes = job
            .components()
            .iter()
            .map(|component| Route {
                explicit: component.requirement().cloned(),
                inherited: job.source_requirements(component.id()),
            })
            .collect();
        Self { routes }
    }

    /// Whether the component at `position` runs for a row with `outcomes`.
    ///
    /// An explicit `Any` requirement always passes. Otherwise the explicit
    /// requirement, if set, must hold, and when the component's inputs come
    /// from gated components at least one of their requirements must hold.
    pub fn is_eligible(&self, position: usize, outcomes: &FilterOutcomes) -> bool {
        let Some(route) = self.routes.get(position) else {
            return false;
        };
        match &route.explicit {
            Some(ComponentRequirement::Any) => true,
            Some(requirement) => {
                requirement.is_satisfied(outcomes) && inputs_available(&route.inherited, outcomes)
            }
            None => inputs_available(&route.inherited, outcomes),
        }
    }
}

fn inputs_available(inherited: &[ComponentRequirement], outcomes: &FilterOutcomes) -> bool {
    inherited.is_empty() || inherited.iter().any(|r| r.is_satisfied(outcomes))
}
