pub mod plan;
pub mod provisioner;
pub mod types;

pub use plan::include_orphans;
pub use provisioner::Provisioner;
pub use types::{
    Action, ApplyReport, DestroyOptions, DestroyReport, Plan, PlanStep, ProvisionError, ProvisionResult,
    ResolvedResource, ResolvedState, ResourceProvider,
};
