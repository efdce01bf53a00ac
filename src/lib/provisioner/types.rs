use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    graph::types::{GraphError, Resource, ResourceConfig, ResourceKind},
    runtime::types::{RuntimeError, RuntimeResult},
};

/// A resource after provisioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedResource {
    pub name: String,
    pub kind: ResourceKind,
    /// Provider-assigned identifier.
    pub id: String,
    pub outputs: BTreeMap<String, String>,
    pub config: ResourceConfig,
    pub depends_on: BTreeSet<String>,
    /// Identifiers of the upstream resources this one was applied with.
    pub inputs: BTreeMap<String, String>,
}

impl ResolvedResource {
    pub fn output(&self, key: &str) -> Option<&str> {
        self.outputs.get(key).map(String::as_str)
    }
}

/// Snapshot of everything the provisioner has created, passed into and returned
/// from every provisioner call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedState {
    pub resources: BTreeMap<String, ResolvedResource>,
    /// Replaced resources still waiting to be deleted.
    #[serde(default)]
    pub retired: Vec<ResolvedResource>,
    /// Superseded revisions kept after a replacement, oldest first.
    #[serde(default)]
    pub revisions: Vec<ResolvedResource>,
}

impl ResolvedState {
    pub fn get(&self, name: &str) -> Option<&ResolvedResource> {
        self.resources.get(name)
    }

    pub fn id_of(&self, name: &str) -> Option<&str> {
        self.resources.get(name).map(|r| r.id.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.retired.is_empty() && self.revisions.is_empty()
    }

    /// Resources in the snapshot that directly depend on `name`.
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.resources
            .values()
            .filter(|r| r.depends_on.contains(name))
            .map(|r| r.name.as_str())
            .collect()
    }
}

/// Resolved direct dependencies of a resource, by logical name.
pub type ResolvedInputs = BTreeMap<String, ResolvedResource>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub id: String,
    pub outputs: BTreeMap<String, String>,
}

/// Creates, updates and deletes concrete resources. Calls must be idempotent for
/// the same resource and inputs.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    async fn create(&self, resource: &Resource, inputs: &ResolvedInputs) -> RuntimeResult<ProviderRecord>;

    async fn update(
        &self,
        current: &ResolvedResource,
        resource: &Resource,
        inputs: &ResolvedInputs,
    ) -> RuntimeResult<ProviderRecord>;

    async fn delete(&self, resource: &ResolvedResource) -> RuntimeResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    Create,
    Update,
    NoOp,
    Replace,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::NoOp => "no-op",
            Action::Replace => "replace",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub name: String,
    pub kind: ResourceKind,
    pub action: Action,
    /// Dependency level; steps on one level share no edges.
    pub level: usize,
    pub resource: Resource,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Steps in topological order.
    pub steps: Vec<PlanStep>,
    pub levels: usize,
    /// Resolved resources the graph no longer declares. Only `destroy` removes them.
    pub orphans: Vec<String>,
}

impl Plan {
    pub fn order(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.name.as_str())
    }

    pub fn count(&self, action: Action) -> usize {
        self.steps.iter().filter(|s| s.action == action).count()
    }

    pub fn has_changes(&self) -> bool {
        self.steps.iter().any(|s| s.action != Action::NoOp)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub applied: Vec<(String, Action)>,
    /// Steps whose configuration and inputs already matched the snapshot.
    pub skipped: Vec<String>,
    /// Replaced resources deleted after every step succeeded.
    pub deleted: Vec<String>,
    /// Steps satisfied by bringing back a kept revision instead of creating one.
    pub restored: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestroyOptions {
    /// Also destroy resources outside the targets that still depend on them.
    pub force: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestroyReport {
    /// Deleted resources, in deletion order.
    pub deleted: Vec<String>,
    /// Resources dropped from the snapshot but kept by their removal policy.
    pub retained: Vec<String>,
    /// Ids of kept revisions deleted along with their resource.
    pub revisions: Vec<String>,
}

/// Where an apply or destroy stopped. `state` is safe to pass to a retry.
#[derive(Debug)]
pub struct PartialApply {
    pub failed_step: String,
    pub completed: Vec<String>,
    pub source: RuntimeError,
    pub state: ResolvedState,
}

impl fmt::Display for PartialApply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "step '{}' failed after {} completed step(s) [{}]: {}",
            self.failed_step,
            self.completed.len(),
            self.completed.join(", "),
            self.source
        )
    }
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Configuration(#[from] GraphError),
    #[error("partial apply: {0}")]
    PartialApply(Box<PartialApply>),
    #[error("cannot destroy '{resource}': still referenced by {}", dependents.join(", "))]
    DependentsRemain { resource: String, dependents: Vec<String> },
    #[error("resource '{resource}' depends on '{dependency}', which has not been provisioned")]
    Unresolved { resource: String, dependency: String },
}

impl ProvisionError {
    /// The snapshot to resume from, when provisioning stopped part way.
    pub fn resumable_state(&self) -> Option<&ResolvedState> {
        match self {
            ProvisionError::PartialApply(partial) => Some(&partial.state),
            _ => None,
        }
    }
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;
