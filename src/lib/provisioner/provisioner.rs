use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use futures_util::future::join_all;
use tracing::{debug, info, warn};

use super::{
    plan,
    types::{
        Action, ApplyReport, DestroyOptions, DestroyReport, PartialApply, Plan, PlanStep, ProviderRecord,
        ProvisionError, ProvisionResult, ResolvedInputs, ResolvedResource, ResolvedState, ResourceProvider,
    },
};
use crate::{
    graph::{
        ResourceGraph,
        graph::topological_sort,
        types::{GraphError, RemovalPolicy, Resource, ResourceConfig},
    },
    runtime::{
        retry::{ExponentialBackoff, retry},
        types::RuntimeResult,
    },
};

const PROVIDER_ATTEMPTS: u32 = 3;

/// Applies resource graphs through a provider in dependency order.
pub struct Provisioner {
    provider: Arc<dyn ResourceProvider>,
    backoff: ExponentialBackoff,
}

struct Work<'a> {
    step: &'a PlanStep,
    inputs: ResolvedInputs,
    current: Option<ResolvedResource>,
}

impl Provisioner {
    pub fn new(provider: Arc<dyn ResourceProvider>) -> Self {
        Provisioner {
            provider,
            backoff: ExponentialBackoff::default(),
        }
    }

    pub fn plan(&self, graph: &ResourceGraph, state: &ResolvedState) -> ProvisionResult<Plan> {
        plan::plan(graph, state)
    }

    /// Executes `plan` level by level. Steps on one level run concurrently; a level
    /// starts only after the previous one fully succeeded.
    ///
    /// Nothing is rolled back on failure: the returned `PartialApply` carries the
    /// snapshot to retry from, and a retry skips every step that already matches it.
    pub async fn apply(&self, plan: &Plan, state: ResolvedState) -> ProvisionResult<(ResolvedState, ApplyReport)> {
        let mut state = state;
        let mut report = ApplyReport::default();
        let mut completed: Vec<String> = Vec::new();

        for level in 0..plan.levels {
            let mut work = Vec::new();
            for step in plan.steps.iter().filter(|s| s.level == level) {
                let inputs = resolve_inputs(&state, &step.resource)?;
                let current = state.get(&step.name).cloned();
                if current.as_ref().is_some_and(|c| is_satisfied(c, &step.resource, &inputs)) {
                    debug!(resource = %step.name, "already applied; skipping");
                    report.skipped.push(step.name.clone());
                    completed.push(step.name.clone());
                    continue;
                }
                if let Some(index) = state
                    .revisions
                    .iter()
                    .position(|r| r.name == step.name && is_satisfied(r, &step.resource, &inputs))
                {
                    let kept = state.revisions.remove(index);
                    info!(resource = %step.name, id = %kept.id, "restored kept revision");
                    if let Some(old) = state.resources.insert(step.name.clone(), kept) {
                        supersede(&mut state, old);
                    }
                    report.applied.push((step.name.clone(), Action::Replace));
                    report.restored.push(step.name.clone());
                    completed.push(step.name.clone());
                    continue;
                }
                work.push(Work { step, inputs, current });
            }

            let results = join_all(work.iter().map(|w| self.execute(w))).await;

            let mut failure = None;
            for (work, result) in work.into_iter().zip(results) {
                let step = work.step;
                match result {
                    Ok((action, record)) => {
                        info!(resource = %step.name, kind = %step.kind, %action, id = %record.id, "applied");
                        if action == Action::Replace {
                            if let Some(old) = work.current {
                                supersede(&mut state, old);
                            }
                        }
                        state
                            .resources
                            .insert(step.name.clone(), resolved(&step.resource, record, &work.inputs));
                        report.applied.push((step.name.clone(), action));
                        completed.push(step.name.clone());
                    }
                    Err(err) => {
                        warn!(resource = %step.name, error = %err, "step failed");
                        if failure.is_none() {
                            failure = Some((step.name.clone(), err));
                        }
                    }
                }
            }

            if let Some((failed_step, source)) = failure {
                return Err(ProvisionError::PartialApply(Box::new(PartialApply {
                    failed_step,
                    completed,
                    source,
                    state,
                })));
            }
        }

        // Dependents now point at the replacements, so the retired resources can go.
        while let Some(old) = state.retired.pop() {
            if let Err(source) = self.delete(&old).await {
                let failed_step = format!("{} (retired {})", old.name, old.id);
                state.retired.push(old);
                return Err(ProvisionError::PartialApply(Box::new(PartialApply {
                    failed_step,
                    completed,
                    source,
                    state,
                })));
            }
            info!(resource = %old.name, id = %old.id, "deleted replaced resource");
            report.deleted.push(old.name);
        }

        Ok((state, report))
    }

    /// Tears down the resources `graph` declares in reverse dependency order.
    ///
    /// Without `force`, fails before deleting anything when a resource outside the
    /// graph still depends on one inside it. With `force`, those dependents are
    /// torn down too.
    pub async fn destroy(
        &self,
        graph: &ResourceGraph,
        state: ResolvedState,
        options: DestroyOptions,
    ) -> ProvisionResult<(ResolvedState, DestroyReport)> {
        let mut state = state;
        let mut targets: BTreeSet<String> = graph
            .names()
            .filter(|name| state.resources.contains_key(*name))
            .map(str::to_string)
            .collect();

        let mut queue: Vec<String> = targets.iter().cloned().collect();
        while let Some(name) = queue.pop() {
            let outside: Vec<String> = state
                .dependents(&name)
                .into_iter()
                .filter(|d| !targets.contains(*d))
                .map(str::to_string)
                .collect();
            if outside.is_empty() {
                continue;
            }
            if !options.force {
                return Err(ProvisionError::DependentsRemain {
                    resource: name,
                    dependents: outside,
                });
            }
            for dependent in outside {
                info!(resource = %dependent, dependency = %name, "destroying dependent");
                targets.insert(dependent.clone());
                queue.push(dependent);
            }
        }

        let edges: BTreeMap<&str, Vec<&str>> = targets
            .iter()
            .filter_map(|name| state.resources.get(name))
            .map(|r| (r.name.as_str(), r.depends_on.iter().map(String::as_str).collect()))
            .collect();
        let order: Vec<String> = topological_sort(&edges)
            .map_err(|cycle| GraphError::CyclicDependency { cycle })?
            .into_iter()
            .rev()
            .map(str::to_string)
            .collect();

        let mut report = DestroyReport::default();
        for name in order {
            let Some(resource) = state.resources.get(&name).cloned() else {
                continue;
            };
            if matches!(
                &resource.config,
                ResourceConfig::Registry(registry) if registry.removal_policy == RemovalPolicy::Retain
            ) {
                info!(resource = %name, id = %resource.id, "retaining resource");
                state.resources.remove(&name);
                report.retained.push(name);
                continue;
            }

            while let Some(index) = state.revisions.iter().position(|r| r.name == name) {
                let revision = state.revisions[index].clone();
                if let Err(source) = self.delete(&revision).await {
                    warn!(resource = %name, id = %revision.id, error = %source, "revision delete failed");
                    return Err(ProvisionError::PartialApply(Box::new(PartialApply {
                        failed_step: format!("{name} (revision {})", revision.id),
                        completed: report.deleted,
                        source,
                        state,
                    })));
                }
                debug!(resource = %name, id = %revision.id, "deleted kept revision");
                state.revisions.remove(index);
                report.revisions.push(revision.id);
            }

            if let Err(source) = self.delete(&resource).await {
                warn!(resource = %name, error = %source, "delete failed");
                return Err(ProvisionError::PartialApply(Box::new(PartialApply {
                    failed_step: name,
                    completed: report.deleted,
                    source,
                    state,
                })));
            }
            info!(resource = %name, id = %resource.id, "destroyed");
            state.resources.remove(&name);
            report.deleted.push(name);
        }

        Ok((state, report))
    }

    async fn execute(&self, work: &Work<'_>) -> RuntimeResult<(Action, ProviderRecord)> {
        let resource = &work.step.resource;
        let inputs = &work.inputs;
        let provider = &self.provider;

        match &work.current {
            Some(current)
                if current.kind == resource.kind() && !current.config.requires_replacement(&resource.config) =>
            {
                let record =
                    retry(self.backoff, PROVIDER_ATTEMPTS, || provider.update(current, resource, inputs)).await?;
                Ok((Action::Update, record))
            }
            Some(_) => {
                let record = retry(self.backoff, PROVIDER_ATTEMPTS, || provider.create(resource, inputs)).await?;
                Ok((Action::Replace, record))
            }
            None => {
                let record = retry(self.backoff, PROVIDER_ATTEMPTS, || provider.create(resource, inputs)).await?;
                Ok((Action::Create, record))
            }
        }
    }

    async fn delete(&self, resource: &ResolvedResource) -> RuntimeResult<()> {
        let provider = &self.provider;
        retry(self.backoff, PROVIDER_ATTEMPTS, || provider.delete(resource)).await
    }
}

fn resolve_inputs(state: &ResolvedState, resource: &Resource) -> ProvisionResult<ResolvedInputs> {
    resource
        .depends_on
        .iter()
        .map(|dep| {
            state
                .get(dep)
                .map(|resolved| (dep.clone(), resolved.clone()))
                .ok_or_else(|| ProvisionError::Unresolved {
                    resource: resource.name.clone(),
                    dependency: dep.clone(),
                })
        })
        .collect()
}

fn input_ids(inputs: &ResolvedInputs) -> BTreeMap<String, String> {
    inputs.iter().map(|(name, r)| (name.clone(), r.id.clone())).collect()
}

fn is_satisfied(current: &ResolvedResource, resource: &Resource, inputs: &ResolvedInputs) -> bool {
    current.config == resource.config
        && current.depends_on == resource.depends_on
        && current.inputs == input_ids(inputs)
}

/// Keeps a replaced resource as a revision when its kind allows it; otherwise it
/// waits for deletion once the apply succeeds.
fn supersede(state: &mut ResolvedState, old: ResolvedResource) {
    if old.config.keeps_revisions() {
        state.revisions.push(old);
    } else {
        state.retired.push(old);
    }
}

fn resolved(resource: &Resource, record: ProviderRecord, inputs: &ResolvedInputs) -> ResolvedResource {
    ResolvedResource {
        name: resource.name.clone(),
        kind: resource.kind(),
        id: record.id,
        outputs: record.outputs,
        config: resource.config.clone(),
        depends_on: resource.depends_on.clone(),
        inputs: input_ids(inputs),
    }
}
