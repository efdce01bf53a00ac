use std::collections::BTreeMap;

use tracing::debug;

use super::types::{Action, Plan, PlanStep, ProvisionResult, ResolvedState};
use crate::graph::{ResourceGraph, types::Resource};

/// Orders `graph` and diffs every resource against the snapshot. Never talks to a provider.
pub fn plan(graph: &ResourceGraph, state: &ResolvedState) -> ProvisionResult<Plan> {
    let levels = graph.levels()?;
    let level_of: BTreeMap<&str, usize> = levels
        .iter()
        .enumerate()
        .flat_map(|(level, names)| names.iter().map(move |name| (name.as_str(), level)))
        .collect();

    let mut steps: Vec<PlanStep> = Vec::with_capacity(graph.len());
    let mut actions: BTreeMap<String, Action> = BTreeMap::new();

    for name in graph.topological_order()? {
        let Some(resource) = graph.get(&name) else {
            continue;
        };
        let (action, reason) = diff(resource, state, &actions);
        debug!(resource = %name, %action, reason = reason.as_deref().unwrap_or(""), "planned step");

        actions.insert(name.clone(), action);
        steps.push(PlanStep {
            level: level_of.get(name.as_str()).copied().unwrap_or_default(),
            kind: resource.kind(),
            action,
            resource: resource.clone(),
            reason,
            name,
        });
    }

    let orphans = state
        .resources
        .keys()
        .filter(|name| !graph.contains(name))
        .cloned()
        .collect();

    Ok(Plan {
        steps,
        levels: levels.len(),
        orphans,
    })
}

/// Declares the snapshot's orphans in `graph` again, with the configuration and
/// edges they were applied with, so a destroy can reach them. Returns their names.
pub fn include_orphans(graph: &mut ResourceGraph, state: &ResolvedState) -> ProvisionResult<Vec<String>> {
    let orphans: Vec<Resource> = state
        .resources
        .values()
        .filter(|r| !graph.contains(&r.name))
        .map(|r| Resource {
            name: r.name.clone(),
            config: r.config.clone(),
            depends_on: r.depends_on.clone(),
        })
        .collect();

    let mut names = Vec::with_capacity(orphans.len());
    for resource in orphans {
        names.push(resource.name.clone());
        graph.add_resource(resource)?;
    }
    Ok(names)
}

fn diff(resource: &Resource, state: &ResolvedState, upstream: &BTreeMap<String, Action>) -> (Action, Option<String>) {
    let Some(current) = state.get(&resource.name) else {
        return (Action::Create, None);
    };

    if current.kind != resource.kind() || current.config.requires_replacement(&resource.config) {
        return (Action::Replace, Some("an immutable attribute changed".to_string()));
    }
    if current.config != resource.config {
        return (Action::Update, Some("configuration changed".to_string()));
    }
    if current.depends_on != resource.depends_on {
        return (Action::Update, Some("dependencies changed".to_string()));
    }
    if let Some(dep) = resource
        .depends_on
        .iter()
        .find(|dep| matches!(upstream.get(*dep), Some(Action::Create | Action::Replace)))
    {
        return (Action::Update, Some(format!("upstream '{dep}' gets a new identifier")));
    }
    if let Some(dep) = resource
        .depends_on
        .iter()
        .find(|dep| current.inputs.get(*dep).map(String::as_str) != state.id_of(dep))
    {
        return (Action::Update, Some(format!("upstream '{dep}' identifier changed")));
    }
    (Action::NoOp, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        graph::types::{NetworkConfig, ResourceConfig, SubnetConfig, SubnetType},
        provisioner::types::ResolvedResource,
    };

    fn graph(cidr: &str, mask: u8) -> ResourceGraph {
        let mut graph = ResourceGraph::new();
        graph
            .add_resource(Resource::new(
                "vpc",
                ResourceConfig::Network(NetworkConfig {
                    cidr: cidr.into(),
                    max_azs: 3,
                }),
            ))
            .unwrap();
        graph
            .add_resource(Resource::new(
                "subnet",
                ResourceConfig::Subnet(SubnetConfig {
                    network: "vpc".into(),
                    cidr_mask: mask,
                    subnet_type: SubnetType::Public,
                }),
            ))
            .unwrap();
        graph
    }

    fn resolve(graph: &ResourceGraph) -> ResolvedState {
        let mut state = ResolvedState::default();
        for resource in graph.resources() {
            state.resources.insert(
                resource.name.clone(),
                ResolvedResource {
                    name: resource.name.clone(),
                    kind: resource.kind(),
                    id: format!("{}-1", resource.kind().id_prefix()),
                    outputs: BTreeMap::new(),
                    config: resource.config.clone(),
                    depends_on: resource.depends_on.clone(),
                    inputs: resource
                        .depends_on
                        .iter()
                        .map(|dep| (dep.clone(), format!("{}-1", graph.get(dep).unwrap().kind().id_prefix())))
                        .collect(),
                },
            );
        }
        state
    }

    #[test]
    fn empty_state_plans_creates_in_order() {
        let plan = plan(&graph("10.0.0.0/16", 24), &ResolvedState::default()).unwrap();
        assert_eq!(plan.order().collect::<Vec<_>>(), vec!["vpc", "subnet"]);
        assert_eq!(plan.count(Action::Create), 2);
        assert_eq!(plan.levels, 2);
    }

    #[test]
    fn unchanged_graph_is_a_no_op() {
        let graph = graph("10.0.0.0/16", 24);
        let plan = plan(&graph, &resolve(&graph)).unwrap();
        assert!(!plan.has_changes());
        assert!(plan.orphans.is_empty());
    }

    #[test]
    fn immutable_change_replaces_and_updates_dependents() {
        let state = resolve(&graph("10.0.0.0/16", 24));
        let plan = plan(&graph("10.1.0.0/16", 24), &state).unwrap();
        let actions: Vec<Action> = plan.steps.iter().map(|s| s.action).collect();
        assert_eq!(actions, vec![Action::Replace, Action::Update]);
    }

    #[test]
    fn orphans_are_declared_again_for_destroy() {
        let state = resolve(&graph("10.0.0.0/16", 24));
        let mut trimmed = ResourceGraph::new();
        trimmed.add_resource(graph("10.0.0.0/16", 24).get("vpc").unwrap().clone()).unwrap();
        assert_eq!(plan(&trimmed, &state).unwrap().orphans, vec!["subnet".to_string()]);

        let added = include_orphans(&mut trimmed, &state).unwrap();
        assert_eq!(added, vec!["subnet".to_string()]);
        assert_eq!(trimmed.get("subnet").unwrap().depends_on, state.get("subnet").unwrap().depends_on);
        let plan = plan(&trimmed, &state).unwrap();
        assert!(plan.orphans.is_empty());
        assert!(!plan.has_changes());
    }

    #[test]
    fn stale_inputs_are_updated() {
        let graph = graph("10.0.0.0/16", 24);
        let mut state = resolve(&graph);
        if let Some(vpc) = state.resources.get_mut("vpc") {
            vpc.id = "vpc-2".into();
        }
        let plan = plan(&graph, &state).unwrap();
        assert_eq!(plan.steps[1].action, Action::Update);

        state.resources.remove("vpc");
        let plan = super::plan(&graph, &state).unwrap();
        let actions: Vec<Action> = plan.steps.iter().map(|s| s.action).collect();
        assert_eq!(actions, vec![Action::Create, Action::Update]);
    }
}
