use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::types::{GraphError, GraphResult, Resource};

/// Typed resources plus the depends-on edges between them.
///
/// The graph is a pure data structure: nothing here talks to a provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceGraph {
    resources: BTreeMap<String, Resource>,
}

impl ResourceGraph {
    pub fn new() -> Self {
        ResourceGraph {
            resources: BTreeMap::new(),
        }
    }

    /// Adds a resource after checking its kind-specific configuration.
    pub fn add_resource(&mut self, resource: Resource) -> GraphResult<()> {
        if self.resources.contains_key(&resource.name) {
            return Err(GraphError::DuplicateName(resource.name));
        }
        resource
            .config
            .validate()
            .map_err(|reason| GraphError::InvalidConfig {
                resource: resource.name.clone(),
                reason,
            })?;
        self.resources.insert(resource.name.clone(), resource);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Resource> {
        self.resources.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Resource> {
        self.resources.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resources.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }

    /// Resources that directly depend on `name`.
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.resources
            .values()
            .filter(|r| r.depends_on.contains(name))
            .map(|r| r.name.as_str())
            .collect()
    }

    /// Copies the named resources into a new graph. Edges to resources left out are kept
    /// as-is, so the result is meant for selecting targets rather than for planning.
    pub fn subgraph<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> ResourceGraph {
        let resources = names
            .into_iter()
            .filter_map(|name| self.resources.get(name))
            .map(|r| (r.name.clone(), r.clone()))
            .collect();
        ResourceGraph { resources }
    }

    pub fn validate(&self) -> GraphResult<()> {
        for resource in self.resources.values() {
            if let Some(missing) = resource
                .depends_on
                .iter()
                .find(|dep| !self.resources.contains_key(*dep))
            {
                return Err(GraphError::DanglingReference {
                    resource: resource.name.clone(),
                    missing: missing.clone(),
                });
            }
        }
        topological_sort(&self.edges())
            .map(|_| ())
            .map_err(|cycle| GraphError::CyclicDependency { cycle })
    }

    /// Dependency order with a lexicographic tie-break.
    pub fn topological_order(&self) -> GraphResult<Vec<String>> {
        self.validate()?;
        let order = topological_sort(&self.edges()).map_err(|cycle| GraphError::CyclicDependency { cycle })?;
        Ok(order.into_iter().map(str::to_string).collect())
    }

    /// Groups resources into levels: every resource sits one level above its deepest
    /// dependency, so members of a level share no edges.
    pub fn levels(&self) -> GraphResult<Vec<Vec<String>>> {
        let order = self.topological_order()?;
        let mut depth: BTreeMap<&str, usize> = BTreeMap::new();
        let mut levels: BTreeMap<usize, Vec<String>> = BTreeMap::new();

        for name in &order {
            let resource = &self.resources[name];
            let level = resource
                .depends_on
                .iter()
                .filter_map(|dep| depth.get(dep.as_str()))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(name.as_str(), level);
            levels.entry(level).or_default().push(name.clone());
        }

        Ok(levels
            .into_values()
            .map(|mut names| {
                names.sort();
                names
            })
            .collect())
    }

    fn edges(&self) -> BTreeMap<&str, Vec<&str>> {
        self.resources
            .values()
            .map(|r| (r.name.as_str(), r.depends_on.iter().map(String::as_str).collect()))
            .collect()
    }
}

/// Kahn's algorithm over `node -> dependencies`, always taking the lexicographically
/// smallest ready node. Dependencies outside the map are ignored. On a cycle, returns
/// one offending cycle as the error.
pub(crate) fn topological_sort<'a>(edges: &BTreeMap<&'a str, Vec<&'a str>>) -> Result<Vec<&'a str>, Vec<String>> {
    let mut pending: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for (&node, deps) in edges {
        let known: BTreeSet<&str> = deps.iter().copied().filter(|d| edges.contains_key(d)).collect();
        pending.insert(node, known.len());
        for dep in known {
            dependents.entry(dep).or_default().push(node);
        }
    }

    let mut ready: BTreeSet<&str> = pending.iter().filter(|(_, n)| **n == 0).map(|(k, _)| *k).collect();
    let mut order = Vec::with_capacity(edges.len());

    while let Some(node) = ready.pop_first() {
        order.push(node);
        for &dependent in dependents.get(node).into_iter().flatten() {
            if let Some(count) = pending.get_mut(dependent) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(dependent);
                }
            }
        }
    }

    if order.len() == edges.len() {
        return Ok(order);
    }

    let placed: BTreeSet<&str> = order.into_iter().collect();
    Err(find_cycle(edges, &placed))
}

/// Walks unplaced nodes until a node repeats; every unplaced node has an unplaced
/// dependency, so the walk always closes a loop.
fn find_cycle(edges: &BTreeMap<&str, Vec<&str>>, placed: &BTreeSet<&str>) -> Vec<String> {
    let Some(start) = edges.keys().copied().find(|n| !placed.contains(n)) else {
        return Vec::new();
    };

    let mut path: Vec<&str> = vec![start];
    let mut current = start;
    loop {
        let next = edges[current]
            .iter()
            .copied()
            .filter(|d| edges.contains_key(d) && !placed.contains(d))
            .min();
        let Some(next) = next else {
            return path.into_iter().map(str::to_string).collect();
        };
        if let Some(pos) = path.iter().position(|n| *n == next) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|n| n.to_string()).collect();
            cycle.push(next.to_string());
            return cycle;
        }
        path.push(next);
        current = next;
    }
}
