use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::{
    graph::types::{Resource, ResourceConfig},
    provisioner::types::{ProviderRecord, ResolvedInputs, ResolvedResource, ResolvedState, ResourceProvider},
    runtime::types::{IdentityProvider, RuntimeError, RuntimeResult},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub creates: u32,
    pub updates: u32,
    pub deletes: u32,
}

#[derive(Default)]
struct Inner {
    live: BTreeMap<String, String>,
    revisions: BTreeMap<String, u32>,
    calls: CallCounts,
    deletions: Vec<String>,
    failures: BTreeMap<String, u32>,
}

impl Inner {
    fn take_failure(&mut self, name: &str) -> RuntimeResult<()> {
        match self.failures.get_mut(name) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(RuntimeError::Fatal(format!("injected failure for '{name}'")))
            }
            _ => Ok(()),
        }
    }
}

/// In-memory resource provider. Ids are generated, outputs mimic what a cloud
/// provider would hand back for each kind.
pub struct SimProvider {
    identity: Arc<dyn IdentityProvider>,
    inner: Mutex<Inner>,
}

impl SimProvider {
    pub fn new(identity: Arc<dyn IdentityProvider>) -> Self {
        SimProvider {
            identity,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Starts from resources recorded in an earlier snapshot, so a new process can
    /// update and delete them.
    pub fn with_state(identity: Arc<dyn IdentityProvider>, state: &ResolvedState) -> Self {
        let mut inner = Inner::default();
        for resource in state.resources.values().chain(&state.retired).chain(&state.revisions) {
            inner.live.insert(resource.id.clone(), resource.name.clone());
            if let ResourceConfig::TaskTemplate(template) = &resource.config {
                let revision = resource
                    .output("revision")
                    .and_then(|r| r.parse().ok())
                    .unwrap_or_default();
                let latest = inner.revisions.entry(template.family.clone()).or_default();
                *latest = (*latest).max(revision);
            }
        }
        SimProvider {
            identity,
            inner: Mutex::new(inner),
        }
    }

    /// Makes the next `times` calls touching `name` fail.
    pub async fn fail_next(&self, name: &str, times: u32) {
        self.inner.lock().await.failures.insert(name.to_string(), times);
    }

    pub async fn calls(&self) -> CallCounts {
        self.inner.lock().await.calls
    }

    /// Logical names of deleted resources, in deletion order.
    pub async fn deletions(&self) -> Vec<String> {
        self.inner.lock().await.deletions.clone()
    }

    pub async fn live_ids(&self) -> BTreeSet<String> {
        self.inner.lock().await.live.keys().cloned().collect()
    }

    async fn outputs(
        &self,
        resource: &Resource,
        inputs: &ResolvedInputs,
        id: &str,
    ) -> RuntimeResult<BTreeMap<String, String>> {
        let input = |name: &str| {
            inputs
                .get(name)
                .ok_or_else(|| RuntimeError::Fatal(format!("'{}' was applied without '{name}'", resource.name)))
        };

        let mut outputs = BTreeMap::new();
        match &resource.config {
            ResourceConfig::Network(c) => {
                outputs.insert("cidr".to_string(), c.cidr.clone());
                outputs.insert("availability_zones".to_string(), c.max_azs.to_string());
            }
            ResourceConfig::Subnet(c) => {
                outputs.insert("network_id".to_string(), input(&c.network)?.id.clone());
                outputs.insert("cidr_mask".to_string(), c.cidr_mask.to_string());
            }
            ResourceConfig::Endpoint(c) => {
                outputs.insert("network_id".to_string(), input(&c.network)?.id.clone());
                outputs.insert("service".to_string(), c.service.clone());
            }
            ResourceConfig::SecurityRule(c) => {
                outputs.insert("network_id".to_string(), input(&c.network)?.id.clone());
            }
            ResourceConfig::LoadBalancer(c) => {
                let suffix = id.rsplit('-').next().unwrap_or(id);
                outputs.insert("dns_name".to_string(), format!("{}-{suffix}.elb.local", c.name));
                outputs.insert("subnet_id".to_string(), input(&c.subnet)?.id.clone());
            }
            ResourceConfig::Listener(c) => {
                outputs.insert("port".to_string(), c.port.to_string());
                outputs.insert("load_balancer_id".to_string(), input(&c.load_balancer)?.id.clone());
                outputs.insert("target_group_id".to_string(), input(&c.target_group)?.id.clone());
            }
            ResourceConfig::TargetGroup(c) => {
                outputs.insert("port".to_string(), c.port.to_string());
                outputs.insert("health_check_path".to_string(), c.health_check.path.clone());
            }
            ResourceConfig::Registry(c) => {
                outputs.insert("uri".to_string(), c.repository_name.clone());
            }
            ResourceConfig::TaskTemplate(c) => {
                let uri = input(&c.registry)?
                    .output("uri")
                    .ok_or_else(|| RuntimeError::Fatal(format!("registry '{}' has no uri", c.registry)))?
                    .to_string();
                let identity = self.identity.issue(&c.family, &c.permissions).await?;
                let revision = {
                    let mut inner = self.inner.lock().await;
                    let latest = inner.revisions.entry(c.family.clone()).or_default();
                    *latest += 1;
                    *latest
                };
                outputs.insert("family".to_string(), c.family.clone());
                outputs.insert("revision".to_string(), revision.to_string());
                outputs.insert("image".to_string(), format!("{uri}:{}", c.tag));
                outputs.insert("execution_identity".to_string(), identity);
            }
            ResourceConfig::Cluster(c) => {
                outputs.insert("name".to_string(), c.name.clone());
            }
            ResourceConfig::Service(c) => {
                let template = input(&c.task_template)?;
                outputs.insert("name".to_string(), c.name.clone());
                outputs.insert("cluster_id".to_string(), input(&c.cluster)?.id.clone());
                outputs.insert(
                    "task_template".to_string(),
                    format!(
                        "{}:{}",
                        template.output("family").unwrap_or_default(),
                        template.output("revision").unwrap_or_default()
                    ),
                );
            }
        }
        Ok(outputs)
    }
}

#[async_trait]
impl ResourceProvider for SimProvider {
    async fn create(&self, resource: &Resource, inputs: &ResolvedInputs) -> RuntimeResult<ProviderRecord> {
        {
            let mut inner = self.inner.lock().await;
            inner.calls.creates += 1;
            inner.take_failure(&resource.name)?;
        }

        let id = format!(
            "{}-{}",
            resource.kind().id_prefix(),
            &Uuid::new_v4().simple().to_string()[..12]
        );
        let outputs = self.outputs(resource, inputs, &id).await?;
        self.inner.lock().await.live.insert(id.clone(), resource.name.clone());
        debug!(resource = %resource.name, %id, "created");
        Ok(ProviderRecord { id, outputs })
    }

    async fn update(
        &self,
        current: &ResolvedResource,
        resource: &Resource,
        inputs: &ResolvedInputs,
    ) -> RuntimeResult<ProviderRecord> {
        {
            let mut inner = self.inner.lock().await;
            inner.calls.updates += 1;
            inner.take_failure(&resource.name)?;
            if !inner.live.contains_key(&current.id) {
                return Err(RuntimeError::Fatal(format!("no resource with id {}", current.id)));
            }
        }

        let outputs = self.outputs(resource, inputs, &current.id).await?;
        debug!(resource = %resource.name, id = %current.id, "updated");
        Ok(ProviderRecord {
            id: current.id.clone(),
            outputs,
        })
    }

    async fn delete(&self, resource: &ResolvedResource) -> RuntimeResult<()> {
        let mut inner = self.inner.lock().await;
        inner.calls.deletes += 1;
        inner.take_failure(&resource.name)?;
        if inner.live.remove(&resource.id).is_some() {
            inner.deletions.push(resource.name.clone());
        }
        Ok(())
    }
}
