use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{
    deployment::types::{TaskTemplate, TemplateVersion},
    runtime::types::{ClusterRuntime, InstanceHandle, RuntimeError, RuntimeResult},
};

#[derive(Default)]
struct Inner {
    instances: BTreeMap<String, InstanceHandle>,
    next_id: u64,
    launches: Vec<TemplateVersion>,
    failing_launches: u32,
    min_running: Option<usize>,
    max_running: usize,
}

impl Inner {
    fn add(&mut self, service: &str, version: TemplateVersion) -> InstanceHandle {
        self.next_id += 1;
        let handle = InstanceHandle {
            id: format!("i-{:06}", self.next_id),
            service: service.to_string(),
            version,
            address: Some(format!("10.0.{}.{}:80", self.next_id / 250, self.next_id % 250 + 2)),
        };
        self.instances.insert(handle.id.clone(), handle.clone());
        self.observe();
        handle
    }

    fn observe(&mut self) {
        let running = self.instances.len();
        self.max_running = self.max_running.max(running);
        self.min_running = Some(self.min_running.map_or(running, |min| min.min(running)));
    }
}

/// In-memory cluster runtime that records every launch and the running count
/// after each change.
#[derive(Default)]
pub struct SimCluster {
    inner: Mutex<Inner>,
}

impl SimCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts `count` instances of `template` outside any deployment run.
    pub async fn seed(&self, service: &str, template: &TaskTemplate, count: u32) -> Vec<InstanceHandle> {
        let mut inner = self.inner.lock().await;
        let handles = (0..count).map(|_| inner.add(service, template.version())).collect();
        // Seeding is setup, not part of any observed run.
        inner.min_running = None;
        inner.max_running = inner.instances.len();
        handles
    }

    /// Makes the next `times` launches fail.
    pub async fn fail_launches(&self, times: u32) {
        self.inner.lock().await.failing_launches = times;
    }

    pub async fn running(&self) -> Vec<InstanceHandle> {
        self.inner.lock().await.instances.values().cloned().collect()
    }

    pub async fn running_versions(&self) -> Vec<TemplateVersion> {
        self.inner
            .lock()
            .await
            .instances
            .values()
            .map(|h| h.version.clone())
            .collect()
    }

    /// Versions launched through `launch_instance`, in order.
    pub async fn launches(&self) -> Vec<TemplateVersion> {
        self.inner.lock().await.launches.clone()
    }

    /// Lowest and highest running count seen since seeding.
    pub async fn observed_bounds(&self) -> (usize, usize) {
        let inner = self.inner.lock().await;
        (inner.min_running.unwrap_or(inner.instances.len()), inner.max_running)
    }
}

#[async_trait]
impl ClusterRuntime for SimCluster {
    async fn launch_instance(&self, service: &str, template: &TaskTemplate) -> RuntimeResult<InstanceHandle> {
        let mut inner = self.inner.lock().await;
        if inner.failing_launches > 0 {
            inner.failing_launches -= 1;
            return Err(RuntimeError::Fatal(format!("capacity unavailable for {}", template.version())));
        }
        inner.launches.push(template.version());
        Ok(inner.add(service, template.version()))
    }

    async fn stop_instance(&self, handle: &InstanceHandle) -> RuntimeResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.instances.remove(&handle.id).is_some() {
            inner.observe();
        }
        Ok(())
    }

    async fn list_instances(&self, service: &str) -> RuntimeResult<Vec<InstanceHandle>> {
        Ok(self
            .inner
            .lock()
            .await
            .instances
            .values()
            .filter(|h| h.service == service)
            .cloned()
            .collect())
    }
}
