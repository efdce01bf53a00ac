use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{
    deployment::types::TemplateVersion,
    runtime::types::{HealthStatus, InstanceHandle, LoadBalancer, RuntimeError, RuntimeResult},
};

#[derive(Default)]
struct Inner {
    registered: BTreeSet<String>,
    registrations: BTreeMap<TemplateVersion, u32>,
    failing_versions: BTreeSet<TemplateVersion>,
    failing_ordinals: BTreeSet<(TemplateVersion, u32)>,
    failing_instances: BTreeSet<String>,
    degrading_ordinals: BTreeMap<(TemplateVersion, u32), u32>,
    /// Passing checks left per instance before it starts failing.
    degrading_instances: BTreeMap<String, u32>,
    rejected_registrations: u32,
    transient_errors: u32,
}

/// In-memory load balancer with scripted health per template version.
#[derive(Default)]
pub struct SimBalancer {
    inner: Mutex<Inner>,
}

impl SimBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every instance of `version` fails its health checks.
    pub async fn fail_version(&self, version: TemplateVersion) {
        self.inner.lock().await.failing_versions.insert(version);
    }

    /// The `ordinal`-th (1-based) registered instance of `version` fails its health checks.
    pub async fn fail_nth(&self, version: TemplateVersion, ordinal: u32) {
        self.inner.lock().await.failing_ordinals.insert((version, ordinal));
    }

    /// The `ordinal`-th (1-based) registered instance of `version` passes its first
    /// `passes` health checks and fails every one after that.
    pub async fn degrade_nth(&self, version: TemplateVersion, ordinal: u32, passes: u32) {
        self.inner.lock().await.degrading_ordinals.insert((version, ordinal), passes);
    }

    /// Rejects the next `times` registrations.
    pub async fn reject_registrations(&self, times: u32) {
        self.inner.lock().await.rejected_registrations = times;
    }

    /// The next `times` health calls fail with a transient error.
    pub async fn transient_errors(&self, times: u32) {
        self.inner.lock().await.transient_errors = times;
    }

    pub async fn registered(&self) -> Vec<String> {
        self.inner.lock().await.registered.iter().cloned().collect()
    }
}

#[async_trait]
impl LoadBalancer for SimBalancer {
    async fn register_target(&self, handle: &InstanceHandle) -> RuntimeResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.rejected_registrations > 0 {
            inner.rejected_registrations -= 1;
            return Err(RuntimeError::Fatal(format!("target {} rejected", handle.id)));
        }

        let ordinal = {
            let count = inner.registrations.entry(handle.version.clone()).or_default();
            *count += 1;
            *count
        };
        let key = (handle.version.clone(), ordinal);
        if inner.failing_ordinals.contains(&key) {
            inner.failing_instances.insert(handle.id.clone());
        }
        if let Some(passes) = inner.degrading_ordinals.get(&key).copied() {
            inner.degrading_instances.insert(handle.id.clone(), passes);
        }
        inner.registered.insert(handle.id.clone());
        Ok(())
    }

    async fn deregister_target(&self, handle: &InstanceHandle) -> RuntimeResult<()> {
        self.inner.lock().await.registered.remove(&handle.id);
        Ok(())
    }

    async fn get_health(&self, handle: &InstanceHandle) -> RuntimeResult<HealthStatus> {
        let mut inner = self.inner.lock().await;
        if inner.transient_errors > 0 {
            inner.transient_errors -= 1;
            return Err(RuntimeError::Transient("health check timed out".to_string()));
        }
        if !inner.registered.contains(&handle.id) {
            return Err(RuntimeError::Fatal(format!("target {} is not registered", handle.id)));
        }

        if let Some(passes) = inner.degrading_instances.get_mut(&handle.id) {
            if *passes == 0 {
                return Ok(HealthStatus::Failing);
            }
            *passes -= 1;
        }

        let failing =
            inner.failing_versions.contains(&handle.version) || inner.failing_instances.contains(&handle.id);
        Ok(if failing {
            HealthStatus::Failing
        } else {
            HealthStatus::Passing
        })
    }
}
