use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::types::{HealthStatus, InstanceHandle, LoadBalancer, RuntimeError, RuntimeResult};

/// Tracks registered targets and probes them over HTTP the way the listener's
/// health check would.
pub struct HttpBalancer {
    client: reqwest::Client,
    path: String,
    healthy_codes: Vec<u16>,
    targets: RwLock<HashMap<String, String>>,
}

impl HttpBalancer {
    pub fn new(path: impl Into<String>, healthy_codes: Vec<u16>, timeout: Duration) -> RuntimeResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| RuntimeError::Fatal(format!("failed to build http client: {err}")))?;

        Ok(HttpBalancer {
            client,
            path: path.into(),
            healthy_codes,
            targets: RwLock::new(HashMap::new()),
        })
    }

    pub async fn targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self.targets.read().await.values().cloned().collect();
        targets.sort();
        targets
    }
}

#[async_trait]
impl LoadBalancer for HttpBalancer {
    async fn register_target(&self, handle: &InstanceHandle) -> RuntimeResult<()> {
        let Some(address) = handle.address.clone() else {
            return Err(RuntimeError::Fatal(format!(
                "instance {} publishes no address to register",
                handle.id
            )));
        };
        info!(instance = %handle.id, %address, "registering target");
        self.targets.write().await.insert(handle.id.clone(), address);
        Ok(())
    }

    async fn deregister_target(&self, handle: &InstanceHandle) -> RuntimeResult<()> {
        if self.targets.write().await.remove(&handle.id).is_some() {
            info!(instance = %handle.id, "deregistered target");
        }
        Ok(())
    }

    async fn get_health(&self, handle: &InstanceHandle) -> RuntimeResult<HealthStatus> {
        let Some(address) = self.targets.read().await.get(&handle.id).cloned() else {
            return Err(RuntimeError::Fatal(format!("instance {} is not registered", handle.id)));
        };

        let url = format!("http://{address}{}", self.path);
        match self.client.get(&url).send().await {
            Ok(response) => {
                let code = response.status().as_u16();
                debug!(instance = %handle.id, %url, code, "health check response");
                Ok(if self.healthy_codes.contains(&code) {
                    HealthStatus::Passing
                } else {
                    HealthStatus::Failing
                })
            }
            Err(err) if err.is_timeout() => Err(RuntimeError::Transient(format!("health check timed out: {err}"))),
            // Refused connections mean nothing listens yet, which is a failed check.
            Err(err) => {
                debug!(instance = %handle.id, %url, error = %err, "health check failed");
                Ok(HealthStatus::Failing)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::types::TemplateVersion;

    fn handle(address: Option<&str>) -> InstanceHandle {
        InstanceHandle {
            id: "c-1".into(),
            service: "svc".into(),
            version: TemplateVersion {
                family: "web".into(),
                revision: 1,
            },
            address: address.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn targets_without_an_address_are_rejected() {
        let balancer = HttpBalancer::new("/", vec![200], Duration::from_secs(1)).unwrap();
        let err = balancer.register_target(&handle(None)).await.unwrap_err();
        assert!(!err.is_transient());

        balancer.register_target(&handle(Some("127.0.0.1:8080"))).await.unwrap();
        assert_eq!(balancer.targets().await, vec!["127.0.0.1:8080".to_string()]);
        balancer.deregister_target(&handle(None)).await.unwrap();
        assert!(balancer.targets().await.is_empty());
    }

    #[tokio::test]
    async fn unregistered_targets_have_no_health() {
        let balancer = HttpBalancer::new("/", vec![200], Duration::from_secs(1)).unwrap();
        assert!(balancer.get_health(&handle(Some("127.0.0.1:1"))).await.is_err());
    }
}
