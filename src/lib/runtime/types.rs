use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::deployment::types::{TaskTemplate, TemplateVersion};

/// A launched instance as seen by the cluster runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceHandle {
    pub id: String,
    pub service: String,
    pub version: TemplateVersion,
    /// `host:port` the load balancer sends traffic to, once known.
    pub address: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Passing,
    Failing,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// Worth retrying: timeouts, throttling, connection resets.
    #[error("transient error: {0}")]
    Transient(String),
    #[error("{0}")]
    Fatal(String),
    /// The name is already taken by someone else; retrying cannot succeed.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl RuntimeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RuntimeError::Transient(_))
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[async_trait]
pub trait ClusterRuntime: Send + Sync {
    async fn launch_instance(&self, service: &str, template: &TaskTemplate) -> RuntimeResult<InstanceHandle>;

    async fn stop_instance(&self, handle: &InstanceHandle) -> RuntimeResult<()>;

    async fn list_instances(&self, service: &str) -> RuntimeResult<Vec<InstanceHandle>>;
}

#[async_trait]
pub trait LoadBalancer: Send + Sync {
    async fn register_target(&self, handle: &InstanceHandle) -> RuntimeResult<()>;

    async fn deregister_target(&self, handle: &InstanceHandle) -> RuntimeResult<()>;

    async fn get_health(&self, handle: &InstanceHandle) -> RuntimeResult<HealthStatus>;
}

/// Issues the execution identity attached to a task template. The returned
/// reference is opaque to everything but the cluster runtime.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn issue(&self, family: &str, permissions: &[String]) -> RuntimeResult<String>;
}
