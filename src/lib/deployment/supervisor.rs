use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{
    controller::Controller,
    types::{DeploymentError, DeploymentResult, DeploymentRun, ServiceSpec},
};
use crate::runtime::types::{ClusterRuntime, LoadBalancer};

/// Observable state of one service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub service: String,
    /// Spec of the last run that reached steady state.
    pub spec: Option<ServiceSpec>,
    pub current_run: Option<DeploymentRun>,
    pub last_run: Option<DeploymentRun>,
}

/// Owns the deployment lifecycle of a single service. At most one run is active at a time.
pub struct ServiceSupervisor {
    service: String,
    cluster: Arc<dyn ClusterRuntime>,
    balancer: Arc<dyn LoadBalancer>,
    run_lock: Mutex<()>,
    active: Mutex<Option<CancellationToken>>,
    status: Arc<watch::Sender<ServiceStatus>>,
}

impl ServiceSupervisor {
    pub fn new(
        service: impl Into<String>,
        current: Option<ServiceSpec>,
        cluster: Arc<dyn ClusterRuntime>,
        balancer: Arc<dyn LoadBalancer>,
    ) -> Self {
        let service = service.into();
        let (status, _) = watch::channel(ServiceStatus {
            service: service.clone(),
            spec: current,
            ..Default::default()
        });

        ServiceSupervisor {
            service,
            cluster,
            balancer,
            run_lock: Mutex::new(()),
            active: Mutex::new(None),
            status: Arc::new(status),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn subscribe(&self) -> watch::Receiver<ServiceStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> ServiceStatus {
        self.status.borrow().clone()
    }

    pub fn current_spec(&self) -> Option<ServiceSpec> {
        self.status.borrow().spec.clone()
    }

    /// Rolls the service to `next`. A second call while a run is active fails with
    /// `InProgress` instead of queueing.
    pub async fn deploy(&self, next: ServiceSpec) -> DeploymentResult<DeploymentRun> {
        let _guard = self.run_lock.try_lock().map_err(|_| DeploymentError::InProgress {
            service: self.service.clone(),
        })?;

        if next.name != self.service {
            return Err(DeploymentError::Configuration(format!(
                "spec for '{}' submitted to the supervisor of '{}'",
                next.name, self.service
            )));
        }

        let from = self.current_spec().map(|spec| spec.template);
        let token = CancellationToken::new();
        let controller = Controller::new(next.clone(), from, self.cluster.clone(), self.balancer.clone())?
            .with_cancellation(token.clone())
            .with_status(self.status.clone());

        info!(
            service = %self.service,
            run = %controller.run_id(),
            version = %next.template.version(),
            "starting deployment"
        );
        *self.active.lock().await = Some(token);
        let (run, result) = controller.run().await;
        *self.active.lock().await = None;

        let succeeded = result.is_ok();
        let archived = run.clone();
        self.status.send_modify(|status| {
            if succeeded {
                status.spec = Some(next);
            }
            status.current_run = None;
            status.last_run = Some(archived);
        });

        result.map(|()| run)
    }

    /// Cancels the active run, if any. The run rolls back to the previous version.
    pub async fn cancel(&self) -> bool {
        match self.active.lock().await.as_ref() {
            Some(token) => {
                info!(service = %self.service, "cancelling active deployment");
                token.cancel();
                true
            }
            None => false,
        }
    }
}
