use tracing::debug;

use super::types::{HealthCheckSettings, Instance, InstanceState};
use crate::runtime::{
    retry::{ExponentialBackoff, retry},
    types::{HealthStatus, InstanceHandle, LoadBalancer, RuntimeError},
};

/// What a single health poll reports back to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    Passing,
    Failing,
    /// Transient errors outlasted the retries; counts toward neither streak.
    Inconclusive,
}

pub async fn probe(
    balancer: &dyn LoadBalancer,
    handle: &InstanceHandle,
    settings: &HealthCheckSettings,
) -> ProbeResult {
    let backoff = ExponentialBackoff::new(settings.probe_backoff, settings.interval);
    match retry(backoff, settings.probe_attempts, || balancer.get_health(handle)).await {
        Ok(HealthStatus::Passing) => ProbeResult::Passing,
        Ok(HealthStatus::Failing) => ProbeResult::Failing,
        Err(RuntimeError::Transient(reason)) => {
            debug!(instance = %handle.id, %reason, "health probe inconclusive");
            ProbeResult::Inconclusive
        }
        Err(RuntimeError::Fatal(_) | RuntimeError::Conflict(_)) => ProbeResult::Failing,
    }
}

/// Folds a probe result into the instance's streak counters and returns the state
/// the instance has earned, if it changed. Only the supervisor calls this.
pub fn observe(instance: &mut Instance, result: ProbeResult, settings: &HealthCheckSettings) -> Option<InstanceState> {
    match result {
        ProbeResult::Passing => {
            instance.consecutive_passes += 1;
            instance.consecutive_failures = 0;
            (instance.state == InstanceState::Launching && instance.consecutive_passes >= settings.healthy_threshold)
                .then_some(InstanceState::Healthy)
        }
        ProbeResult::Failing => {
            instance.consecutive_failures += 1;
            instance.consecutive_passes = 0;
            (matches!(instance.state, InstanceState::Launching | InstanceState::Healthy)
                && instance.consecutive_failures >= settings.unhealthy_threshold)
                .then_some(InstanceState::Unhealthy)
        }
        ProbeResult::Inconclusive => None,
    }
}
