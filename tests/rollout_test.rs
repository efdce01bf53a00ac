use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use r_deploy::{
    deployment::{
        ServiceSupervisor,
        state::valid_instance_transition,
        types::{
            DeploymentError, DeploymentTimeouts, HealthCheckSettings, InstanceState, Outcome, RollbackPolicy, RunState,
            ServiceSpec, TaskTemplate, TemplateVersion, Transition,
        },
    },
    graph::types::{CpuArchitecture, PortMapping},
    runtime::types::{HealthStatus, InstanceHandle, LoadBalancer, RuntimeError, RuntimeResult},
    sim::{SimBalancer, SimCluster},
};

const SERVICE: &str = "web";

fn template(revision: u32) -> TaskTemplate {
    TaskTemplate {
        family: "web".into(),
        revision,
        image: format!("web-repo:rev{revision}"),
        cpu: 1024,
        memory_mib: 2048,
        cpu_architecture: CpuArchitecture::Arm64,
        container_name: "web".into(),
        port_mappings: vec![PortMapping {
            container_port: 80,
            host_port: 80,
        }],
        execution_identity: "test/web-execution+1".into(),
        log_stream_prefix: "web".into(),
    }
}

fn version(revision: u32) -> TemplateVersion {
    template(revision).version()
}

fn spec(revision: u32, batch_size: Option<u32>, failure_threshold: u32) -> ServiceSpec {
    ServiceSpec {
        name: SERVICE.into(),
        cluster: "cluster".into(),
        template: template(revision),
        desired_count: 3,
        min_healthy_percent: 50,
        max_healthy_percent: 200,
        batch_size,
        rollback: RollbackPolicy {
            enabled: true,
            failure_threshold,
        },
        health: HealthCheckSettings {
            path: "/".into(),
            interval: Duration::from_secs(10),
            healthy_threshold: 2,
            unhealthy_threshold: 2,
            probe_attempts: 3,
            probe_backoff: Duration::from_millis(100),
        },
        timeouts: DeploymentTimeouts {
            batch: Duration::from_secs(120),
            run: Duration::from_secs(3600),
            drain_grace: Duration::from_secs(30),
        },
    }
}

/// A service running three healthy instances of revision 1.
async fn running_v1(balancer: Arc<dyn LoadBalancer>) -> (Arc<ServiceSupervisor>, Arc<SimCluster>) {
    let cluster = Arc::new(SimCluster::new());
    cluster.seed(SERVICE, &template(1), 3).await;
    let supervisor = Arc::new(ServiceSupervisor::new(
        SERVICE,
        Some(spec(1, Some(1), 1)),
        cluster.clone(),
        balancer,
    ));
    (supervisor, cluster)
}

async fn sorted_versions(cluster: &SimCluster) -> Vec<TemplateVersion> {
    let mut versions = cluster.running_versions().await;
    versions.sort();
    versions
}

fn assert_valid_log(supervisor: &ServiceSupervisor) {
    let run = supervisor.status().last_run.unwrap();
    assert!(run.is_terminal());
    for entry in &run.log {
        if let Transition::Instance { from: Some(from), to, .. } = &entry.transition {
            assert!(valid_instance_transition(from, to), "{from} -> {to}");
        }
    }
}

#[tokio::test(start_paused = true)]
async fn healthy_rollout_replaces_every_instance_within_bounds() {
    let balancer = Arc::new(SimBalancer::new());
    let (supervisor, cluster) = running_v1(balancer).await;

    let run = supervisor.deploy(spec(2, None, 2)).await.unwrap();

    assert_eq!(run.state, RunState::SteadyState);
    assert_eq!(run.outcome, Some(Outcome::Succeeded));
    assert_eq!(run.progress.target_healthy, 3);
    assert_eq!(sorted_versions(&cluster).await, vec![version(2); 3]);
    assert_eq!(cluster.launches().await, vec![version(2); 3]);

    let (min, max) = cluster.observed_bounds().await;
    assert!(min >= 2, "dipped to {min} running");
    assert!(max <= 6, "surged to {max} running");

    let status = supervisor.status();
    assert_eq!(status.spec.map(|s| s.template.version()), Some(version(2)));
    assert!(status.current_run.is_none());
    assert_valid_log(&supervisor);
}

/// desired 3, 50%/200%, batch 1, threshold 2, the second new instance fails.
#[tokio::test(start_paused = true)]
async fn second_instance_failing_trips_the_breaker_and_rolls_back() {
    let balancer = Arc::new(SimBalancer::new());
    balancer.fail_nth(version(2), 2).await;
    let (supervisor, cluster) = running_v1(balancer.clone()).await;

    let err = supervisor.deploy(spec(2, Some(1), 2)).await.unwrap_err();
    match err {
        DeploymentError::CircuitBreakerTripped {
            unhealthy,
            stable,
            rolled_back,
            target,
            ..
        } => {
            assert_eq!(unhealthy, 1);
            assert_eq!(target, version(2));
            assert_eq!(stable, Some(version(1)));
            assert!(rolled_back);
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(sorted_versions(&cluster).await, vec![version(1); 3]);
    assert_eq!(
        cluster.launches().await,
        vec![version(2), version(2), version(1), version(1)]
    );
    let (min, max) = cluster.observed_bounds().await;
    assert!(min >= 2 && max <= 6, "running count left [2, 6]: [{min}, {max}]");

    let status = supervisor.status();
    let run = status.last_run.clone().unwrap();
    assert_eq!(run.state, RunState::RolledBack);
    assert_eq!(run.outcome, Some(Outcome::RolledBack));
    assert_eq!(run.progress.unhealthy, 1);
    assert_eq!(status.spec.map(|s| s.template.version()), Some(version(1)));
    assert_eq!(balancer.registered().await.len(), 2);
    assert_valid_log(&supervisor);
}

#[tokio::test(start_paused = true)]
async fn breaker_waits_for_the_threshold() {
    let balancer = Arc::new(SimBalancer::new());
    balancer.fail_version(version(2)).await;
    let (supervisor, cluster) = running_v1(balancer).await;

    // Each unhealthy instance is charged the two failed checks that condemned it.
    let err = supervisor.deploy(spec(2, Some(1), 4)).await.unwrap_err();
    assert!(matches!(
        err,
        DeploymentError::CircuitBreakerTripped {
            unhealthy: 2,
            rolled_back: true,
            ..
        }
    ));
    assert_eq!(cluster.launches().await, vec![version(2), version(2), version(1)]);
    assert_eq!(sorted_versions(&cluster).await, vec![version(1); 3]);
}

#[tokio::test(start_paused = true)]
async fn promoted_instance_that_degrades_trips_the_breaker() {
    let balancer = Arc::new(SimBalancer::new());
    balancer.degrade_nth(version(2), 1, 2).await;
    let (supervisor, cluster) = running_v1(balancer).await;

    let err = supervisor.deploy(spec(2, None, 2)).await.unwrap_err();
    assert!(matches!(
        err,
        DeploymentError::CircuitBreakerTripped {
            unhealthy: 1,
            rolled_back: true,
            ..
        }
    ));
    assert_eq!(sorted_versions(&cluster).await, vec![version(1); 3]);

    let run = supervisor.status().last_run.unwrap();
    assert_eq!(run.outcome, Some(Outcome::RolledBack));
    assert!(run.log.iter().any(|entry| matches!(
        &entry.transition,
        Transition::Instance {
            from: Some(InstanceState::Healthy),
            to: InstanceState::Unhealthy,
            ..
        }
    )));
    assert_valid_log(&supervisor);
}

#[tokio::test(start_paused = true)]
async fn first_deployment_without_a_previous_version_fails_in_place() {
    let balancer = Arc::new(SimBalancer::new());
    balancer.fail_version(version(1)).await;
    let cluster = Arc::new(SimCluster::new());
    let supervisor = ServiceSupervisor::new(SERVICE, None, cluster.clone(), balancer);

    let err = supervisor.deploy(spec(1, None, 2)).await.unwrap_err();
    assert!(matches!(
        err,
        DeploymentError::CircuitBreakerTripped {
            stable: None,
            rolled_back: false,
            ..
        }
    ));
    assert_eq!(err.stable_version(), None);

    let run = supervisor.status().last_run.unwrap();
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.outcome, Some(Outcome::Failed));
    assert!(supervisor.current_spec().is_none());
    assert!(cluster.running().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn launch_and_registration_failures_are_replaced() {
    let balancer = Arc::new(SimBalancer::new());
    balancer.reject_registrations(2).await;
    let (supervisor, cluster) = running_v1(balancer).await;

    let run = supervisor.deploy(spec(2, Some(1), 2)).await.unwrap();
    assert_eq!(run.outcome, Some(Outcome::Succeeded));
    // Rejected registrations cost a relaunch but never count toward the breaker.
    assert_eq!(run.progress.unhealthy, 0);
    assert_eq!(cluster.launches().await.len(), 5);
    assert_eq!(sorted_versions(&cluster).await, vec![version(2); 3]);

    cluster.fail_launches(1).await;
    let run = supervisor.deploy(spec(3, Some(1), 2)).await.unwrap();
    assert_eq!(run.outcome, Some(Outcome::Succeeded));
    assert_eq!(run.progress.unhealthy, 1);
    assert_eq!(sorted_versions(&cluster).await, vec![version(3); 3]);
}

/// Reports every instance of one version as unreachable.
struct Unreachable {
    inner: SimBalancer,
    version: TemplateVersion,
}

#[async_trait]
impl LoadBalancer for Unreachable {
    async fn register_target(&self, handle: &InstanceHandle) -> RuntimeResult<()> {
        self.inner.register_target(handle).await
    }

    async fn deregister_target(&self, handle: &InstanceHandle) -> RuntimeResult<()> {
        self.inner.deregister_target(handle).await
    }

    async fn get_health(&self, handle: &InstanceHandle) -> RuntimeResult<HealthStatus> {
        if handle.version == self.version {
            return Err(RuntimeError::Transient("connection timed out".into()));
        }
        self.inner.get_health(handle).await
    }
}

#[tokio::test(start_paused = true)]
async fn batch_that_never_settles_times_out_and_rolls_back() {
    let balancer = Arc::new(Unreachable {
        inner: SimBalancer::new(),
        version: version(2),
    });
    let (supervisor, cluster) = running_v1(balancer).await;

    let err = supervisor.deploy(spec(2, Some(1), 1)).await.unwrap_err();
    match &err {
        DeploymentError::Timeout {
            scope, rolled_back, ..
        } => {
            assert_eq!(scope, "batch");
            assert!(rolled_back);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.stable_version(), Some(&version(1)));
    assert_eq!(sorted_versions(&cluster).await, vec![version(1); 3]);
}

#[tokio::test(start_paused = true)]
async fn cancellation_rolls_back_and_blocks_concurrent_deploys() {
    let balancer = Arc::new(SimBalancer::new());
    let (supervisor, cluster) = running_v1(balancer).await;
    let mut status = supervisor.subscribe();

    let deploying = tokio::spawn({
        let supervisor = supervisor.clone();
        async move { supervisor.deploy(spec(2, Some(1), 1)).await }
    });

    status
        .wait_for(|s| s.current_run.as_ref().is_some_and(|run| run.progress.launched >= 1))
        .await
        .unwrap();

    let second = supervisor.deploy(spec(3, Some(1), 1)).await.unwrap_err();
    assert!(matches!(second, DeploymentError::InProgress { .. }));

    assert!(supervisor.cancel().await);
    let err = deploying.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        DeploymentError::Cancelled {
            rolled_back: true,
            ..
        }
    ));

    assert!(!supervisor.cancel().await);
    assert_eq!(sorted_versions(&cluster).await, vec![version(1); 3]);
    assert_eq!(supervisor.status().last_run.unwrap().outcome, Some(Outcome::RolledBack));
}

#[tokio::test]
async fn invalid_spec_is_rejected_before_anything_runs() {
    let balancer = Arc::new(SimBalancer::new());
    let (supervisor, cluster) = running_v1(balancer).await;

    let mut next = spec(2, Some(1), 1);
    next.min_healthy_percent = 100;
    next.max_healthy_percent = 100;
    assert!(matches!(
        supervisor.deploy(next).await,
        Err(DeploymentError::Configuration(_))
    ));
    assert!(cluster.launches().await.is_empty());
    assert!(supervisor.status().last_run.is_none());
}
