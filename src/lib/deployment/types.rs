use std::{
    fmt,
    time::{Duration, SystemTime},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    graph::types::{CpuArchitecture, PortMapping},
    runtime::types::{InstanceHandle, RuntimeError},
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TemplateVersion {
    pub family: String,
    pub revision: u32,
}

impl fmt::Display for TemplateVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.family, self.revision)
    }
}

/// Desired state of one running instance. A changed template is a new revision,
/// never an edit of an existing one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub family: String,
    pub revision: u32,
    pub image: String,
    pub cpu: u32,
    pub memory_mib: u32,
    pub cpu_architecture: CpuArchitecture,
    pub container_name: String,
    pub port_mappings: Vec<PortMapping>,
    pub execution_identity: String,
    pub log_stream_prefix: String,
}

impl TaskTemplate {
    pub fn version(&self) -> TemplateVersion {
        TemplateVersion {
            family: self.family.clone(),
            revision: self.revision,
        }
    }
}

/// Running-count bounds derived from the desired count and healthy percentages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityBounds {
    pub desired: u32,
    pub min: u32,
    pub max: u32,
}

impl CapacityBounds {
    pub fn new(desired: u32, min_healthy_percent: u32, max_healthy_percent: u32) -> DeploymentResult<Self> {
        if desired == 0 {
            return Err(DeploymentError::Configuration(
                "desired count must be at least 1".to_string(),
            ));
        }
        if min_healthy_percent > 100 {
            return Err(DeploymentError::Configuration(format!(
                "minimum healthy percent {min_healthy_percent} is above 100"
            )));
        }
        if max_healthy_percent < 100 {
            return Err(DeploymentError::Configuration(format!(
                "maximum healthy percent {max_healthy_percent} is below 100"
            )));
        }

        let scaled = |percent: u32| u64::from(desired) * u64::from(percent);
        let min = scaled(min_healthy_percent).div_ceil(100) as u32;
        let max = u32::try_from(scaled(max_healthy_percent) / 100).unwrap_or(u32::MAX);

        if max <= min {
            return Err(DeploymentError::Configuration(format!(
                "bounds [{min}, {max}] for {desired} instances leave no room to replace an instance"
            )));
        }
        Ok(CapacityBounds { desired, min, max })
    }

    pub fn allows(&self, running: u32) -> bool {
        (self.min..=self.max).contains(&running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackPolicy {
    pub enabled: bool,
    /// Failed health checks of new-version instances that trip the circuit breaker.
    /// An unhealthy instance is charged at least one.
    pub failure_threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSettings {
    pub path: String,
    pub interval: Duration,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
    /// Attempts per probe before a transient error makes the probe inconclusive.
    pub probe_attempts: u32,
    pub probe_backoff: Duration,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        HealthCheckSettings {
            path: "/".to_string(),
            interval: Duration::from_secs(60),
            healthy_threshold: 5,
            unhealthy_threshold: 2,
            probe_attempts: 3,
            probe_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentTimeouts {
    /// Time a batch has to reach `healthy`.
    pub batch: Duration,
    /// Time a phase (forward or rollback) has to reach steady state.
    pub run: Duration,
    /// Time a deregistered instance keeps serving in-flight requests.
    pub drain_grace: Duration,
}

impl Default for DeploymentTimeouts {
    fn default() -> Self {
        DeploymentTimeouts {
            batch: Duration::from_secs(600),
            run: Duration::from_secs(3600),
            drain_grace: Duration::from_secs(300),
        }
    }
}

/// Desired steady state of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub cluster: String,
    pub template: TaskTemplate,
    pub desired_count: u32,
    pub min_healthy_percent: u32,
    pub max_healthy_percent: u32,
    /// Instances launched per batch. Defaults to the surge headroom above the desired count.
    pub batch_size: Option<u32>,
    pub rollback: RollbackPolicy,
    pub health: HealthCheckSettings,
    pub timeouts: DeploymentTimeouts,
}

impl ServiceSpec {
    pub fn bounds(&self) -> DeploymentResult<CapacityBounds> {
        CapacityBounds::new(self.desired_count, self.min_healthy_percent, self.max_healthy_percent)
    }

    /// Checks everything a run relies on before any instance is touched.
    pub fn validate(&self) -> DeploymentResult<CapacityBounds> {
        let bounds = self.bounds()?;
        if self.template.image.is_empty() {
            return Err(DeploymentError::Configuration(format!(
                "template {} has no image",
                self.template.version()
            )));
        }
        if self.batch_size == Some(0) {
            return Err(DeploymentError::Configuration("batch size must be at least 1".to_string()));
        }
        if self.rollback.failure_threshold == 0 {
            return Err(DeploymentError::Configuration(
                "circuit breaker threshold must be at least 1".to_string(),
            ));
        }
        let health = &self.health;
        if health.healthy_threshold == 0 || health.unhealthy_threshold == 0 || health.probe_attempts == 0 {
            return Err(DeploymentError::Configuration(
                "health thresholds and probe attempts must be at least 1".to_string(),
            ));
        }
        if health.interval.is_zero() {
            return Err(DeploymentError::Configuration("health interval must be non-zero".to_string()));
        }
        Ok(bounds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Launching,
    Healthy,
    Unhealthy,
    Draining,
    Stopped,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstanceState::Launching => "launching",
            InstanceState::Healthy => "healthy",
            InstanceState::Unhealthy => "unhealthy",
            InstanceState::Draining => "draining",
            InstanceState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// One running replica as tracked by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: Uuid,
    pub handle: InstanceHandle,
    pub state: InstanceState,
    pub registered: bool,
    pub consecutive_passes: u32,
    pub consecutive_failures: u32,
    pub batch: Option<u32>,
}

impl Instance {
    pub fn version(&self) -> &TemplateVersion {
        &self.handle.version
    }

    pub fn is_alive(&self) -> bool {
        self.state != InstanceState::Stopped
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Initializing,
    Scaling,
    Draining,
    SteadyState,
    RollingBack,
    RolledBack,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::SteadyState | RunState::RolledBack | RunState::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Initializing => "initializing",
            RunState::Scaling => "scaling",
            RunState::Draining => "draining",
            RunState::SteadyState => "steady_state",
            RunState::RollingBack => "rolling_back",
            RunState::RolledBack => "rolled_back",
            RunState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    RolledBack,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "subject", rename_all = "snake_case")]
pub enum Transition {
    Run {
        from: RunState,
        to: RunState,
    },
    Instance {
        instance: Uuid,
        version: TemplateVersion,
        from: Option<InstanceState>,
        to: InstanceState,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: SystemTime,
    pub transition: Transition,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub batches: u32,
    pub launched: u32,
    pub drained: u32,
    pub unhealthy: u32,
    pub running: u32,
    pub healthy: u32,
    pub target_healthy: u32,
}

/// One execution of the rollout controller against a ServiceSpec transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRun {
    pub id: Uuid,
    pub service: String,
    pub from: Option<TemplateVersion>,
    pub to: TemplateVersion,
    pub state: RunState,
    pub progress: BatchProgress,
    pub instances: Vec<Instance>,
    pub log: Vec<LogEntry>,
    pub outcome: Option<Outcome>,
    pub started_at: SystemTime,
    pub finished_at: Option<SystemTime>,
}

impl DeploymentRun {
    pub fn new(service: &str, from: Option<TemplateVersion>, to: TemplateVersion) -> Self {
        DeploymentRun {
            id: Uuid::new_v4(),
            service: service.to_string(),
            from,
            to,
            state: RunState::Initializing,
            progress: BatchProgress::default(),
            instances: Vec::new(),
            log: Vec::new(),
            outcome: None,
            started_at: SystemTime::now(),
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Instance transitions in log order.
    pub fn instance_transitions(&self) -> impl Iterator<Item = (&Uuid, &TemplateVersion, InstanceState)> {
        self.log.iter().filter_map(|entry| match &entry.transition {
            Transition::Instance {
                instance, version, to, ..
            } => Some((instance, version, *to)),
            Transition::Run { .. } => None,
        })
    }
}

#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error("invalid deployment configuration: {0}")]
    Configuration(String),
    #[error("a deployment is already in progress for service '{service}'")]
    InProgress { service: String },
    #[error(
        "circuit breaker tripped after {unhealthy} unhealthy instance(s) of {target}; service runs {}",
        describe(.stable)
    )]
    CircuitBreakerTripped {
        run_id: Uuid,
        target: TemplateVersion,
        unhealthy: u32,
        stable: Option<TemplateVersion>,
        rolled_back: bool,
    },
    #[error("deployment of {target} timed out ({scope}); service runs {}", describe(.stable))]
    Timeout {
        run_id: Uuid,
        target: TemplateVersion,
        scope: String,
        stable: Option<TemplateVersion>,
        rolled_back: bool,
    },
    #[error("deployment of {target} was cancelled; service runs {}", describe(.stable))]
    Cancelled {
        run_id: Uuid,
        target: TemplateVersion,
        stable: Option<TemplateVersion>,
        rolled_back: bool,
    },
    #[error("deployment of {target} failed: {reason}")]
    Failed {
        run_id: Uuid,
        target: TemplateVersion,
        reason: String,
    },
    #[error("rollback to {stable} failed: {reason}")]
    RollbackFailed {
        run_id: Uuid,
        stable: TemplateVersion,
        reason: String,
    },
    #[error("invalid {subject} transition from {from} to {to}")]
    InvalidTransition { subject: String, from: String, to: String },
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl DeploymentError {
    /// The version the service is known to run after this failure, if any.
    pub fn stable_version(&self) -> Option<&TemplateVersion> {
        match self {
            DeploymentError::CircuitBreakerTripped { stable, .. }
            | DeploymentError::Timeout { stable, .. }
            | DeploymentError::Cancelled { stable, .. } => stable.as_ref(),
            DeploymentError::RollbackFailed { stable, .. } => Some(stable),
            _ => None,
        }
    }
}

fn describe(version: &Option<TemplateVersion>) -> String {
    match version {
        Some(version) => version.to_string(),
        None => "no confirmed stable version".to_string(),
    }
}

pub type DeploymentResult<T> = Result<T, DeploymentError>;
