use std::{
    fmt,
    sync::Arc,
    time::{Duration, SystemTime},
};

use futures_util::future::join_all;
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    health::{self, ProbeResult},
    state::{check_instance_transition, check_run_transition},
    supervisor::ServiceStatus,
    types::{
        CapacityBounds, DeploymentError, DeploymentResult, DeploymentRun, Instance, InstanceState, LogEntry, Outcome,
        RunState, ServiceSpec, TaskTemplate, TemplateVersion, Transition,
    },
};
use crate::runtime::{
    retry::{ExponentialBackoff, retry},
    types::{ClusterRuntime, InstanceHandle, LoadBalancer, RuntimeError},
};

/// Replacement launches allowed per batch slot after load balancer registration failures.
const REPLACEMENTS_PER_SLOT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Forward,
    Rollback,
}

/// Why a phase stopped converging.
#[derive(Debug)]
enum Halt {
    Tripped { unhealthy: u32 },
    Timeout(&'static str),
    Cancelled,
    Stalled(String),
}

impl fmt::Display for Halt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Halt::Tripped { unhealthy } => write!(f, "circuit breaker tripped after {unhealthy} unhealthy instance(s)"),
            Halt::Timeout(scope) => write!(f, "{scope} timed out"),
            Halt::Cancelled => f.write_str("cancelled by caller"),
            Halt::Stalled(reason) => f.write_str(reason),
        }
    }
}

enum LaunchFailure {
    Launch(RuntimeError),
    Registration,
}

#[derive(Debug, Default)]
struct Census {
    alive: u32,
    healthy: u32,
    target_alive: u32,
    target_healthy: u32,
    others_alive: u32,
}

/// Drives one service from its running template to a new one in bounded batches,
/// rolling back when the new version does not become healthy.
///
/// The controller is the only writer of instance state. Health pollers run
/// concurrently but only report results back to it.
pub struct Controller {
    spec: ServiceSpec,
    from: Option<TaskTemplate>,
    bounds: CapacityBounds,
    floor: u32,
    batch_size: u32,
    cluster: Arc<dyn ClusterRuntime>,
    balancer: Arc<dyn LoadBalancer>,
    cancel: CancellationToken,
    status: Option<Arc<watch::Sender<ServiceStatus>>>,
    run: DeploymentRun,
    /// Failed health checks charged to the breaker by target instances already condemned.
    failed_checks: u32,
    /// Target instances condemned while moving forward.
    unhealthy: u32,
    last_failure_timed_out: bool,
}

impl Controller {
    /// Validates `spec` before anything is launched or stopped.
    pub fn new(
        spec: ServiceSpec,
        from: Option<TaskTemplate>,
        cluster: Arc<dyn ClusterRuntime>,
        balancer: Arc<dyn LoadBalancer>,
    ) -> DeploymentResult<Self> {
        let bounds = spec.validate()?;
        let batch_size = spec.batch_size.unwrap_or(bounds.max - bounds.desired).max(1);
        let run = DeploymentRun::new(
            &spec.name,
            from.as_ref().map(TaskTemplate::version),
            spec.template.version(),
        );

        Ok(Controller {
            spec,
            from,
            bounds,
            floor: bounds.min,
            batch_size,
            cluster,
            balancer,
            cancel: CancellationToken::new(),
            status: None,
            run,
            failed_checks: 0,
            unhealthy: 0,
            last_failure_timed_out: false,
        })
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_status(mut self, status: Arc<watch::Sender<ServiceStatus>>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run.id
    }

    /// Runs to a terminal state and hands back the run with its full transition log.
    pub async fn run(mut self) -> (DeploymentRun, DeploymentResult<()>) {
        let result = self.drive().await;
        if !self.run.is_terminal() {
            self.set_run_state(RunState::Failed, "run aborted before reaching a terminal state");
            self.finish(Outcome::Failed);
        }
        self.publish();
        (self.run, result)
    }

    async fn drive(&mut self) -> DeploymentResult<()> {
        self.adopt_running().await?;

        let target = self.spec.template.clone();
        let halt = match self.converge(&target, Phase::Forward).await {
            Ok(()) => {
                self.set_run_state(
                    RunState::SteadyState,
                    "all instances run the target version and are healthy",
                );
                self.finish(Outcome::Succeeded);
                info!(service = %self.spec.name, version = %target.version(), "deployment reached steady state");
                return Ok(());
            }
            Err(halt) => halt,
        };

        warn!(service = %self.spec.name, version = %target.version(), reason = %halt, "halting forward scaling");
        let previous = match self.from.clone() {
            Some(previous) if self.spec.rollback.enabled => previous,
            _ => {
                self.set_run_state(RunState::Failed, &format!("{halt}; no rollback available"));
                self.finish(Outcome::Failed);
                return Err(self.halt_error(halt, None, false));
            }
        };

        self.set_run_state(RunState::RollingBack, &halt.to_string());
        match self.converge(&previous, Phase::Rollback).await {
            Ok(()) => {
                self.set_run_state(RunState::RolledBack, "previous version restored");
                self.finish(Outcome::RolledBack);
                info!(service = %self.spec.name, version = %previous.version(), "rollback complete");
                Err(self.halt_error(halt, Some(previous.version()), true))
            }
            Err(reason) => {
                self.set_run_state(RunState::Failed, &format!("rollback failed: {reason}"));
                self.finish(Outcome::Failed);
                error!(service = %self.spec.name, %reason, "rollback failed");
                Err(DeploymentError::RollbackFailed {
                    run_id: self.run.id,
                    stable: previous.version(),
                    reason: reason.to_string(),
                })
            }
        }
    }

    fn halt_error(&self, halt: Halt, stable: Option<TemplateVersion>, rolled_back: bool) -> DeploymentError {
        let run_id = self.run.id;
        let target = self.run.to.clone();
        match halt {
            Halt::Tripped { unhealthy } => DeploymentError::CircuitBreakerTripped {
                run_id,
                target,
                unhealthy,
                stable,
                rolled_back,
            },
            Halt::Timeout(scope) => DeploymentError::Timeout {
                run_id,
                target,
                scope: scope.to_string(),
                stable,
                rolled_back,
            },
            Halt::Cancelled => DeploymentError::Cancelled {
                run_id,
                target,
                stable,
                rolled_back,
            },
            Halt::Stalled(reason) => DeploymentError::Failed { run_id, target, reason },
        }
    }

    async fn adopt_running(&mut self) -> DeploymentResult<()> {
        let cluster = self.cluster.clone();
        let service = self.spec.name.clone();
        let handles = retry(self.backoff(), self.spec.health.probe_attempts, || {
            cluster.list_instances(&service)
        })
        .await?;

        for handle in handles {
            let id = Uuid::new_v4();
            let version = handle.version.clone();
            self.run.instances.push(Instance {
                id,
                handle,
                state: InstanceState::Healthy,
                registered: true,
                consecutive_passes: 0,
                consecutive_failures: 0,
                batch: None,
            });
            self.log(
                Transition::Instance {
                    instance: id,
                    version,
                    from: None,
                    to: InstanceState::Healthy,
                },
                "adopted running instance",
            );
        }

        // A service already running below the minimum is never pushed further down.
        self.floor = self.bounds.min.min(self.alive_count());
        debug!(
            service = %self.spec.name,
            floor = self.floor,
            max = self.bounds.max,
            batch_size = self.batch_size,
            "capacity bounds"
        );
        self.publish();
        Ok(())
    }

    async fn converge(&mut self, target: &TaskTemplate, phase: Phase) -> Result<(), Halt> {
        let version = target.version();
        let deadline = Instant::now() + self.spec.timeouts.run;

        loop {
            if phase == Phase::Forward && self.cancel.is_cancelled() {
                return Err(Halt::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(Halt::Timeout("run"));
            }

            let tripped = self.trip_breaker(&version, phase);
            self.reap_unhealthy(&version, phase).await;
            if tripped {
                return Err(if self.last_failure_timed_out {
                    Halt::Timeout("batch")
                } else {
                    Halt::Tripped {
                        unhealthy: self.unhealthy,
                    }
                });
            }

            let census = self.census(&version);
            if census.target_healthy == self.bounds.desired
                && census.others_alive == 0
                && census.alive == self.bounds.desired
            {
                return Ok(());
            }

            let drained = self.drain_surplus(&version, phase).await;
            if self.breaker_open(&version, phase) {
                continue;
            }
            let launched = self.launch_batch(target, phase, deadline).await;
            if drained == 0 && launched == 0 {
                return Err(Halt::Stalled(format!(
                    "no instance of {version} can be launched or drained: {} running, {} healthy, bounds [{}, {}]",
                    census.alive, census.healthy, self.floor, self.bounds.max
                )));
            }
        }
    }

    /// Stops instances that failed their health checks, as long as the running count
    /// stays at or above the floor.
    async fn reap_unhealthy(&mut self, version: &TemplateVersion, phase: Phase) {
        let unhealthy: Vec<Uuid> = self
            .run
            .instances
            .iter()
            .filter(|i| i.state == InstanceState::Unhealthy)
            .map(|i| i.id)
            .collect();

        for id in unhealthy {
            if self.alive_count() <= self.floor {
                break;
            }
            self.retire(id, version, phase, "replacing unhealthy instance").await;
        }
    }

    /// Retires non-target instances (and target instances above the desired count) while
    /// both the running and the healthy count stay at or above the floor.
    async fn drain_surplus(&mut self, version: &TemplateVersion, phase: Phase) -> u32 {
        let mut drained = 0;
        loop {
            if self.breaker_open(version, phase) {
                break;
            }
            let census = self.census(version);
            if census.alive <= self.floor {
                break;
            }
            let Some((id, state)) = self.next_surplus(version, &census) else {
                break;
            };
            if state == InstanceState::Healthy && census.healthy <= self.floor {
                break;
            }
            self.retire(id, version, phase, "superseded by the target version").await;
            drained += 1;
        }
        drained
    }

    fn next_surplus(&self, version: &TemplateVersion, census: &Census) -> Option<(Uuid, InstanceState)> {
        let others = || {
            self.run
                .instances
                .iter()
                .filter(move |i| i.is_alive() && i.version() != version)
        };

        // Instances that never served traffic go first, then the oldest healthy ones.
        let candidate = others()
            .find(|i| i.state == InstanceState::Launching)
            .or_else(|| others().find(|i| i.state == InstanceState::Healthy));
        if let Some(instance) = candidate {
            return Some((instance.id, instance.state));
        }

        if census.target_healthy > self.bounds.desired {
            return self
                .run
                .instances
                .iter()
                .rev()
                .find(|i| i.version() == version && i.state == InstanceState::Healthy)
                .map(|i| (i.id, i.state));
        }
        None
    }

    /// Launches the next batch of `target` and waits for it to become healthy.
    /// Returns the number of launch attempts made.
    async fn launch_batch(&mut self, target: &TaskTemplate, phase: Phase, run_deadline: Instant) -> u32 {
        let version = target.version();
        let census = self.census(&version);
        let need = self.bounds.desired.saturating_sub(census.target_alive);
        let room = self.bounds.max.saturating_sub(census.alive);
        let size = need.min(room).min(self.batch_size);
        if size == 0 {
            return 0;
        }

        if phase == Phase::Forward {
            self.set_run_state(RunState::Scaling, "launching the next batch");
        }
        self.run.progress.batches += 1;
        let batch = self.run.progress.batches;
        let deadline = (Instant::now() + self.spec.timeouts.batch).min(run_deadline);
        info!(service = %self.spec.name, %version, batch, size, "launching batch");

        let budget = size * (1 + REPLACEMENTS_PER_SLOT);
        let mut members = Vec::new();
        let mut attempts = 0;
        while (members.len() as u32) < size && attempts < budget && Instant::now() < deadline {
            attempts += 1;
            match self.launch_one(target, batch).await {
                Ok(id) => members.push(id),
                Err(LaunchFailure::Registration) => continue,
                Err(LaunchFailure::Launch(err)) => {
                    warn!(service = %self.spec.name, %version, error = %err, "instance launch failed");
                    self.record_failure(phase, 1, false);
                    tokio::time::sleep(self.spec.health.interval).await;
                    break;
                }
            }
        }
        if attempts >= budget && (members.len() as u32) < size {
            warn!(service = %self.spec.name, %version, batch, "replacement budget exhausted");
            for _ in members.len() as u32..size {
                self.record_failure(phase, 1, false);
            }
        }

        self.wait_for_health(&members, &version, deadline, phase).await;
        attempts
    }

    async fn launch_one(&mut self, target: &TaskTemplate, batch: u32) -> Result<Uuid, LaunchFailure> {
        let backoff = self.backoff();
        let attempts = self.spec.health.probe_attempts;
        let cluster = self.cluster.clone();
        let service = self.spec.name.clone();

        let handle = retry(backoff, attempts, || cluster.launch_instance(&service, target))
            .await
            .map_err(LaunchFailure::Launch)?;

        let id = Uuid::new_v4();
        self.run.instances.push(Instance {
            id,
            handle: handle.clone(),
            state: InstanceState::Launching,
            registered: false,
            consecutive_passes: 0,
            consecutive_failures: 0,
            batch: Some(batch),
        });
        self.run.progress.launched += 1;
        self.log(
            Transition::Instance {
                instance: id,
                version: handle.version.clone(),
                from: None,
                to: InstanceState::Launching,
            },
            &format!("launched {} in batch {batch}", handle.id),
        );

        let balancer = self.balancer.clone();
        match retry(backoff, attempts, || balancer.register_target(&handle)).await {
            Ok(()) => {
                if let Some(instance) = self.instance_mut(id) {
                    instance.registered = true;
                }
                Ok(id)
            }
            Err(err) => {
                warn!(instance = %handle.id, error = %err, "load balancer registration failed; replacing instance");
                self.stop(&handle).await;
                self.transition(id, InstanceState::Stopped, &format!("load balancer registration failed: {err}"));
                Err(LaunchFailure::Registration)
            }
        }
    }

    /// Polls the batch until every member is healthy or unhealthy. Members still
    /// launching at the deadline count as failed. Promoted instances of the batch's
    /// version keep being polled alongside it.
    async fn wait_for_health(&mut self, members: &[Uuid], version: &TemplateVersion, deadline: Instant, phase: Phase) {
        loop {
            let pending: Vec<Uuid> = members
                .iter()
                .filter_map(|id| self.instance(*id))
                .filter(|i| i.state == InstanceState::Launching)
                .map(|i| i.id)
                .collect();
            if pending.is_empty() || self.breaker_open(version, phase) {
                return;
            }

            if Instant::now() >= deadline {
                for id in pending {
                    if self.transition(id, InstanceState::Unhealthy, "batch did not become healthy in time") {
                        self.record_failure(phase, 1, true);
                    }
                }
                return;
            }

            let tick = tokio::time::sleep_until((Instant::now() + self.spec.health.interval).min(deadline));
            if phase == Phase::Forward {
                tokio::select! {
                    _ = tick => {}
                    _ = self.cancel.cancelled() => return,
                }
            } else {
                tick.await;
            }

            self.probe_watched(version, phase).await;
        }
    }

    /// Keeps polling the watched instances for `duration`.
    async fn settle(&mut self, duration: Duration, version: &TemplateVersion, phase: Phase) {
        let end = Instant::now() + duration;
        while Instant::now() < end {
            tokio::time::sleep_until((Instant::now() + self.spec.health.interval).min(end)).await;
            self.probe_watched(version, phase).await;
        }
    }

    /// Instances this run launched for `version` that still take health checks.
    /// Instances adopted from before the run are the stable fleet and are left alone.
    fn watched(&self, version: &TemplateVersion) -> impl Iterator<Item = &Instance> {
        self.run.instances.iter().filter(move |i| {
            i.batch.is_some()
                && i.registered
                && i.version() == version
                && matches!(i.state, InstanceState::Launching | InstanceState::Healthy)
        })
    }

    async fn probe_watched(&mut self, version: &TemplateVersion, phase: Phase) {
        let candidates: Vec<(Uuid, InstanceHandle)> =
            self.watched(version).map(|i| (i.id, i.handle.clone())).collect();
        if candidates.is_empty() {
            return;
        }

        let settings = &self.spec.health;
        let balancer = &self.balancer;
        let reports = join_all(candidates.iter().map(|(id, handle)| async move {
            (*id, health::probe(balancer.as_ref(), handle, settings).await)
        }))
        .await;

        for (id, result) in reports {
            self.apply_probe(id, result, phase);
        }
    }

    fn apply_probe(&mut self, id: Uuid, result: ProbeResult, phase: Phase) {
        let Some(instance) = self.run.instances.iter_mut().find(|i| i.id == id) else {
            return;
        };
        let verdict = health::observe(instance, result, &self.spec.health);
        let streak = instance.consecutive_failures;
        debug!(
            instance = %instance.handle.id,
            ?result,
            passes = instance.consecutive_passes,
            failures = streak,
            "health probe"
        );

        match verdict {
            Some(InstanceState::Healthy) => {
                self.transition(id, InstanceState::Healthy, "passed consecutive health checks");
            }
            Some(InstanceState::Unhealthy) => {
                if self.transition(id, InstanceState::Unhealthy, "failed consecutive health checks") {
                    self.record_failure(phase, streak, false);
                }
            }
            _ => {}
        }
    }

    /// Failed health checks charged to the breaker: the streaks that condemned
    /// instances plus the live failing streaks of watched ones. A passing check
    /// clears an instance's live streak.
    fn breaker_count(&self, version: &TemplateVersion) -> u32 {
        self.failed_checks + self.watched(version).map(|i| i.consecutive_failures).sum::<u32>()
    }

    fn breaker_open(&self, version: &TemplateVersion, phase: Phase) -> bool {
        phase == Phase::Forward && self.breaker_count(version) >= self.spec.rollback.failure_threshold
    }

    /// Condemns every watched instance that is failing once the breaker opens.
    fn trip_breaker(&mut self, version: &TemplateVersion, phase: Phase) -> bool {
        if !self.breaker_open(version, phase) {
            return false;
        }
        let failing: Vec<(Uuid, u32)> = self
            .watched(version)
            .filter(|i| i.consecutive_failures > 0)
            .map(|i| (i.id, i.consecutive_failures))
            .collect();
        for (id, streak) in failing {
            if self.transition(id, InstanceState::Unhealthy, "failing when the circuit breaker opened") {
                self.record_failure(phase, streak, false);
            }
        }
        true
    }

    fn record_failure(&mut self, phase: Phase, failed_checks: u32, timed_out: bool) {
        self.run.progress.unhealthy += 1;
        if phase == Phase::Forward {
            self.unhealthy += 1;
            self.failed_checks += failed_checks.max(1);
            self.last_failure_timed_out = timed_out;
        }
    }

    /// Takes an instance out of service. Healthy instances are deregistered and given
    /// the drain grace period before they are stopped; anything else stops at once.
    async fn retire(&mut self, id: Uuid, version: &TemplateVersion, phase: Phase, reason: &str) {
        let Some(instance) = self.instance(id) else {
            return;
        };
        let handle = instance.handle.clone();
        let registered = instance.registered;

        if instance.state == InstanceState::Healthy {
            if phase == Phase::Forward {
                self.set_run_state(RunState::Draining, "draining superseded instances");
            }
            self.transition(id, InstanceState::Draining, reason);
            if registered {
                self.deregister(&handle).await;
            }
            self.settle(self.spec.timeouts.drain_grace, version, phase).await;
            self.run.progress.drained += 1;
        } else if registered {
            self.deregister(&handle).await;
        }

        self.stop(&handle).await;
        self.transition(id, InstanceState::Stopped, reason);
    }

    async fn deregister(&self, handle: &InstanceHandle) {
        let balancer = self.balancer.clone();
        if let Err(err) = retry(self.backoff(), self.spec.health.probe_attempts, || {
            balancer.deregister_target(handle)
        })
        .await
        {
            warn!(instance = %handle.id, error = %err, "failed to deregister target");
        }
    }

    async fn stop(&self, handle: &InstanceHandle) {
        let cluster = self.cluster.clone();
        if let Err(err) = retry(self.backoff(), self.spec.health.probe_attempts, || {
            cluster.stop_instance(handle)
        })
        .await
        {
            error!(instance = %handle.id, error = %err, "failed to stop instance");
        }
    }

    fn census(&self, version: &TemplateVersion) -> Census {
        let mut census = Census::default();
        for instance in self.run.instances.iter().filter(|i| i.is_alive()) {
            let healthy = instance.state == InstanceState::Healthy;
            census.alive += 1;
            census.healthy += u32::from(healthy);
            if instance.version() == version {
                census.target_alive += 1;
                census.target_healthy += u32::from(healthy);
            } else {
                census.others_alive += 1;
            }
        }
        census
    }

    fn alive_count(&self) -> u32 {
        self.run.instances.iter().filter(|i| i.is_alive()).count() as u32
    }

    fn instance(&self, id: Uuid) -> Option<&Instance> {
        self.run.instances.iter().find(|i| i.id == id)
    }

    fn instance_mut(&mut self, id: Uuid) -> Option<&mut Instance> {
        self.run.instances.iter_mut().find(|i| i.id == id)
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.spec.health.probe_backoff, self.spec.health.interval)
    }

    fn transition(&mut self, id: Uuid, to: InstanceState, reason: &str) -> bool {
        let Some(instance) = self.instance_mut(id) else {
            return false;
        };
        let from = instance.state;
        if let Err(err) = check_instance_transition(from, to) {
            error!(instance = %instance.handle.id, error = %err, "rejected state change");
            return false;
        }
        instance.state = to;
        let version = instance.handle.version.clone();
        let handle_id = instance.handle.id.clone();

        info!(service = %self.spec.name, instance = %handle_id, %version, %from, %to, reason, "instance transition");
        self.log(
            Transition::Instance {
                instance: id,
                version,
                from: Some(from),
                to,
            },
            reason,
        );
        true
    }

    fn set_run_state(&mut self, to: RunState, reason: &str) -> bool {
        let from = self.run.state;
        if from == to {
            return false;
        }
        if let Err(err) = check_run_transition(from, to) {
            error!(run = %self.run.id, error = %err, "rejected state change");
            return false;
        }
        self.run.state = to;
        info!(service = %self.spec.name, run = %self.run.id, %from, %to, reason, "run transition");
        self.log(Transition::Run { from, to }, reason);
        true
    }

    fn finish(&mut self, outcome: Outcome) {
        self.run.outcome = Some(outcome);
        self.run.finished_at = Some(SystemTime::now());
    }

    fn log(&mut self, transition: Transition, reason: &str) {
        self.run.log.push(LogEntry {
            at: SystemTime::now(),
            transition,
            reason: reason.to_string(),
        });

        let target = &self.run.to;
        let progress = &mut self.run.progress;
        progress.running = 0;
        progress.healthy = 0;
        progress.target_healthy = 0;
        for instance in self.run.instances.iter().filter(|i| i.is_alive()) {
            progress.running += 1;
            if instance.state == InstanceState::Healthy {
                progress.healthy += 1;
                progress.target_healthy += u32::from(instance.version() == target);
            }
        }
        self.publish();
    }

    fn publish(&self) {
        if let Some(status) = &self.status {
            let snapshot = self.run.clone();
            status.send_modify(|status| status.current_run = Some(snapshot));
        }
    }
}
