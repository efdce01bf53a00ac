use std::{collections::HashMap, sync::LazyLock};

use super::types::{DeploymentError, DeploymentResult, InstanceState, RunState};

static INSTANCE_TRANSITIONS: LazyLock<HashMap<InstanceState, Vec<InstanceState>>> = LazyLock::new(|| {
    let mut map = HashMap::new();
    map.insert(
        InstanceState::Launching,
        vec![InstanceState::Healthy, InstanceState::Unhealthy, InstanceState::Stopped],
    );
    map.insert(
        InstanceState::Healthy,
        vec![InstanceState::Unhealthy, InstanceState::Draining],
    );
    map.insert(InstanceState::Unhealthy, vec![InstanceState::Stopped]);
    map.insert(InstanceState::Draining, vec![InstanceState::Stopped]);
    map.insert(InstanceState::Stopped, vec![]);
    map
});

static RUN_TRANSITIONS: LazyLock<HashMap<RunState, Vec<RunState>>> = LazyLock::new(|| {
    let forward = |extra: RunState| {
        vec![
            extra,
            RunState::SteadyState,
            RunState::RollingBack,
            RunState::Failed,
        ]
    };
    let mut map = HashMap::new();
    map.insert(RunState::Initializing, {
        let mut next = forward(RunState::Scaling);
        next.push(RunState::Draining);
        next
    });
    map.insert(RunState::Scaling, forward(RunState::Draining));
    map.insert(RunState::Draining, forward(RunState::Scaling));
    map.insert(RunState::RollingBack, vec![RunState::RolledBack, RunState::Failed]);
    map.insert(RunState::SteadyState, vec![]);
    map.insert(RunState::RolledBack, vec![]);
    map.insert(RunState::Failed, vec![]);
    map
});

pub fn valid_instance_transition(src: &InstanceState, dst: &InstanceState) -> bool {
    INSTANCE_TRANSITIONS
        .get(src)
        .is_some_and(|valid_states| valid_states.contains(dst))
}

pub fn valid_run_transition(src: &RunState, dst: &RunState) -> bool {
    RUN_TRANSITIONS
        .get(src)
        .is_some_and(|valid_states| valid_states.contains(dst))
}

/// Like [`valid_instance_transition`], but names the rejected move.
pub fn check_instance_transition(src: InstanceState, dst: InstanceState) -> DeploymentResult<()> {
    if valid_instance_transition(&src, &dst) {
        return Ok(());
    }
    Err(DeploymentError::InvalidTransition {
        subject: "instance".to_string(),
        from: src.to_string(),
        to: dst.to_string(),
    })
}

pub fn check_run_transition(src: RunState, dst: RunState) -> DeploymentResult<()> {
    if valid_run_transition(&src, &dst) {
        return Ok(());
    }
    Err(DeploymentError::InvalidTransition {
        subject: "run".to_string(),
        from: src.to_string(),
        to: dst.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instances_only_stop_after_draining_or_failing() {
        assert!(valid_instance_transition(&InstanceState::Launching, &InstanceState::Healthy));
        assert!(valid_instance_transition(&InstanceState::Healthy, &InstanceState::Draining));
        assert!(valid_instance_transition(&InstanceState::Unhealthy, &InstanceState::Stopped));
        assert!(!valid_instance_transition(&InstanceState::Healthy, &InstanceState::Stopped));
        assert!(!valid_instance_transition(&InstanceState::Stopped, &InstanceState::Launching));
        assert!(!valid_instance_transition(&InstanceState::Draining, &InstanceState::Healthy));
    }

    #[test]
    fn terminal_run_states_have_no_exits() {
        for terminal in [RunState::SteadyState, RunState::RolledBack, RunState::Failed] {
            assert!(terminal.is_terminal());
            assert!(!valid_run_transition(&terminal, &RunState::Scaling));
        }
        assert!(valid_run_transition(&RunState::Scaling, &RunState::Draining));
        assert!(valid_run_transition(&RunState::Draining, &RunState::RollingBack));
        assert!(!valid_run_transition(&RunState::RollingBack, &RunState::SteadyState));
        assert!(!valid_run_transition(&RunState::Initializing, &RunState::RolledBack));
    }

    #[test]
    fn rejected_transitions_name_both_states() {
        let err = check_run_transition(RunState::RolledBack, RunState::Scaling).unwrap_err();
        assert_eq!(err.to_string(), "invalid run transition from rolled_back to scaling");
        assert!(check_instance_transition(InstanceState::Draining, InstanceState::Stopped).is_ok());
    }
}
