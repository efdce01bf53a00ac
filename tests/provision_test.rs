use std::{collections::BTreeMap, sync::Arc};

use r_deploy::{
    config::{Config, build_graph, service_spec, set_image_tag},
    graph::types::RemovalPolicy,
    provisioner::{Action, DestroyOptions, ProvisionError, Provisioner, ResolvedState},
    sim::{SimProvider, StaticIdentity},
};

fn provider() -> Arc<SimProvider> {
    Arc::new(SimProvider::new(Arc::new(StaticIdentity::new("test"))))
}

async fn provisioned(config: &Config, provider: Arc<SimProvider>) -> ResolvedState {
    let provisioner = Provisioner::new(provider);
    let graph = build_graph(config).unwrap();
    let plan = provisioner.plan(&graph, &ResolvedState::default()).unwrap();
    let (state, _) = provisioner.apply(&plan, ResolvedState::default()).await.unwrap();
    state
}

#[tokio::test]
async fn fresh_stack_is_created_in_dependency_order() {
    let provider = provider();
    let provisioner = Provisioner::new(provider.clone());
    let graph = build_graph(&Config::default()).unwrap();

    let plan = provisioner.plan(&graph, &ResolvedState::default()).unwrap();
    assert_eq!(plan.steps.len(), 16);
    assert_eq!(plan.count(Action::Create), 16);

    // Every resource comes after everything it depends on.
    let position: BTreeMap<&str, usize> = plan.order().enumerate().map(|(i, name)| (name, i)).collect();
    for step in &plan.steps {
        for dep in &step.resource.depends_on {
            assert!(position[dep.as_str()] < position[step.name.as_str()], "{dep} before {}", step.name);
        }
    }

    let (state, report) = provisioner.apply(&plan, ResolvedState::default()).await.unwrap();
    assert_eq!(report.applied.len(), 16);
    assert_eq!(state.resources.len(), 16);
    assert_eq!(provider.calls().await.creates, 16);

    let listener = state.get("listener").unwrap();
    assert_eq!(listener.inputs.get("alb").map(String::as_str), state.id_of("alb"));
    assert_eq!(state.get("registry").unwrap().output("uri"), Some("cdk-ecs-rolling-l2-sample-repo"));

    let replan = provisioner.plan(&graph, &state).unwrap();
    assert!(!replan.has_changes());

    // Applying the unchanged graph again touches nothing.
    let calls = provider.calls().await;
    let (again, report) = provisioner.apply(&replan, state.clone()).await.unwrap();
    assert_eq!(provider.calls().await, calls);
    assert_eq!(report.skipped.len(), 16);
    assert!(report.applied.is_empty());
    assert_eq!(again, state);
}

#[tokio::test]
async fn failed_apply_resumes_without_repeating_completed_steps() {
    let provider = provider();
    let provisioner = Provisioner::new(provider.clone());
    let graph = build_graph(&Config::default()).unwrap();
    provider.fail_next("alb", 1).await;

    let plan = provisioner.plan(&graph, &ResolvedState::default()).unwrap();
    let err = provisioner.apply(&plan, ResolvedState::default()).await.unwrap_err();
    let ProvisionError::PartialApply(partial) = &err else {
        panic!("expected a partial apply, got {err}");
    };
    assert_eq!(partial.failed_step, "alb");
    assert!(partial.state.get("alb").is_none());
    assert!(partial.state.get("listener").is_none());
    assert!(partial.state.get("sg-app").is_some());
    assert_eq!(partial.state.resources.len(), 13);

    let state = err.resumable_state().unwrap().clone();
    let retry_plan = provisioner.plan(&graph, &state).unwrap();
    assert_eq!(retry_plan.count(Action::Create), 3);

    let (state, _) = provisioner.apply(&retry_plan, state).await.unwrap();
    assert_eq!(state.resources.len(), 16);
    // Sixteen creates plus the failed attempt; nothing was created twice.
    assert_eq!(provider.calls().await.creates, 17);
    assert_eq!(provider.live_ids().await.len(), 16);
}

#[tokio::test]
async fn new_image_tag_replaces_the_template_and_keeps_the_old_revision() {
    let provider = provider();
    let config = Config::default();
    let state = provisioned(&config, provider.clone()).await;
    let old_template = state.id_of("task-template").unwrap().to_string();

    let provisioner = Provisioner::new(provider.clone());
    let mut graph = build_graph(&config).unwrap();
    set_image_tag(&mut graph, "abc1234").unwrap();

    let plan = provisioner.plan(&graph, &state).unwrap();
    assert_eq!(plan.count(Action::Replace), 1);
    assert_eq!(plan.count(Action::Update), 1);
    let service = plan.steps.iter().find(|s| s.name == "service").unwrap();
    assert_eq!(service.action, Action::Update);

    let (state, report) = provisioner.apply(&plan, state).await.unwrap();
    assert_eq!(
        report.applied,
        vec![("task-template".to_string(), Action::Replace), ("service".to_string(), Action::Update)]
    );
    assert!(report.deleted.is_empty());
    assert!(state.retired.is_empty());
    assert_ne!(state.id_of("task-template"), Some(old_template.as_str()));
    assert_eq!(state.get("service").unwrap().output("task_template"), Some("sample-task:2"));

    // The previous revision is still registered, ready for a rollback.
    assert!(provider.deletions().await.is_empty());
    assert!(provider.live_ids().await.contains(&old_template));
    let kept: Vec<&str> = state.revisions.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(kept, vec![old_template.as_str()]);

    let spec = service_spec(&config, &state).unwrap();
    assert_eq!(spec.template.revision, 2);
    assert_eq!(spec.template.image, "cdk-ecs-rolling-l2-sample-repo:abc1234");
    assert_eq!(spec.desired_count, 3);
}

#[tokio::test]
async fn returning_to_a_kept_revision_reuses_it() {
    let provider = provider();
    let config = Config::default();
    let state = provisioned(&config, provider.clone()).await;
    let stable = state.id_of("task-template").unwrap().to_string();
    let provisioner = Provisioner::new(provider.clone());

    let mut next = build_graph(&config).unwrap();
    set_image_tag(&mut next, "abc1234").unwrap();
    let plan = provisioner.plan(&next, &state).unwrap();
    let (state, _) = provisioner.apply(&plan, state).await.unwrap();
    let failed = state.id_of("task-template").unwrap().to_string();
    let creates = provider.calls().await.creates;

    let previous = build_graph(&config).unwrap();
    let plan = provisioner.plan(&previous, &state).unwrap();
    let (state, report) = provisioner.apply(&plan, state).await.unwrap();
    assert_eq!(report.restored, vec!["task-template".to_string()]);
    assert_eq!(provider.calls().await.creates, creates);
    assert_eq!(state.id_of("task-template"), Some(stable.as_str()));
    assert_eq!(state.get("service").unwrap().output("task_template"), Some("sample-task:1"));
    assert_eq!(service_spec(&config, &state).unwrap().template.revision, 1);
    let kept: Vec<&str> = state.revisions.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(kept, vec![failed.as_str()]);

    // Tearing the stack down takes the kept revisions with it.
    let (state, report) = provisioner
        .destroy(&previous, state, DestroyOptions::default())
        .await
        .unwrap();
    assert!(state.is_empty());
    assert_eq!(report.revisions, vec![failed]);
    assert!(provider.live_ids().await.is_empty());
}

#[tokio::test]
async fn destroy_refuses_to_orphan_dependents_unless_forced() {
    let provider = provider();
    let config = Config::default();
    let state = provisioned(&config, provider.clone()).await;
    let provisioner = Provisioner::new(provider.clone());
    let graph = build_graph(&config).unwrap();
    let targets = graph.subgraph(["target-group"]);

    let err = provisioner
        .destroy(&targets, state.clone(), DestroyOptions::default())
        .await
        .unwrap_err();
    let ProvisionError::DependentsRemain { resource, mut dependents } = err else {
        panic!("expected dependents to block the destroy");
    };
    dependents.sort();
    assert_eq!(resource, "target-group");
    assert_eq!(dependents, vec!["listener".to_string(), "service".to_string()]);
    assert_eq!(provider.calls().await.deletes, 0);

    let (state, report) = provisioner
        .destroy(&targets, state, DestroyOptions { force: true })
        .await
        .unwrap();
    assert_eq!(report.deleted, vec!["service", "listener", "target-group"]);
    assert_eq!(state.resources.len(), 13);
    assert!(state.get("alb").is_some());
}

#[tokio::test]
async fn retained_registry_survives_a_full_destroy() {
    let provider = provider();
    let mut config = Config::default();
    config.image.removal_policy = RemovalPolicy::Retain;
    let state = provisioned(&config, provider.clone()).await;

    let provisioner = Provisioner::new(provider.clone());
    let graph = build_graph(&config).unwrap();
    let (state, report) = provisioner.destroy(&graph, state, DestroyOptions::default()).await.unwrap();

    assert!(state.is_empty());
    assert_eq!(report.retained, vec!["registry".to_string()]);
    assert_eq!(report.deleted.len(), 15);
    assert_eq!(report.deleted.first().map(String::as_str), Some("service"));
    let position = |name: &str| report.deleted.iter().position(|n| n == name).unwrap();
    assert!(position("alb") < position("subnet-ingress"));
    assert!(position("subnet-private") < position("vpc"));
    assert!(position("sg-app") < position("sg-elb"));
    assert_eq!(provider.live_ids().await.len(), 1);
}
