//! The standard stack: network, load balancer, registry and a rolling service.

use tracing::debug;

use super::types::{Config, ConfigError, ConfigResult};
use crate::{
    deployment::types::{ServiceSpec, TaskTemplate},
    graph::{
        ResourceGraph,
        types::{
            CircuitBreakerConfig, ClusterConfig, EndpointConfig, EndpointType, GraphError, GraphResult,
            HealthCheckConfig, IngressRule, ListenerConfig, LoadBalancerConfig, NetworkConfig, Peer, PortMapping,
            Protocol, RegistryConfig, Resource, ResourceConfig, SecurityRuleConfig, ServiceConfig, SubnetConfig,
            SubnetType, TargetGroupConfig, TargetType, TaskTemplateConfig,
        },
    },
    provisioner::types::ResolvedState,
};

pub const NETWORK: &str = "vpc";
pub const INGRESS_SUBNET: &str = "subnet-ingress";
pub const PRIVATE_SUBNET: &str = "subnet-private";
pub const ELB_SECURITY_RULE: &str = "sg-elb";
pub const APP_SECURITY_RULE: &str = "sg-app";
pub const LOAD_BALANCER: &str = "alb";
pub const TARGET_GROUP: &str = "target-group";
pub const LISTENER: &str = "listener";
pub const REGISTRY: &str = "registry";
pub const CLUSTER: &str = "cluster";
pub const TASK_TEMPLATE: &str = "task-template";
pub const SERVICE: &str = "service";

/// Tag a fresh graph carries until an artifact is published.
pub const UNPUBLISHED_TAG: &str = "unpublished";

const INTERFACE_ENDPOINTS: [(&str, &str); 3] = [
    ("endpoint-ecr", "ecr.api"),
    ("endpoint-ecr-dkr", "ecr.dkr"),
    ("endpoint-logs", "logs"),
];

fn endpoint(service: &str, subnet: Option<&str>, endpoint_type: EndpointType) -> ResourceConfig {
    ResourceConfig::Endpoint(EndpointConfig {
        network: NETWORK.to_string(),
        subnet: subnet.map(str::to_string),
        service: service.to_string(),
        endpoint_type,
    })
}

fn http_ingress(peer: Peer, port: u16, description: &str) -> IngressRule {
    IngressRule {
        peer,
        port,
        description: description.to_string(),
    }
}

/// Builds the full resource graph for `config`. The task template carries
/// [`UNPUBLISHED_TAG`] until [`set_image_tag`] points it at an artifact.
pub fn build_graph(config: &Config) -> GraphResult<ResourceGraph> {
    let mut graph = ResourceGraph::new();
    let port = config.load_balancer.port;
    let container_port = config.task.container_port;

    graph.add_resource(Resource::new(
        NETWORK,
        ResourceConfig::Network(NetworkConfig {
            cidr: config.network.cidr.clone(),
            max_azs: config.network.max_azs,
        }),
    ))?;
    for (name, subnet_type) in [
        (INGRESS_SUBNET, SubnetType::Public),
        (PRIVATE_SUBNET, SubnetType::PrivateIsolated),
    ] {
        graph.add_resource(Resource::new(
            name,
            ResourceConfig::Subnet(SubnetConfig {
                network: NETWORK.to_string(),
                cidr_mask: config.network.subnet_mask,
                subnet_type,
            }),
        ))?;
    }

    for (name, service) in INTERFACE_ENDPOINTS {
        graph.add_resource(Resource::new(
            name,
            endpoint(service, Some(PRIVATE_SUBNET), EndpointType::Interface),
        ))?;
    }
    graph.add_resource(Resource::new("endpoint-s3", endpoint("s3", None, EndpointType::Gateway)))?;

    graph.add_resource(Resource::new(
        ELB_SECURITY_RULE,
        ResourceConfig::SecurityRule(SecurityRuleConfig {
            network: NETWORK.to_string(),
            description: "Security group ELB".to_string(),
            ingress: vec![http_ingress(Peer::AnyIpv4, port, "Allow HTTP traffic from the world")],
        }),
    ))?;
    graph.add_resource(Resource::new(
        APP_SECURITY_RULE,
        ResourceConfig::SecurityRule(SecurityRuleConfig {
            network: NETWORK.to_string(),
            description: "Security group APP".to_string(),
            ingress: vec![http_ingress(
                Peer::SecurityRule(ELB_SECURITY_RULE.to_string()),
                container_port,
                "Allow HTTP traffic from the load balancer",
            )],
        }),
    ))?;

    graph.add_resource(Resource::new(
        LOAD_BALANCER,
        ResourceConfig::LoadBalancer(LoadBalancerConfig {
            network: NETWORK.to_string(),
            subnet: INGRESS_SUBNET.to_string(),
            security_rule: ELB_SECURITY_RULE.to_string(),
            name: config.load_balancer.name.clone(),
            internet_facing: config.load_balancer.internet_facing,
        }),
    ))?;

    let hc = &config.health_check;
    graph.add_resource(Resource::new(
        TARGET_GROUP,
        ResourceConfig::TargetGroup(TargetGroupConfig {
            network: NETWORK.to_string(),
            port: container_port,
            protocol: Protocol::Http,
            target_type: TargetType::Ip,
            health_check: HealthCheckConfig {
                path: hc.path.clone(),
                interval_secs: hc.interval_secs,
                healthy_http_codes: hc.healthy_http_codes.clone(),
                healthy_threshold: hc.healthy_threshold,
                unhealthy_threshold: hc.unhealthy_threshold,
            },
        }),
    ))?;
    graph.add_resource(Resource::new(
        LISTENER,
        ResourceConfig::Listener(ListenerConfig {
            load_balancer: LOAD_BALANCER.to_string(),
            target_group: TARGET_GROUP.to_string(),
            port,
            open: true,
        }),
    ))?;

    graph.add_resource(Resource::new(
        REGISTRY,
        ResourceConfig::Registry(RegistryConfig {
            repository_name: config.image.repository.clone(),
            removal_policy: config.image.removal_policy,
        }),
    ))?;
    graph.add_resource(Resource::new(
        CLUSTER,
        ResourceConfig::Cluster(ClusterConfig {
            network: NETWORK.to_string(),
            name: config.cluster.clone(),
            container_insights: config.container_insights,
        }),
    ))?;

    let task = &config.task;
    graph.add_resource(Resource::new(
        TASK_TEMPLATE,
        ResourceConfig::TaskTemplate(TaskTemplateConfig {
            family: task.family.clone(),
            registry: REGISTRY.to_string(),
            tag: UNPUBLISHED_TAG.to_string(),
            cpu: task.cpu,
            memory_mib: task.memory_mib,
            cpu_architecture: config.image.platform,
            container_name: task.container_name.clone(),
            port_mappings: vec![PortMapping {
                container_port,
                host_port: container_port,
            }],
            permissions: task.permissions.clone(),
            log_stream_prefix: task.log_stream_prefix.clone(),
        }),
    ))?;

    let deployment = &config.deployment;
    // Instances only start once the private subnet can reach the registry.
    let service = INTERFACE_ENDPOINTS.iter().fold(
        Resource::new(
            SERVICE,
            ResourceConfig::Service(ServiceConfig {
                name: config.service.clone(),
                cluster: CLUSTER.to_string(),
                task_template: TASK_TEMPLATE.to_string(),
                target_group: TARGET_GROUP.to_string(),
                listener: LISTENER.to_string(),
                security_rule: APP_SECURITY_RULE.to_string(),
                subnet: PRIVATE_SUBNET.to_string(),
                desired_count: deployment.desired_count,
                min_healthy_percent: deployment.min_healthy_percent,
                max_healthy_percent: deployment.max_healthy_percent,
                circuit_breaker: CircuitBreakerConfig {
                    rollback: deployment.rollback,
                    failure_threshold: deployment.failure_threshold,
                },
                enable_execute_command: deployment.enable_execute_command,
            }),
        ),
        |service, (name, _)| service.with_dependency(*name),
    );
    graph.add_resource(service)?;

    graph.validate()?;
    debug!(resources = graph.len(), "built stack graph");
    Ok(graph)
}

/// Points the task template at a published tag.
pub fn set_image_tag(graph: &mut ResourceGraph, tag: &str) -> GraphResult<()> {
    let dangling = || GraphError::DanglingReference {
        resource: SERVICE.to_string(),
        missing: TASK_TEMPLATE.to_string(),
    };
    let resource = graph.get_mut(TASK_TEMPLATE).ok_or_else(dangling)?;
    match &mut resource.config {
        ResourceConfig::TaskTemplate(template) => {
            template.tag = tag.to_string();
            Ok(())
        }
        _ => Err(GraphError::InvalidConfig {
            resource: TASK_TEMPLATE.to_string(),
            reason: "not a task template".to_string(),
        }),
    }
}

/// The tag the task template was last applied with, if any.
pub fn applied_image_tag(state: &ResolvedState) -> Option<&str> {
    match &state.get(TASK_TEMPLATE)?.config {
        ResourceConfig::TaskTemplate(template) if template.tag != UNPUBLISHED_TAG => Some(&template.tag),
        _ => None,
    }
}

/// Builds the service's desired state from the applied task template.
pub fn service_spec(config: &Config, state: &ResolvedState) -> ConfigResult<ServiceSpec> {
    let applied = state
        .get(TASK_TEMPLATE)
        .ok_or_else(|| ConfigError::Invalid(format!("'{TASK_TEMPLATE}' has not been applied")))?;
    let ResourceConfig::TaskTemplate(template) = &applied.config else {
        return Err(ConfigError::Invalid(format!("'{TASK_TEMPLATE}' is not a task template")));
    };
    let output = |key: &str| {
        applied
            .output(key)
            .map(str::to_string)
            .ok_or_else(|| ConfigError::Invalid(format!("'{TASK_TEMPLATE}' has no '{key}' output")))
    };
    let revision = output("revision")?
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("'{TASK_TEMPLATE}' has a malformed revision")))?;

    Ok(ServiceSpec {
        name: config.service.clone(),
        cluster: config.cluster.clone(),
        template: TaskTemplate {
            family: output("family")?,
            revision,
            image: output("image")?,
            cpu: template.cpu,
            memory_mib: template.memory_mib,
            cpu_architecture: template.cpu_architecture,
            container_name: template.container_name.clone(),
            port_mappings: template.port_mappings.clone(),
            execution_identity: output("execution_identity")?,
            log_stream_prefix: template.log_stream_prefix.clone(),
        },
        desired_count: config.deployment.desired_count,
        min_healthy_percent: config.deployment.min_healthy_percent,
        max_healthy_percent: config.deployment.max_healthy_percent,
        batch_size: config.deployment.batch_size,
        rollback: config.rollback_policy(),
        health: config.health_settings(),
        timeouts: config.timeouts(),
    })
}
