use std::{collections::BTreeSet, fmt, net::Ipv4Addr, ops::RangeInclusive};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::deployment::types::CapacityBounds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Network,
    Subnet,
    Endpoint,
    SecurityRule,
    LoadBalancer,
    Listener,
    TargetGroup,
    Registry,
    TaskTemplate,
    Cluster,
    Service,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Network => "network",
            ResourceKind::Subnet => "subnet",
            ResourceKind::Endpoint => "endpoint",
            ResourceKind::SecurityRule => "security-rule",
            ResourceKind::LoadBalancer => "load-balancer",
            ResourceKind::Listener => "listener",
            ResourceKind::TargetGroup => "target-group",
            ResourceKind::Registry => "registry",
            ResourceKind::TaskTemplate => "task-template",
            ResourceKind::Cluster => "cluster",
            ResourceKind::Service => "service",
        }
    }

    /// Prefix of provider-assigned identifiers for this kind.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            ResourceKind::Network => "vpc",
            ResourceKind::Subnet => "subnet",
            ResourceKind::Endpoint => "vpce",
            ResourceKind::SecurityRule => "sg",
            ResourceKind::LoadBalancer => "alb",
            ResourceKind::Listener => "lsnr",
            ResourceKind::TargetGroup => "tg",
            ResourceKind::Registry => "repo",
            ResourceKind::TaskTemplate => "taskdef",
            ResourceKind::Cluster => "cluster",
            ResourceKind::Service => "svc",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubnetType {
    Public,
    PrivateIsolated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndpointType {
    Interface,
    Gateway,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    Http,
    Https,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetType {
    Ip,
    Instance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemovalPolicy {
    Retain,
    Destroy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuArchitecture {
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "arm64")]
    Arm64,
}

/// Source of traffic allowed by an ingress rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Peer {
    AnyIpv4,
    SecurityRule(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRule {
    pub peer: Peer,
    pub port: u16,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub cidr: String,
    pub max_azs: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetConfig {
    pub network: String,
    pub cidr_mask: u8,
    pub subnet_type: SubnetType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub network: String,
    pub subnet: Option<String>,
    pub service: String,
    pub endpoint_type: EndpointType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityRuleConfig {
    pub network: String,
    pub description: String,
    pub ingress: Vec<IngressRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    pub network: String,
    pub subnet: String,
    pub security_rule: String,
    pub name: String,
    pub internet_facing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub load_balancer: String,
    pub target_group: String,
    pub port: u16,
    pub open: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub path: String,
    pub interval_secs: u64,
    pub healthy_http_codes: String,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
}

impl HealthCheckConfig {
    /// Parses `healthy_http_codes`, e.g. `"200"`, `"200,202"` or `"200-299"`.
    pub fn healthy_codes(&self) -> Option<Vec<RangeInclusive<u16>>> {
        parse_http_codes(&self.healthy_http_codes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetGroupConfig {
    pub network: String,
    pub port: u16,
    pub protocol: Protocol,
    pub target_type: TargetType,
    pub health_check: HealthCheckConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub repository_name: String,
    pub removal_policy: RemovalPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub network: String,
    pub name: String,
    pub container_insights: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTemplateConfig {
    pub family: String,
    pub registry: String,
    pub tag: String,
    pub cpu: u32,
    pub memory_mib: u32,
    pub cpu_architecture: CpuArchitecture,
    pub container_name: String,
    pub port_mappings: Vec<PortMapping>,
    pub permissions: Vec<String>,
    pub log_stream_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub rollback: bool,
    pub failure_threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub cluster: String,
    pub task_template: String,
    pub target_group: String,
    pub listener: String,
    pub security_rule: String,
    pub subnet: String,
    pub desired_count: u32,
    pub min_healthy_percent: u32,
    pub max_healthy_percent: u32,
    pub circuit_breaker: CircuitBreakerConfig,
    pub enable_execute_command: bool,
}

/// Kind-specific configuration of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ResourceConfig {
    Network(NetworkConfig),
    Subnet(SubnetConfig),
    Endpoint(EndpointConfig),
    SecurityRule(SecurityRuleConfig),
    LoadBalancer(LoadBalancerConfig),
    Listener(ListenerConfig),
    TargetGroup(TargetGroupConfig),
    Registry(RegistryConfig),
    TaskTemplate(TaskTemplateConfig),
    Cluster(ClusterConfig),
    Service(ServiceConfig),
}

impl ResourceConfig {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceConfig::Network(_) => ResourceKind::Network,
            ResourceConfig::Subnet(_) => ResourceKind::Subnet,
            ResourceConfig::Endpoint(_) => ResourceKind::Endpoint,
            ResourceConfig::SecurityRule(_) => ResourceKind::SecurityRule,
            ResourceConfig::LoadBalancer(_) => ResourceKind::LoadBalancer,
            ResourceConfig::Listener(_) => ResourceKind::Listener,
            ResourceConfig::TargetGroup(_) => ResourceKind::TargetGroup,
            ResourceConfig::Registry(_) => ResourceKind::Registry,
            ResourceConfig::TaskTemplate(_) => ResourceKind::TaskTemplate,
            ResourceConfig::Cluster(_) => ResourceKind::Cluster,
            ResourceConfig::Service(_) => ResourceKind::Service,
        }
    }

    /// Logical names of the resources this configuration refers to.
    pub fn references(&self) -> Vec<&str> {
        match self {
            ResourceConfig::Network(_) | ResourceConfig::Registry(_) => vec![],
            ResourceConfig::Subnet(c) => vec![c.network.as_str()],
            ResourceConfig::Endpoint(c) => {
                let mut refs = vec![c.network.as_str()];
                refs.extend(c.subnet.as_deref());
                refs
            }
            ResourceConfig::SecurityRule(c) => {
                let mut refs = vec![c.network.as_str()];
                refs.extend(c.ingress.iter().filter_map(|rule| match &rule.peer {
                    Peer::SecurityRule(name) => Some(name.as_str()),
                    Peer::AnyIpv4 => None,
                }));
                refs
            }
            ResourceConfig::LoadBalancer(c) => vec![
                c.network.as_str(),
                c.subnet.as_str(),
                c.security_rule.as_str(),
            ],
            ResourceConfig::Listener(c) => vec![c.load_balancer.as_str(), c.target_group.as_str()],
            ResourceConfig::TargetGroup(c) => vec![c.network.as_str()],
            ResourceConfig::TaskTemplate(c) => vec![c.registry.as_str()],
            ResourceConfig::Cluster(c) => vec![c.network.as_str()],
            ResourceConfig::Service(c) => vec![
                c.cluster.as_str(),
                c.task_template.as_str(),
                c.target_group.as_str(),
                c.listener.as_str(),
                c.security_rule.as_str(),
                c.subnet.as_str(),
            ],
        }
    }

    /// Checks kind-specific constraints. Returns the reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            ResourceConfig::Network(c) => {
                let (_, prefix) =
                    parse_cidr(&c.cidr).ok_or_else(|| format!("invalid CIDR block {}", c.cidr))?;
                if !(16..=28).contains(&prefix) {
                    return Err(format!("network prefix /{prefix} outside /16../28"));
                }
                if c.max_azs == 0 {
                    return Err("max_azs must be at least 1".to_string());
                }
            }
            ResourceConfig::Subnet(c) => {
                if !(16..=28).contains(&c.cidr_mask) {
                    return Err(format!("subnet mask /{} outside /16../28", c.cidr_mask));
                }
            }
            ResourceConfig::Endpoint(c) => {
                if c.service.is_empty() {
                    return Err("endpoint service must not be empty".to_string());
                }
                if c.endpoint_type == EndpointType::Interface && c.subnet.is_none() {
                    return Err("interface endpoints must be placed in a subnet".to_string());
                }
            }
            ResourceConfig::SecurityRule(c) => {
                if let Some(rule) = c.ingress.iter().find(|rule| rule.port == 0) {
                    return Err(format!("ingress rule '{}' has port 0", rule.description));
                }
            }
            ResourceConfig::LoadBalancer(c) => {
                if c.name.is_empty() || c.name.len() > 32 {
                    return Err("load balancer name must be 1..=32 characters".to_string());
                }
            }
            ResourceConfig::Listener(c) => {
                if c.port == 0 {
                    return Err("listener port must be non-zero".to_string());
                }
            }
            ResourceConfig::TargetGroup(c) => {
                if c.port == 0 {
                    return Err("target group port must be non-zero".to_string());
                }
                let hc = &c.health_check;
                if !hc.path.starts_with('/') {
                    return Err(format!("health check path {} must start with '/'", hc.path));
                }
                if hc.interval_secs == 0 || hc.healthy_threshold == 0 || hc.unhealthy_threshold == 0 {
                    return Err("health check interval and thresholds must be at least 1".to_string());
                }
                if hc.healthy_codes().is_none() {
                    return Err(format!("invalid healthy HTTP codes {}", hc.healthy_http_codes));
                }
            }
            ResourceConfig::Registry(c) => {
                let valid = !c.repository_name.is_empty()
                    && c.repository_name
                        .chars()
                        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || "-_./".contains(ch));
                if !valid {
                    return Err(format!("invalid repository name {}", c.repository_name));
                }
            }
            ResourceConfig::TaskTemplate(c) => {
                if c.family.is_empty() || c.container_name.is_empty() {
                    return Err("task template family and container name are required".to_string());
                }
                if c.tag.is_empty() {
                    return Err("task template has no image tag".to_string());
                }
                if ![256, 512, 1024, 2048, 4096, 8192, 16384].contains(&c.cpu) {
                    return Err(format!("unsupported cpu units {}", c.cpu));
                }
                if c.memory_mib < 512 {
                    return Err(format!("memory {} MiB below 512 MiB", c.memory_mib));
                }
                if c.port_mappings.iter().any(|m| m.container_port == 0) {
                    return Err("container port must be non-zero".to_string());
                }
            }
            ResourceConfig::Cluster(c) => {
                if c.name.is_empty() {
                    return Err("cluster name must not be empty".to_string());
                }
            }
            ResourceConfig::Service(c) => {
                CapacityBounds::new(c.desired_count, c.min_healthy_percent, c.max_healthy_percent)
                    .map_err(|err| err.to_string())?;
                if c.circuit_breaker.failure_threshold == 0 {
                    return Err("circuit breaker threshold must be at least 1".to_string());
                }
            }
        }
        Ok(())
    }

    /// Whether moving from `self` to `next` changes an attribute that cannot be updated in place.
    pub fn requires_replacement(&self, next: &ResourceConfig) -> bool {
        match (self, next) {
            (ResourceConfig::Network(a), ResourceConfig::Network(b)) => a.cidr != b.cidr,
            (ResourceConfig::Subnet(a), ResourceConfig::Subnet(b)) => a != b,
            (ResourceConfig::Endpoint(a), ResourceConfig::Endpoint(b)) => {
                a.network != b.network || a.service != b.service || a.endpoint_type != b.endpoint_type
            }
            (ResourceConfig::SecurityRule(a), ResourceConfig::SecurityRule(b)) => a.network != b.network,
            (ResourceConfig::LoadBalancer(a), ResourceConfig::LoadBalancer(b)) => {
                a.network != b.network || a.name != b.name || a.internet_facing != b.internet_facing
            }
            (ResourceConfig::Listener(a), ResourceConfig::Listener(b)) => a.load_balancer != b.load_balancer,
            (ResourceConfig::TargetGroup(a), ResourceConfig::TargetGroup(b)) => {
                a.network != b.network
                    || a.port != b.port
                    || a.protocol != b.protocol
                    || a.target_type != b.target_type
            }
            (ResourceConfig::Registry(a), ResourceConfig::Registry(b)) => a.repository_name != b.repository_name,
            (ResourceConfig::Cluster(a), ResourceConfig::Cluster(b)) => a.network != b.network || a.name != b.name,
            // Templates are immutable: every change registers a new revision.
            (ResourceConfig::TaskTemplate(a), ResourceConfig::TaskTemplate(b)) => a != b,
            (ResourceConfig::Service(a), ResourceConfig::Service(b)) => a.name != b.name || a.cluster != b.cluster,
            _ => true,
        }
    }

    /// Whether superseded versions stay registered after a replacement. Task templates
    /// keep old revisions so a running service can return to them.
    pub fn keeps_revisions(&self) -> bool {
        matches!(self, ResourceConfig::TaskTemplate(_))
    }
}

/// A declared infrastructure unit in the provisioning graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    pub config: ResourceConfig,
    pub depends_on: BTreeSet<String>,
}

impl Resource {
    /// Creates a resource whose dependencies are the names its configuration refers to.
    pub fn new(name: impl Into<String>, config: ResourceConfig) -> Self {
        let depends_on = config.references().into_iter().map(str::to_string).collect();
        Resource {
            name: name.into(),
            config,
            depends_on,
        }
    }

    /// Adds an ordering edge that the configuration does not imply.
    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        self.depends_on.insert(name.into());
        self
    }

    pub fn kind(&self) -> ResourceKind {
        self.config.kind()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("resource '{0}' is already declared")]
    DuplicateName(String),
    #[error("dependency cycle: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },
    #[error("resource '{resource}' depends on undeclared resource '{missing}'")]
    DanglingReference { resource: String, missing: String },
    #[error("invalid configuration for '{resource}': {reason}")]
    InvalidConfig { resource: String, reason: String },
}

pub type GraphResult<T> = Result<T, GraphError>;

fn parse_cidr(cidr: &str) -> Option<(Ipv4Addr, u8)> {
    let (addr, prefix) = cidr.split_once('/')?;
    let addr: Ipv4Addr = addr.parse().ok()?;
    let prefix: u8 = prefix.parse().ok()?;
    (prefix <= 32).then_some((addr, prefix))
}

fn parse_http_codes(codes: &str) -> Option<Vec<RangeInclusive<u16>>> {
    let mut ranges = Vec::new();
    for part in codes.split(',').map(str::trim) {
        let range = match part.split_once('-') {
            Some((lo, hi)) => lo.trim().parse().ok()?..=hi.trim().parse().ok()?,
            None => {
                let code: u16 = part.parse().ok()?;
                code..=code
            }
        };
        if range.is_empty() || *range.start() < 100 || *range.end() > 599 {
            return None;
        }
        ranges.push(range);
    }
    Some(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_codes_accept_lists_and_ranges() {
        let codes = parse_http_codes("200, 202-204").unwrap();
        assert_eq!(codes, vec![200..=200, 202..=204]);
        assert!(parse_http_codes("").is_none());
        assert!(parse_http_codes("299-200").is_none());
        assert!(parse_http_codes("abc").is_none());
    }

    #[test]
    fn references_become_dependencies() {
        let listener = Resource::new(
            "listener",
            ResourceConfig::Listener(ListenerConfig {
                load_balancer: "alb".into(),
                target_group: "tg".into(),
                port: 80,
                open: true,
            }),
        )
        .with_dependency("extra");

        let deps: Vec<&str> = listener.depends_on.iter().map(String::as_str).collect();
        assert_eq!(deps, vec!["alb", "extra", "tg"]);
        assert_eq!(listener.kind(), ResourceKind::Listener);
    }

    #[test]
    fn network_cidr_change_requires_replacement() {
        let old = ResourceConfig::Network(NetworkConfig {
            cidr: "192.168.0.0/16".into(),
            max_azs: 3,
        });
        let more_azs = ResourceConfig::Network(NetworkConfig {
            cidr: "192.168.0.0/16".into(),
            max_azs: 2,
        });
        let new_cidr = ResourceConfig::Network(NetworkConfig {
            cidr: "10.0.0.0/16".into(),
            max_azs: 3,
        });

        assert!(!old.requires_replacement(&more_azs));
        assert!(old.requires_replacement(&new_cidr));
        assert!(old.validate().is_ok());
        assert!(
            ResourceConfig::Network(NetworkConfig {
                cidr: "192.168.0.0/33".into(),
                max_azs: 3
            })
            .validate()
            .is_err()
        );
    }
}
