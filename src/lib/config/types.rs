use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    graph::types::{CpuArchitecture, RemovalPolicy},
    publisher::types::ImageSource,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// In-memory collaborators; nothing leaves the process.
    #[default]
    Sim,
    /// Containers on the local Docker daemon behind an HTTP health checker.
    Docker,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub cidr: String,
    pub max_azs: u8,
    pub subnet_mask: u8,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        NetworkSettings {
            cidr: "192.168.0.0/16".to_string(),
            max_azs: 3,
            subnet_mask: 24,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerSettings {
    pub name: String,
    pub port: u16,
    pub internet_facing: bool,
}

impl Default for LoadBalancerSettings {
    fn default() -> Self {
        LoadBalancerSettings {
            name: "sample-cdk-bg-alb".to_string(),
            port: 80,
            internet_facing: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckSettings {
    pub path: String,
    pub interval_secs: u64,
    pub healthy_http_codes: String,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
    pub probe_attempts: u32,
    pub probe_backoff_ms: u64,
    pub probe_timeout_ms: u64,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        HealthCheckSettings {
            path: "/".to_string(),
            interval_secs: 60,
            healthy_http_codes: "200".to_string(),
            healthy_threshold: 5,
            unhealthy_threshold: 2,
            probe_attempts: 3,
            probe_backoff_ms: 500,
            probe_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSettings {
    pub repository: String,
    pub source: ImageSource,
    pub platform: CpuArchitecture,
    pub tag_length: usize,
    pub removal_policy: RemovalPolicy,
}

impl Default for ImageSettings {
    fn default() -> Self {
        ImageSettings {
            repository: "cdk-ecs-rolling-l2-sample-repo".to_string(),
            source: ImageSource::Directory(PathBuf::from("app")),
            platform: CpuArchitecture::Arm64,
            tag_length: 7,
            removal_policy: RemovalPolicy::Destroy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSettings {
    pub family: String,
    pub cpu: u32,
    pub memory_mib: u32,
    pub container_name: String,
    pub container_port: u16,
    pub permissions: Vec<String>,
    pub log_stream_prefix: String,
}

impl Default for TaskSettings {
    fn default() -> Self {
        TaskSettings {
            family: "sample-task".to_string(),
            cpu: 1024,
            memory_mib: 2048,
            container_name: "ecs-rolling-l2-container".to_string(),
            container_port: 80,
            permissions: [
                "ecr:GetAuthorizationToken",
                "ecr:BatchCheckLayerAvailability",
                "ecr:GetDownloadUrlForLayer",
                "ecr:BatchGetImage",
                "logs:CreateLogStream",
                "logs:PutLogEvents",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            log_stream_prefix: "ecs-rolling-l2".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentSettings {
    pub desired_count: u32,
    pub min_healthy_percent: u32,
    pub max_healthy_percent: u32,
    pub batch_size: Option<u32>,
    pub rollback: bool,
    pub failure_threshold: u32,
    pub batch_timeout_secs: u64,
    pub run_timeout_secs: u64,
    pub drain_grace_secs: u64,
    pub enable_execute_command: bool,
}

impl Default for DeploymentSettings {
    fn default() -> Self {
        DeploymentSettings {
            desired_count: 3,
            min_healthy_percent: 50,
            max_healthy_percent: 200,
            batch_size: None,
            rollback: true,
            failure_threshold: 2,
            batch_timeout_secs: 600,
            run_timeout_secs: 3600,
            drain_grace_secs: 300,
            enable_execute_command: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerSettings {
    /// Address published container ports are reachable on.
    pub host: String,
}

impl Default for DockerSettings {
    fn default() -> Self {
        DockerSettings {
            host: "127.0.0.1".to_string(),
        }
    }
}

/// One stack: the infrastructure around a single load-balanced service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: String,
    pub cluster: String,
    pub backend: Backend,
    pub state_dir: PathBuf,
    pub container_insights: bool,
    pub network: NetworkSettings,
    pub load_balancer: LoadBalancerSettings,
    pub health_check: HealthCheckSettings,
    pub image: ImageSettings,
    pub task: TaskSettings,
    pub deployment: DeploymentSettings,
    pub docker: DockerSettings,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            service: "ecs-rolling-l2-service".to_string(),
            cluster: "SAMPLE-ECSCluster".to_string(),
            backend: Backend::default(),
            state_dir: PathBuf::from(".r_deploy"),
            container_insights: true,
            network: NetworkSettings::default(),
            load_balancer: LoadBalancerSettings::default(),
            health_check: HealthCheckSettings::default(),
            image: ImageSettings::default(),
            task: TaskSettings::default(),
            deployment: DeploymentSettings::default(),
            docker: DockerSettings::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;
