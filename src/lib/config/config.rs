use std::{fs::File, path::Path, time::Duration};

use tracing::debug;

use super::types::{Config, ConfigError, ConfigResult};
use crate::{
    deployment::types::{CapacityBounds, DeploymentTimeouts, HealthCheckSettings, RollbackPolicy},
    publisher::tag::MIN_TAG_LENGTH,
};

impl Config {
    /// Reads a YAML config. Missing fields take their defaults.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let file = File::open(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_yaml::from_reader(file)?;
        config.validate()?;
        debug!(path = %path.display(), service = %config.service, "loaded config");
        Ok(config)
    }

    /// Loads `path` when given, otherwise the defaults.
    pub fn load_or_default(path: Option<&Path>) -> ConfigResult<Self> {
        match path {
            Some(path) => Config::load(path),
            None => Ok(Config::default()),
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.service.is_empty() || self.cluster.is_empty() {
            return Err(ConfigError::Invalid("service and cluster names are required".to_string()));
        }
        let deployment = &self.deployment;
        CapacityBounds::new(
            deployment.desired_count,
            deployment.min_healthy_percent,
            deployment.max_healthy_percent,
        )
        .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        if deployment.batch_size == Some(0) {
            return Err(ConfigError::Invalid("batch_size must be at least 1".to_string()));
        }
        if deployment.failure_threshold == 0 {
            return Err(ConfigError::Invalid("failure_threshold must be at least 1".to_string()));
        }
        if deployment.batch_timeout_secs == 0 || deployment.run_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".to_string()));
        }
        if self.image.tag_length < MIN_TAG_LENGTH {
            return Err(ConfigError::Invalid(format!(
                "tag_length {} is below {MIN_TAG_LENGTH}",
                self.image.tag_length
            )));
        }
        if self.health_check.probe_attempts == 0 {
            return Err(ConfigError::Invalid("probe_attempts must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn health_settings(&self) -> HealthCheckSettings {
        let hc = &self.health_check;
        HealthCheckSettings {
            path: hc.path.clone(),
            interval: Duration::from_secs(hc.interval_secs),
            healthy_threshold: hc.healthy_threshold,
            unhealthy_threshold: hc.unhealthy_threshold,
            probe_attempts: hc.probe_attempts,
            probe_backoff: Duration::from_millis(hc.probe_backoff_ms),
        }
    }

    pub fn timeouts(&self) -> DeploymentTimeouts {
        let deployment = &self.deployment;
        DeploymentTimeouts {
            batch: Duration::from_secs(deployment.batch_timeout_secs),
            run: Duration::from_secs(deployment.run_timeout_secs),
            drain_grace: Duration::from_secs(deployment.drain_grace_secs),
        }
    }

    pub fn rollback_policy(&self) -> RollbackPolicy {
        RollbackPolicy {
            enabled: self.deployment.rollback,
            failure_threshold: self.deployment.failure_threshold,
        }
    }

    /// Healthy status codes expanded from ranges, for the HTTP health checker.
    pub fn healthy_codes(&self) -> ConfigResult<Vec<u16>> {
        let config = crate::graph::types::HealthCheckConfig {
            path: self.health_check.path.clone(),
            interval_secs: self.health_check.interval_secs,
            healthy_http_codes: self.health_check.healthy_http_codes.clone(),
            healthy_threshold: self.health_check.healthy_threshold,
            unhealthy_threshold: self.health_check.unhealthy_threshold,
        };
        let ranges = config.healthy_codes().ok_or_else(|| {
            ConfigError::Invalid(format!(
                "invalid healthy HTTP codes {}",
                self.health_check.healthy_http_codes
            ))
        })?;
        Ok(ranges.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::{config::types::Backend, graph::types::CpuArchitecture};

    #[test]
    fn partial_files_fall_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "service: web\nbackend: docker\ndeployment:\n  desired_count: 4\nimage:\n  platform: x86_64"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.service, "web");
        assert_eq!(config.backend, Backend::Docker);
        assert_eq!(config.deployment.desired_count, 4);
        assert_eq!(config.deployment.min_healthy_percent, 50);
        assert_eq!(config.image.platform, CpuArchitecture::X86_64);
        assert_eq!(config.cluster, "SAMPLE-ECSCluster");
        assert_eq!(config.health_check.interval_secs, 60);
    }

    #[test]
    fn invalid_bounds_are_rejected_on_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "deployment:\n  min_healthy_percent: 100\n  max_healthy_percent: 100").unwrap();
        assert!(matches!(Config::load(file.path()), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn short_tags_are_rejected() {
        let mut config = Config::default();
        config.image.tag_length = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn healthy_code_ranges_expand() {
        let mut config = Config::default();
        config.health_check.healthy_http_codes = "200-202,204".to_string();
        assert_eq!(config.healthy_codes().unwrap(), vec![200, 201, 202, 204]);
    }
}
