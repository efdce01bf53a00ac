use std::collections::HashMap;

use async_trait::async_trait;
use bollard::{
    Docker,
    container::{
        Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions, StartContainerOptions,
        StopContainerOptions,
    },
    errors::Error as DockerError,
    image::CreateImageOptions,
    secret::HostConfig,
};
use futures_util::stream::StreamExt;
use tracing::{debug, info, trace};
use uuid::Uuid;

use super::types::{ClusterRuntime, InstanceHandle, RuntimeError, RuntimeResult};
use crate::deployment::types::{TaskTemplate, TemplateVersion};

const SERVICE_LABEL: &str = "r_deploy.service";
const FAMILY_LABEL: &str = "r_deploy.family";
const REVISION_LABEL: &str = "r_deploy.revision";

/// Seconds a container gets to exit after SIGTERM.
const STOP_TIMEOUT_SECS: i64 = 10;

/// Maps bollard failures onto the retry split the controller understands.
pub(crate) fn classify(err: DockerError) -> RuntimeError {
    match err {
        DockerError::DockerResponseServerError { status_code, message } if status_code >= 500 || status_code == 429 => {
            RuntimeError::Transient(format!("docker daemon returned {status_code}: {message}"))
        }
        DockerError::DockerResponseServerError { status_code, message } => {
            RuntimeError::Fatal(format!("docker daemon returned {status_code}: {message}"))
        }
        err @ (DockerError::RequestTimeoutError | DockerError::IOError { .. }) => {
            RuntimeError::Transient(err.to_string())
        }
        err => RuntimeError::Fatal(err.to_string()),
    }
}

fn is_not_found(err: &DockerError) -> bool {
    matches!(err, DockerError::DockerResponseServerError { status_code: 404, .. })
}

/// Runs service instances as local containers, one container per instance.
pub struct DockerRuntime {
    client: Docker,
    /// Host address the published container ports are reachable on.
    host: String,
}

impl DockerRuntime {
    pub fn connect(host: impl Into<String>) -> RuntimeResult<Self> {
        let client = Docker::connect_with_defaults().map_err(classify)?;
        Ok(DockerRuntime {
            client,
            host: host.into(),
        })
    }

    pub(crate) fn client(&self) -> &Docker {
        &self.client
    }

    async fn pull_if_missing(&self, image: &str) -> RuntimeResult<()> {
        if self.client.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!(image, "pulling image");
        let mut stream = self.client.create_image(
            Some(CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(msg) = stream.next().await {
            let progress = msg.map_err(classify)?;
            if let Some(status) = progress.status {
                trace!(image, %status, "pull progress");
            }
        }
        Ok(())
    }

    async fn published_address(&self, container_id: &str) -> RuntimeResult<Option<String>> {
        let response = self
            .client
            .inspect_container(container_id, None)
            .await
            .map_err(classify)?;

        let port = response
            .network_settings
            .and_then(|settings| settings.ports)
            .into_iter()
            .flat_map(|ports| ports.into_values())
            .flatten()
            .flatten()
            .find_map(|binding| binding.host_port.and_then(|port| port.parse::<u16>().ok()));

        Ok(port.map(|port| format!("{}:{port}", self.host)))
    }
}

fn labels(service: &str, version: &TemplateVersion) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    labels.insert(SERVICE_LABEL.to_string(), service.to_string());
    labels.insert(FAMILY_LABEL.to_string(), version.family.clone());
    labels.insert(REVISION_LABEL.to_string(), version.revision.to_string());
    labels
}

fn version_from_labels(labels: &HashMap<String, String>) -> Option<TemplateVersion> {
    Some(TemplateVersion {
        family: labels.get(FAMILY_LABEL)?.clone(),
        revision: labels.get(REVISION_LABEL)?.parse().ok()?,
    })
}

#[async_trait]
impl ClusterRuntime for DockerRuntime {
    async fn launch_instance(&self, service: &str, template: &TaskTemplate) -> RuntimeResult<InstanceHandle> {
        self.pull_if_missing(&template.image).await?;

        let version = template.version();
        let exposed_ports = template
            .port_mappings
            .iter()
            .map(|mapping| (format!("{}/tcp", mapping.container_port), HashMap::new()))
            .collect::<HashMap<_, _>>();

        let host_config = HostConfig {
            // 1024 CPU units make one vCPU.
            nano_cpus: Some(i64::from(template.cpu) * 1_000_000_000 / 1024),
            memory: Some(i64::from(template.memory_mib) * 1024 * 1024),
            publish_all_ports: Some(true),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(template.image.clone()),
            env: Some(vec![
                format!("EXECUTION_IDENTITY={}", template.execution_identity),
                format!("LOG_STREAM_PREFIX={}", template.log_stream_prefix),
            ]),
            exposed_ports: Some(exposed_ports),
            labels: Some(labels(service, &version)),
            host_config: Some(host_config),
            ..Default::default()
        };

        let name = format!(
            "{service}-{}-{}-{}",
            version.family,
            version.revision,
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let created = self
            .client
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(classify)?;
        debug!(container = %created.id, %name, "container created");

        self.client
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(classify)?;
        info!(container = %created.id, %version, "container started");

        Ok(InstanceHandle {
            address: self.published_address(&created.id).await?,
            id: created.id,
            service: service.to_string(),
            version,
        })
    }

    async fn stop_instance(&self, handle: &InstanceHandle) -> RuntimeResult<()> {
        debug!(container = %handle.id, "stopping container");
        match self
            .client
            .stop_container(&handle.id, Some(StopContainerOptions { t: STOP_TIMEOUT_SECS }))
            .await
        {
            Ok(()) => {}
            Err(err) if is_not_found(&err) => return Ok(()),
            Err(err) => return Err(classify(err)),
        }

        match self
            .client
            .remove_container(
                &handle.id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Err(err) if !is_not_found(&err) => Err(classify(err)),
            _ => Ok(()),
        }
    }

    async fn list_instances(&self, service: &str) -> RuntimeResult<Vec<InstanceHandle>> {
        let service_label = format!("{SERVICE_LABEL}={service}");
        let options = ListContainersOptions {
            filters: vec![("label", vec![service_label.as_str()]), ("status", vec!["running"])]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        let containers = self.client.list_containers(Some(options)).await.map_err(classify)?;

        let mut handles = Vec::new();
        for container in containers {
            let (Some(id), Some(labels)) = (container.id, container.labels) else {
                continue;
            };
            let Some(version) = version_from_labels(&labels) else {
                debug!(container = %id, "container has no template labels; skipping");
                continue;
            };
            let address = container
                .ports
                .unwrap_or_default()
                .into_iter()
                .find_map(|port| port.public_port)
                .map(|port| format!("{}:{port}", self.host));

            let handle = InstanceHandle {
                id,
                service: service.to_string(),
                version,
                address,
            };
            handles.push((container.created.unwrap_or_default(), handle));
        }
        // Oldest first, so drains retire the longest-running instances.
        handles.sort_by_key(|(created, _)| *created);
        Ok(handles.into_iter().map(|(_, handle)| handle).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_transient() {
        let err = classify(DockerError::DockerResponseServerError {
            status_code: 503,
            message: "busy".into(),
        });
        assert!(err.is_transient());

        let err = classify(DockerError::DockerResponseServerError {
            status_code: 409,
            message: "conflict".into(),
        });
        assert!(!err.is_transient());
    }

    #[test]
    fn labels_carry_the_template_version() {
        let version = TemplateVersion {
            family: "web".into(),
            revision: 4,
        };
        let labels = labels("svc", &version);
        assert_eq!(labels.get(SERVICE_LABEL).map(String::as_str), Some("svc"));
        assert_eq!(version_from_labels(&labels), Some(version));
    }
}
