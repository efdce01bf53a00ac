use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bollard::{
    Docker,
    image::{ListImagesOptions, RemoveImageOptions, TagImageOptions},
};
use tracing::{debug, info};

use super::{
    docker::{DockerRuntime, classify},
    types::{RuntimeError, RuntimeResult},
};
use crate::{
    graph::types::CpuArchitecture,
    publisher::types::{
        BuildContext, BuiltImage, Digest, ImageBuilder, ImageRegistry, ImageSource, PublishError, PublishResult,
    },
};

/// Treats the local Docker image store as the image registry. Image ids double as
/// content digests.
pub struct DockerImageStore {
    client: Docker,
}

impl DockerImageStore {
    pub fn new(client: Docker) -> Self {
        DockerImageStore { client }
    }

    /// Shares the daemon connection of a cluster runtime.
    pub fn for_runtime(runtime: &DockerRuntime) -> Self {
        Self::new(runtime.client().clone())
    }
}

fn parse_digest(id: String) -> RuntimeResult<Digest> {
    Digest::try_from(id).map_err(RuntimeError::Fatal)
}

fn docker_architecture(platform: CpuArchitecture) -> &'static str {
    match platform {
        CpuArchitecture::X86_64 => "amd64",
        CpuArchitecture::Arm64 => "arm64",
    }
}

#[async_trait]
impl ImageRegistry for DockerImageStore {
    async fn index(&self, repository: &str) -> RuntimeResult<BTreeMap<String, Digest>> {
        let mut filters = HashMap::new();
        filters.insert("reference", vec![repository]);
        let images = self
            .client
            .list_images(Some(ListImagesOptions {
                filters,
                ..Default::default()
            }))
            .await
            .map_err(classify)?;

        let prefix = format!("{repository}:");
        let mut index = BTreeMap::new();
        for image in images {
            let digest = parse_digest(image.id)?;
            for reference in image.repo_tags {
                if let Some(tag) = reference.strip_prefix(&prefix) {
                    index.insert(tag.to_string(), digest.clone());
                }
            }
        }
        debug!(repository, tags = index.len(), "read tag index");
        Ok(index)
    }

    async fn push(&self, image: &BuiltImage, repository: &str, tag: &str) -> RuntimeResult<()> {
        if self.resolve(repository, tag).await?.is_some() {
            return Err(RuntimeError::Conflict(format!("{repository}:{tag} already exists")));
        }
        self.client
            .tag_image(&image.local_ref, Some(TagImageOptions { repo: repository, tag }))
            .await
            .map_err(classify)?;
        info!(image = %image.local_ref, repository, tag, "tagged image");
        Ok(())
    }

    async fn resolve(&self, repository: &str, tag: &str) -> RuntimeResult<Option<Digest>> {
        match self.client.inspect_image(&format!("{repository}:{tag}")).await {
            Ok(inspect) => inspect.id.map(parse_digest).transpose(),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(None),
            Err(err) => Err(classify(err)),
        }
    }

    async fn untag(&self, repository: &str, tag: &str) -> RuntimeResult<()> {
        let options = RemoveImageOptions {
            force: false,
            noprune: true,
        };
        match self
            .client
            .remove_image(&format!("{repository}:{tag}"), Some(options), None)
            .await
        {
            Ok(_) | Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(err) => Err(classify(err)),
        }
    }
}

/// Adopts an image that was already built into the local store.
#[async_trait]
impl ImageBuilder for DockerImageStore {
    async fn build(&self, context: &BuildContext) -> PublishResult<BuiltImage> {
        let ImageSource::Image(reference) = &context.source else {
            return Err(PublishError::Build(
                "the docker backend publishes prebuilt images; set the image source to a local image".to_string(),
            ));
        };

        let inspect = self
            .client
            .inspect_image(reference)
            .await
            .map_err(|err| PublishError::Build(format!("image '{reference}' is not available locally: {err}")))?;

        let expected = docker_architecture(context.platform);
        if let Some(architecture) = inspect.architecture.as_deref() {
            if architecture != expected {
                return Err(PublishError::Build(format!(
                    "image '{reference}' targets {architecture}, expected {expected}"
                )));
            }
        }

        let id = inspect
            .id
            .ok_or_else(|| PublishError::Build(format!("image '{reference}' has no id")))?;
        let digest = Digest::try_from(id).map_err(PublishError::Build)?;
        Ok(BuiltImage {
            local_ref: reference.clone(),
            digest,
        })
    }
}
