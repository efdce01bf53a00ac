use std::{collections::BTreeSet, sync::Arc};

use tracing::{info, warn};

use super::{
    tag::TagGenerator,
    types::{
        Artifact, BuildContext, ImageBuilder, ImageRegistry, PublishError, PublishOptions, PublishResult,
    },
};
use crate::runtime::{
    retry::{ExponentialBackoff, retry},
    types::RuntimeError,
};

const REGISTRY_ATTEMPTS: u32 = 3;
/// Fresh tags tried when pushes keep losing the tag to concurrent publishers.
const PUSH_CONFLICTS: u32 = 5;

/// Builds an image and publishes it under a fresh, never reused tag.
pub struct Publisher {
    builder: Arc<dyn ImageBuilder>,
    registry: Arc<dyn ImageRegistry>,
    tags: TagGenerator,
    backoff: ExponentialBackoff,
}

impl Publisher {
    pub fn new(builder: Arc<dyn ImageBuilder>, registry: Arc<dyn ImageRegistry>, tags: TagGenerator) -> Self {
        Publisher {
            builder,
            registry,
            tags,
            backoff: ExponentialBackoff::default(),
        }
    }

    /// Either the whole artifact becomes visible or no tag does.
    pub async fn publish(&self, context: &BuildContext, options: PublishOptions) -> PublishResult<Artifact> {
        let repository = context.repository.as_str();
        let built = self.builder.build(context).await?;

        let registry = &self.registry;
        let index = retry(self.backoff, REGISTRY_ATTEMPTS, || registry.index(repository))
            .await
            .map_err(|source| PublishError::Registry {
                repository: repository.to_string(),
                source,
            })?;

        if options.reuse_tag {
            if let Some((tag, _)) = index.iter().find(|(_, digest)| **digest == built.digest) {
                info!(repository, %tag, digest = %built.digest, "reusing tag for identical content");
                return Ok(Artifact {
                    repository: repository.to_string(),
                    tag: tag.clone(),
                    digest: built.digest,
                });
            }
        }

        let mut taken: BTreeSet<String> = index.into_keys().collect();
        let mut conflicts = 0;
        let tag = loop {
            let tag = self
                .tags
                .generate(&mut rand::thread_rng(), repository, |tag| taken.contains(tag))?;
            match retry(self.backoff, REGISTRY_ATTEMPTS, || registry.push(&built, repository, &tag)).await {
                Ok(()) => break tag,
                // Someone else owns the tag now; leave it alone and roll another.
                Err(RuntimeError::Conflict(reason)) if conflicts < PUSH_CONFLICTS => {
                    warn!(repository, %tag, %reason, "tag taken by a concurrent publish");
                    conflicts += 1;
                    taken.insert(tag);
                }
                Err(RuntimeError::Conflict(_)) => {
                    return Err(PublishError::TagSpaceExhausted {
                        repository: repository.to_string(),
                        attempts: conflicts,
                    });
                }
                Err(source) => {
                    self.withdraw(repository, &tag).await;
                    return Err(PublishError::Push {
                        repository: repository.to_string(),
                        tag,
                        source,
                    });
                }
            }
        };

        let resolved = retry(self.backoff, REGISTRY_ATTEMPTS, || registry.resolve(repository, &tag)).await;
        let actual = match resolved {
            Ok(actual) => actual,
            Err(source) => {
                self.withdraw(repository, &tag).await;
                return Err(PublishError::Push {
                    repository: repository.to_string(),
                    tag,
                    source,
                });
            }
        };
        if actual.as_ref() != Some(&built.digest) {
            self.withdraw(repository, &tag).await;
            return Err(PublishError::Verify {
                repository: repository.to_string(),
                tag,
                expected: built.digest,
                actual,
            });
        }

        info!(repository, %tag, digest = %built.digest, "published image");
        Ok(Artifact {
            repository: repository.to_string(),
            tag,
            digest: built.digest,
        })
    }

    async fn withdraw(&self, repository: &str, tag: &str) {
        let registry = &self.registry;
        if let Err(err) = retry(self.backoff, REGISTRY_ATTEMPTS, || registry.untag(repository, tag)).await {
            warn!(repository, tag, error = %err, "failed to withdraw partially published tag");
        }
    }
}
