use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{
    publisher::types::{BuiltImage, Digest, ImageRegistry},
    runtime::types::{RuntimeError, RuntimeResult},
};

#[derive(Default)]
struct Inner {
    repositories: BTreeMap<String, BTreeMap<String, Digest>>,
    interrupted_pushes: u32,
}

/// In-memory image registry.
#[derive(Default)]
pub struct MemoryRegistry {
    inner: Mutex<Inner>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `times` pushes write the tag and then fail, as an interrupted upload would.
    pub async fn interrupt_pushes(&self, times: u32) {
        self.inner.lock().await.interrupted_pushes = times;
    }
}

#[async_trait]
impl ImageRegistry for MemoryRegistry {
    async fn index(&self, repository: &str) -> RuntimeResult<BTreeMap<String, Digest>> {
        Ok(self
            .inner
            .lock()
            .await
            .repositories
            .get(repository)
            .cloned()
            .unwrap_or_default())
    }

    async fn push(&self, image: &BuiltImage, repository: &str, tag: &str) -> RuntimeResult<()> {
        let mut inner = self.inner.lock().await;
        let interrupted = inner.interrupted_pushes > 0;
        if interrupted {
            inner.interrupted_pushes -= 1;
        }

        let tags = inner.repositories.entry(repository.to_string()).or_default();
        if tags.contains_key(tag) {
            return Err(RuntimeError::Conflict(format!("{repository}:{tag} already exists")));
        }
        tags.insert(tag.to_string(), image.digest.clone());
        if interrupted {
            return Err(RuntimeError::Fatal("upload interrupted".to_string()));
        }
        Ok(())
    }

    async fn resolve(&self, repository: &str, tag: &str) -> RuntimeResult<Option<Digest>> {
        Ok(self
            .inner
            .lock()
            .await
            .repositories
            .get(repository)
            .and_then(|tags| tags.get(tag))
            .cloned())
    }

    async fn untag(&self, repository: &str, tag: &str) -> RuntimeResult<()> {
        if let Some(tags) = self.inner.lock().await.repositories.get_mut(repository) {
            tags.remove(tag);
        }
        Ok(())
    }
}
