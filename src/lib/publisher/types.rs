use std::{collections::BTreeMap, fmt, path::PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

use crate::{
    graph::types::CpuArchitecture,
    runtime::types::{RuntimeError, RuntimeResult},
};

/// A `sha256:<hex>` content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    pub fn of(hasher: Sha256) -> Self {
        let hex: String = hasher.finalize().iter().map(|byte| format!("{byte:02x}")).collect();
        Digest(format!("sha256:{hex}"))
    }

    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Digest::of(hasher)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Digest {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let hex = value
            .strip_prefix("sha256:")
            .ok_or_else(|| format!("digest '{value}' is not sha256"))?;
        if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
            return Err(format!("digest '{value}' is malformed"));
        }
        Ok(Digest(value))
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An image published under an immutable tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub repository: String,
    pub tag: String,
    pub digest: Digest,
}

impl Artifact {
    /// `repository:tag`, the reference a task template runs.
    pub fn reference(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSource {
    /// A build context directory.
    Directory(PathBuf),
    /// An image already present in the local image store.
    Image(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildContext {
    pub repository: String,
    pub source: ImageSource,
    pub platform: CpuArchitecture,
}

/// Output of a build, not yet visible in any repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltImage {
    pub local_ref: String,
    pub digest: Digest,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Return the existing tag when the registry already holds identical content.
    pub reuse_tag: bool,
}

#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build(&self, context: &BuildContext) -> PublishResult<BuiltImage>;
}

#[async_trait]
pub trait ImageRegistry: Send + Sync {
    /// Every tag in `repository` with the digest it points at.
    async fn index(&self, repository: &str) -> RuntimeResult<BTreeMap<String, Digest>>;

    /// Makes `image` visible as `repository:tag`. Fails with `RuntimeError::Conflict`
    /// if the tag already exists.
    async fn push(&self, image: &BuiltImage, repository: &str, tag: &str) -> RuntimeResult<()>;

    async fn resolve(&self, repository: &str, tag: &str) -> RuntimeResult<Option<Digest>>;

    async fn untag(&self, repository: &str, tag: &str) -> RuntimeResult<()>;
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("image build failed: {0}")]
    Build(String),
    #[error("failed to read the tag index of '{repository}': {source}")]
    Registry { repository: String, source: RuntimeError },
    #[error("push of {repository}:{tag} did not complete: {source}")]
    Push {
        repository: String,
        tag: String,
        source: RuntimeError,
    },
    #[error("{repository}:{tag} resolves to {}, expected {expected}", describe(.actual))]
    Verify {
        repository: String,
        tag: String,
        expected: Digest,
        actual: Option<Digest>,
    },
    #[error("no unused tag found for '{repository}' after {attempts} attempts")]
    TagSpaceExhausted { repository: String, attempts: u32 },
    #[error("invalid tag policy: {0}")]
    InvalidPolicy(String),
}

fn describe(digest: &Option<Digest>) -> String {
    digest.as_ref().map_or_else(|| "nothing".to_string(), Digest::to_string)
}

pub type PublishResult<T> = Result<T, PublishError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digests_must_be_sha256_hex() {
        let digest = Digest::of_bytes(b"hello");
        assert_eq!(
            digest.as_str(),
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert!(Digest::try_from(digest.to_string()).is_ok());
        assert!(Digest::try_from("md5:abc".to_string()).is_err());
        assert!(Digest::try_from("sha256:XYZ".to_string()).is_err());
    }
}
