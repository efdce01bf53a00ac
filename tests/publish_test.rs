use std::{collections::BTreeMap, fs, path::Path, sync::Arc};

use async_trait::async_trait;
use r_deploy::{
    graph::types::CpuArchitecture,
    publisher::{
        BuildContext, Digest, ImageSource, PublishError, PublishOptions, Publisher, TagGenerator,
        builder::{ContextDigester, digest_directory},
        types::{BuiltImage, ImageRegistry},
    },
    runtime::types::RuntimeResult,
    sim::MemoryRegistry,
};

const REPOSITORY: &str = "sample-repo";

fn app_dir(body: &str) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("main.go"), body).unwrap();
    dir
}

fn context(dir: &Path) -> BuildContext {
    BuildContext {
        repository: REPOSITORY.into(),
        source: ImageSource::Directory(dir.to_path_buf()),
        platform: CpuArchitecture::Arm64,
    }
}

fn publisher(registry: Arc<dyn ImageRegistry>) -> Publisher {
    Publisher::new(Arc::new(ContextDigester), registry, TagGenerator::new(7).unwrap())
}

#[tokio::test]
async fn publishes_under_a_fresh_tag_with_the_content_digest() {
    let dir = app_dir("package main");
    let registry = Arc::new(MemoryRegistry::new());
    let publisher = publisher(registry.clone());

    let artifact = publisher.publish(&context(dir.path()), PublishOptions::default()).await.unwrap();
    assert_eq!(artifact.tag.len(), 7);
    assert!(artifact.tag.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    assert_eq!(artifact.digest, digest_directory(dir.path()).unwrap());
    assert_eq!(artifact.reference(), format!("{REPOSITORY}:{}", artifact.tag));
    assert_eq!(
        registry.resolve(REPOSITORY, &artifact.tag).await.unwrap(),
        Some(artifact.digest.clone())
    );
}

#[tokio::test]
async fn identical_content_gets_a_new_tag_unless_reuse_is_requested() {
    let dir = app_dir("package main");
    let registry = Arc::new(MemoryRegistry::new());
    let publisher = publisher(registry.clone());

    let first = publisher.publish(&context(dir.path()), PublishOptions::default()).await.unwrap();
    let second = publisher.publish(&context(dir.path()), PublishOptions::default()).await.unwrap();
    assert_ne!(first.tag, second.tag);
    assert_eq!(first.digest, second.digest);

    let reused = publisher
        .publish(&context(dir.path()), PublishOptions { reuse_tag: true })
        .await
        .unwrap();
    assert!(reused.tag == first.tag || reused.tag == second.tag);
    assert_eq!(registry.index(REPOSITORY).await.unwrap().len(), 2);

    fs::write(dir.path().join("main.go"), "package main // v2").unwrap();
    let changed = publisher
        .publish(&context(dir.path()), PublishOptions { reuse_tag: true })
        .await
        .unwrap();
    assert_ne!(changed.digest, first.digest);
    assert_eq!(registry.index(REPOSITORY).await.unwrap().len(), 3);
}

#[tokio::test]
async fn interrupted_push_leaves_no_tag_behind() {
    let dir = app_dir("package main");
    let registry = Arc::new(MemoryRegistry::new());
    registry.interrupt_pushes(1).await;
    let publisher = publisher(registry.clone());

    let err = publisher
        .publish(&context(dir.path()), PublishOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PublishError::Push { .. }));
    assert!(registry.index(REPOSITORY).await.unwrap().is_empty());

    let artifact = publisher.publish(&context(dir.path()), PublishOptions::default()).await.unwrap();
    assert_eq!(registry.index(REPOSITORY).await.unwrap().len(), 1);
    assert_eq!(artifact.digest, digest_directory(dir.path()).unwrap());
}

/// Stores pushes faithfully but reports a different digest for every tag.
#[derive(Default)]
struct Corrupting {
    inner: MemoryRegistry,
}

#[async_trait]
impl ImageRegistry for Corrupting {
    async fn index(&self, repository: &str) -> RuntimeResult<BTreeMap<String, Digest>> {
        self.inner.index(repository).await
    }

    async fn push(&self, image: &BuiltImage, repository: &str, tag: &str) -> RuntimeResult<()> {
        self.inner.push(image, repository, tag).await
    }

    async fn resolve(&self, _: &str, _: &str) -> RuntimeResult<Option<Digest>> {
        Ok(Some(Digest::of_bytes(b"something else")))
    }

    async fn untag(&self, repository: &str, tag: &str) -> RuntimeResult<()> {
        self.inner.untag(repository, tag).await
    }
}

#[tokio::test]
async fn digest_mismatch_withdraws_the_tag() {
    let dir = app_dir("package main");
    let registry = Arc::new(Corrupting::default());
    let publisher = publisher(registry.clone());

    let err = publisher
        .publish(&context(dir.path()), PublishOptions::default())
        .await
        .unwrap_err();
    let PublishError::Verify { expected, actual, .. } = err else {
        panic!("expected a verification failure");
    };
    assert_eq!(expected, digest_directory(dir.path()).unwrap());
    assert_eq!(actual, Some(Digest::of_bytes(b"something else")));
    assert!(registry.index(REPOSITORY).await.unwrap().is_empty());
}

#[tokio::test]
async fn prebuilt_images_need_an_image_store() {
    let registry = Arc::new(MemoryRegistry::new());
    let publisher = publisher(registry.clone());
    let context = BuildContext {
        repository: REPOSITORY.into(),
        source: ImageSource::Image("nginx:latest".into()),
        platform: CpuArchitecture::X86_64,
    };

    let err = publisher.publish(&context, PublishOptions::default()).await.unwrap_err();
    assert!(matches!(err, PublishError::Build(_)));
    assert!(registry.index(REPOSITORY).await.unwrap().is_empty());
}

/// Lets another publisher claim the first tag pushed, just before the push lands.
#[derive(Default)]
struct Racing {
    inner: MemoryRegistry,
    claimed: tokio::sync::Mutex<Option<String>>,
}

#[async_trait]
impl ImageRegistry for Racing {
    async fn index(&self, repository: &str) -> RuntimeResult<BTreeMap<String, Digest>> {
        self.inner.index(repository).await
    }

    async fn push(&self, image: &BuiltImage, repository: &str, tag: &str) -> RuntimeResult<()> {
        let mut claimed = self.claimed.lock().await;
        if claimed.is_none() {
            let other = BuiltImage {
                local_ref: "other:latest".into(),
                digest: Digest::of_bytes(b"another publisher"),
            };
            self.inner.push(&other, repository, tag).await?;
            *claimed = Some(tag.to_string());
        }
        self.inner.push(image, repository, tag).await
    }

    async fn resolve(&self, repository: &str, tag: &str) -> RuntimeResult<Option<Digest>> {
        self.inner.resolve(repository, tag).await
    }

    async fn untag(&self, repository: &str, tag: &str) -> RuntimeResult<()> {
        self.inner.untag(repository, tag).await
    }
}

#[tokio::test]
async fn tag_lost_to_a_concurrent_publish_is_rerolled() {
    let dir = app_dir("package main");
    let registry = Arc::new(Racing::default());
    let publisher = publisher(registry.clone());

    let artifact = publisher.publish(&context(dir.path()), PublishOptions::default()).await.unwrap();
    let claimed = registry.claimed.lock().await.clone().unwrap();
    assert_ne!(artifact.tag, claimed);
    assert_eq!(artifact.digest, digest_directory(dir.path()).unwrap());

    // The other publisher's artifact is untouched.
    assert_eq!(
        registry.resolve(REPOSITORY, &claimed).await.unwrap(),
        Some(Digest::of_bytes(b"another publisher"))
    );
    assert_eq!(registry.index(REPOSITORY).await.unwrap().len(), 2);
}
