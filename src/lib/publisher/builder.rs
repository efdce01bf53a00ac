use std::{
    fs,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use sha2::{Digest as _, Sha256};
use tracing::debug;

use super::types::{BuildContext, BuiltImage, Digest, ImageBuilder, ImageSource, PublishError, PublishResult};

/// Digests a build context directory: sha-256 over its files' relative paths and
/// contents in sorted order. The image itself is built outside this crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextDigester;

fn collect_files(root: &Path, dir: &Path, files: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(root, &path, files)?;
        } else if let Ok(relative) = path.strip_prefix(root) {
            files.push(relative.to_path_buf());
        }
    }
    Ok(())
}

pub fn digest_directory(root: &Path) -> std::io::Result<Digest> {
    let mut files = Vec::new();
    collect_files(root, root, &mut files)?;
    files.sort();

    let mut hasher = Sha256::new();
    for relative in files {
        let name = relative.to_string_lossy().replace('\\', "/");
        hasher.update(name.as_bytes());
        hasher.update([0]);
        hasher.update(fs::read(root.join(&relative))?);
        hasher.update([0]);
    }
    Ok(Digest::of(hasher))
}

#[async_trait]
impl ImageBuilder for ContextDigester {
    async fn build(&self, context: &BuildContext) -> PublishResult<BuiltImage> {
        let ImageSource::Directory(root) = &context.source else {
            return Err(PublishError::Build(
                "a build context directory is required to digest content".to_string(),
            ));
        };

        let root = root.clone();
        let digest = tokio::task::spawn_blocking(move || digest_directory(&root))
            .await
            .map_err(|err| PublishError::Build(format!("digest task failed: {err}")))?
            .map_err(|err| PublishError::Build(format!("failed to read build context: {err}")))?;

        debug!(repository = %context.repository, %digest, platform = ?context.platform, "digested build context");
        Ok(BuiltImage {
            local_ref: format!("{}@{digest}", context.repository),
            digest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_covers_names_and_contents() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.go"), b"package main").unwrap();
        fs::create_dir(dir.path().join("static")).unwrap();
        fs::write(dir.path().join("static/index.html"), b"<html>").unwrap();

        let first = digest_directory(dir.path()).unwrap();
        assert_eq!(first, digest_directory(dir.path()).unwrap());

        fs::write(dir.path().join("static/index.html"), b"<html/>").unwrap();
        let edited = digest_directory(dir.path()).unwrap();
        assert_ne!(first, edited);

        fs::rename(dir.path().join("main.go"), dir.path().join("app.go")).unwrap();
        assert_ne!(edited, digest_directory(dir.path()).unwrap());
    }
}
