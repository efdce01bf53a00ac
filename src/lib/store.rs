//! JSON persistence for the resolved-resource snapshot, the current service spec
//! and archived deployment runs.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::{
    deployment::types::{DeploymentRun, ServiceSpec},
    provisioner::types::ResolvedState,
};

const STATE_FILE: &str = "state.json";
const SPEC_FILE: &str = "service.json";
const RUNS_DIR: &str = "runs";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("malformed {path}: {source}")]
    Malformed { path: PathBuf, source: serde_json::Error },
    #[error("failed to encode {path}: {source}")]
    Encode { path: PathBuf, source: serde_json::Error },
}

pub type StoreResult<T> = Result<T, StoreError>;

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    /// Opens the store rooted at `root`, creating the directory layout if needed.
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        let runs = root.join(RUNS_DIR);
        fs::create_dir_all(&runs).map_err(io_error(&runs))?;
        Ok(StateStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn load_state(&self) -> StoreResult<ResolvedState> {
        Ok(self.read(&self.root.join(STATE_FILE))?.unwrap_or_default())
    }

    pub fn save_state(&self, state: &ResolvedState) -> StoreResult<()> {
        self.write(&self.root.join(STATE_FILE), state)
    }

    pub fn load_spec(&self) -> StoreResult<Option<ServiceSpec>> {
        self.read(&self.root.join(SPEC_FILE))
    }

    pub fn save_spec(&self, spec: &ServiceSpec) -> StoreResult<()> {
        self.write(&self.root.join(SPEC_FILE), spec)
    }

    pub fn archive_run(&self, run: &DeploymentRun) -> StoreResult<()> {
        self.write(&self.run_path(run.id), run)
    }

    pub fn load_run(&self, id: Uuid) -> StoreResult<Option<DeploymentRun>> {
        self.read(&self.run_path(id))
    }

    /// The archived run that started last.
    pub fn latest_run(&self) -> StoreResult<Option<DeploymentRun>> {
        let dir = self.root.join(RUNS_DIR);
        let entries = fs::read_dir(&dir).map_err(io_error(&dir))?;

        let mut latest: Option<DeploymentRun> = None;
        for entry in entries {
            let path = entry.map_err(io_error(&dir))?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            if let Some(run) = self.read::<DeploymentRun>(&path)? {
                if latest.as_ref().is_none_or(|l| run.started_at > l.started_at) {
                    latest = Some(run);
                }
            }
        }
        Ok(latest)
    }

    fn run_path(&self, id: Uuid) -> PathBuf {
        self.root.join(RUNS_DIR).join(format!("{id}.json"))
    }

    fn read<T: DeserializeOwned>(&self, path: &Path) -> StoreResult<Option<T>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(io_error(path)(source)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Malformed {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Writes to a sibling temp file and renames it over `path`, so readers never
    /// see a half-written file.
    fn write<T: Serialize>(&self, path: &Path, value: &T) -> StoreResult<()> {
        let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Encode {
            path: path.to_path_buf(),
            source,
        })?;
        let temp = path.with_extension("json.tmp");
        fs::write(&temp, bytes).map_err(io_error(&temp))?;
        fs::rename(&temp, path).map_err(io_error(path))?;
        debug!(path = %path.display(), "persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::types::TemplateVersion;

    fn version(revision: u32) -> TemplateVersion {
        TemplateVersion {
            family: "web".into(),
            revision,
        }
    }

    #[test]
    fn missing_files_read_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        assert!(store.load_state().unwrap().is_empty());
        assert!(store.load_spec().unwrap().is_none());
        assert!(store.latest_run().unwrap().is_none());
    }

    #[test]
    fn state_survives_a_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let state = ResolvedState::default();
        StateStore::open(dir.path()).unwrap().save_state(&state).unwrap();

        let reopened = StateStore::open(dir.path()).unwrap();
        assert_eq!(reopened.load_state().unwrap(), state);
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[test]
    fn latest_run_is_the_last_started() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();

        let first = DeploymentRun::new("svc", None, version(1));
        let mut second = DeploymentRun::new("svc", Some(version(1)), version(2));
        second.started_at = first.started_at + std::time::Duration::from_secs(1);
        store.archive_run(&second).unwrap();
        store.archive_run(&first).unwrap();

        assert_eq!(store.latest_run().unwrap().map(|run| run.id), Some(second.id));
        assert_eq!(store.load_run(first.id).unwrap().map(|run| run.to), Some(version(1)));
    }

    #[test]
    fn corrupt_files_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        fs::write(dir.path().join("state.json"), b"{not json").unwrap();
        assert!(matches!(store.load_state(), Err(StoreError::Malformed { .. })));
    }
}
