//! Artifact stores: where the final state of a successful run is kept.

use crate::errors::{OrchestratorError, Result};
use crate::state::State;
use cascade_common::{ArtifactId, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Persistence collaborator for final run state.
pub trait ArtifactStore: Send + Sync {
    fn save(&self, run_id: RunId, state: &State) -> Result<ArtifactId>;
    fn load(&self, id: ArtifactId) -> Result<State>;
}

/// On-disk artifact envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredArtifact {
    pub id: ArtifactId,
    pub run_id: RunId,
    pub saved_at: DateTime<Utc>,
    pub state: State,
}

/// Stores each artifact as `<dir>/<artifact-id>.json`.
#[derive(Debug, Clone)]
pub struct FileArtifactStore {
    dir: PathBuf,
}

impl FileArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, id: ArtifactId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

impl ArtifactStore for FileArtifactStore {
    fn save(&self, run_id: RunId, state: &State) -> Result<ArtifactId> {
        let artifact = StoredArtifact {
            id: ArtifactId::new(),
            run_id,
            saved_at: Utc::now(),
            state: state.clone(),
        };
        let path = self.path(artifact.id);
        let io_err = |source| OrchestratorError::Persistence {
            what: "artifact",
            path: path.clone(),
            source,
        };

        std::fs::create_dir_all(&self.dir).map_err(io_err)?;
        let bytes = serde_json::to_vec_pretty(&artifact)?;
        std::fs::write(&path, bytes).map_err(io_err)?;

        debug!(artifact_id = %artifact.id, run_id = %run_id, path = %path.display(), "artifact saved");
        Ok(artifact.id)
    }

    fn load(&self, id: ArtifactId) -> Result<State> {
        let path = self.path(id);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(OrchestratorError::ArtifactNotFound(id));
            }
            Err(source) => {
                return Err(OrchestratorError::Persistence {
                    what: "artifact",
                    path,
                    source,
                });
            }
        };
        let artifact: StoredArtifact = serde_json::from_slice(&bytes)?;
        Ok(artifact.state)
    }
}

/// Keeps artifacts in memory. Useful for tests and embedded use.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    artifacts: Mutex<HashMap<ArtifactId, (RunId, State)>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.artifacts.lock().map(|a| a.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Artifact saved for `run_id`, if any.
    pub fn find_by_run(&self, run_id: RunId) -> Option<ArtifactId> {
        let artifacts = self.artifacts.lock().ok()?;
        artifacts
            .iter()
            .find(|(_, (run, _))| *run == run_id)
            .map(|(id, _)| *id)
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn save(&self, run_id: RunId, state: &State) -> Result<ArtifactId> {
        let id = ArtifactId::new();
        self.artifacts
            .lock()
            .map_err(|_| OrchestratorError::LockPoisoned("artifact store"))?
            .insert(id, (run_id, state.clone()));
        Ok(id)
    }

    fn load(&self, id: ArtifactId) -> Result<State> {
        self.artifacts
            .lock()
            .map_err(|_| OrchestratorError::LockPoisoned("artifact store"))?
            .get(&id)
            .map(|(_, state)| state.clone())
            .ok_or(OrchestratorError::ArtifactNotFound(id))
    }
}
