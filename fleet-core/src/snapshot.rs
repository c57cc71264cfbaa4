//! Durable snapshot contract and workspace restore.
//!
//! On a Cold->Hot transition in HA mode the coordinator retrieves the
//! latest snapshot and resumes every incomplete run: the workspace archive
//! is materialized under the run directory and the job handed back to the
//! job engine. The store itself is a capability seam; a JSON file
//! implementation is provided for single-node deployments.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};

/// Snapshot of one run, captured while the job was in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub job_id: String,
    pub completed: bool,
    /// Names of participating clients at capture time.
    pub participants: Vec<String>,
    /// Workspace archive blob for the run directory.
    pub workspace: Vec<u8>,
}

/// All run snapshots, keyed by job ID.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetSnapshot {
    pub run_snapshots: BTreeMap<String, RunSnapshot>,
}

impl FleetSnapshot {
    pub fn add_run(&mut self, snapshot: RunSnapshot) {
        self.run_snapshots.insert(snapshot.job_id.clone(), snapshot);
    }
}

/// Persistence contract for fleet snapshots.
pub trait SnapshotStore: Send + Sync {
    fn retrieve(&self) -> Result<Option<FleetSnapshot>>;
    fn save(&self, snapshot: &FleetSnapshot) -> Result<()>;
    fn delete(&self) -> Result<()>;
}

/// JSON-file snapshot store.
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn retrieve(&self) -> Result<Option<FleetSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = fs::read(&self.path)
            .map_err(|e| FleetError::snapshot_with_source(&self.path, "failed to read snapshot", e))?;
        let snapshot = serde_json::from_slice(&data).map_err(|e| {
            FleetError::snapshot(&self.path, format!("failed to decode snapshot: {}", e))
        })?;
        Ok(Some(snapshot))
    }

    fn save(&self, snapshot: &FleetSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                FleetError::snapshot_with_source(parent, "failed to create snapshot dir", e)
            })?;
        }
        let data = serde_json::to_vec(snapshot).map_err(|e| {
            FleetError::snapshot(&self.path, format!("failed to encode snapshot: {}", e))
        })?;
        fs::write(&self.path, data)
            .map_err(|e| FleetError::snapshot_with_source(&self.path, "failed to write snapshot", e))
    }

    fn delete(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path).map_err(|e| {
                FleetError::snapshot_with_source(&self.path, "failed to delete snapshot", e)
            })?;
        }
        Ok(())
    }
}

/// Run-directory layout under the coordinator workspace root.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn run_dir(&self, job_id: &str) -> PathBuf {
        self.root.join(job_id)
    }

    /// Recreate the run directory and materialize the workspace archive.
    /// Archive extraction belongs to the artifact-provisioning collaborator.
    pub fn restore_archive(&self, job_id: &str, archive: &[u8]) -> Result<PathBuf> {
        let dst = self.run_dir(job_id);
        if dst.exists() {
            let _ = fs::remove_dir_all(&dst);
        }
        fs::create_dir_all(&dst).map_err(|e| {
            FleetError::snapshot_with_source(&dst, "failed to create run dir", e)
        })?;
        let archive_path = dst.join("workspace.archive");
        fs::write(&archive_path, archive).map_err(|e| {
            FleetError::snapshot_with_source(&archive_path, "failed to restore workspace archive", e)
        })?;
        Ok(archive_path)
    }
}

impl AsRef<Path> for Workspace {
    fn as_ref(&self) -> &Path {
        &self.root
    }
}
