use std::{fs, path::{Path, PathBuf}};

use crate::error::ServerError;

/// On-disk layout rooted at the server's state directory.
///
/// ```text
/// <state-root>/
///   content-store/          blobs + refcounts.db
///   checkpoints/            <id>.json manifests
///     pending/              manifests mid-commit
///     refs/<name>           files holding a checkpoint id
///   registry/
///     processes.db          durable child process records
///     binaries.db           locator cache
///   sessions/<id>/          per-session working trees
///   logs/
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn content_store_dir(&self) -> PathBuf {
        self.root.join("content-store")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.root.join("checkpoints")
    }

    pub fn pending_checkpoints_dir(&self) -> PathBuf {
        self.checkpoints_dir().join("pending")
    }

    pub fn refs_dir(&self) -> PathBuf {
        self.checkpoints_dir().join("refs")
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.root.join("registry")
    }

    pub fn processes_db_path(&self) -> PathBuf {
        self.registry_dir().join("processes.db")
    }

    pub fn binaries_db_path(&self) -> PathBuf {
        self.registry_dir().join("binaries.db")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.sessions_dir().join(session_id)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Creates the full directory tree.
    pub fn materialize(&self) -> Result<(), ServerError> {
        let dirs = [
            self.root.clone(),
            self.content_store_dir(),
            self.checkpoints_dir(),
            self.pending_checkpoints_dir(),
            self.refs_dir(),
            self.registry_dir(),
            self.sessions_dir(),
            self.logs_dir(),
        ];
        for dir in dirs {
            fs::create_dir_all(&dir).map_err(|source| ServerError::io("create", dir, source))?;
        }
        Ok(())
    }
}
