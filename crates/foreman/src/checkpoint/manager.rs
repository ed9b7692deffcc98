use std::{
    collections::{BTreeMap, HashSet},
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

use ignore::{overrides::OverrideBuilder, WalkBuilder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use content_store::{BlobHash, ContentStore};

use crate::{
    checkpoint::{
        diff_manifests, validate_ref_name, CheckpointSummary, DiffReport, Manifest, ManifestEntry,
    },
    error::ServerError,
    events::{EventBus, ServerEvent},
    paths::StateLayout,
};

/// Inputs to [`CheckpointManager::create`].
#[derive(Clone, Debug, Default)]
pub struct CreateCheckpointOptions {
    pub message: String,
    pub author: String,
    pub tags: Vec<String>,
    pub parent: Option<String>,
}

/// Outcome of a [`CheckpointManager::restore`].
#[derive(Clone, Debug, Default)]
pub struct RestoreReport {
    pub files_written: usize,
    pub files_removed: usize,
    pub backup_id: Option<String>,
}

/// Outcome of a [`CheckpointManager::gc`].
#[derive(Clone, Copy, Debug, Default)]
pub struct GcSummary {
    /// Manifests removed (or, on a dry run, that would be removed).
    pub objects_removed: u64,
    pub blobs_removed: u64,
    pub bytes_freed: u64,
    pub dry_run: bool,
}

/// Snapshots project trees into the content store and back.
///
/// Commit protocol: hash every file into the store, `link` each blob under
/// the checkpoint id, write the manifest to `pending/`, then rename it into
/// place. A crash or cancellation before the rename leaves only unlinked
/// blobs (future GC fodder) and a pending file that is cleared on the next
/// open; a partial checkpoint is never visible.
pub struct CheckpointManager {
    store: Arc<ContentStore>,
    checkpoints_dir: PathBuf,
    pending_dir: PathBuf,
    refs_dir: PathBuf,
    ignore: Vec<String>,
    events: EventBus,
    /// Serializes manifest/ref mutations and GC root computation.
    commit_lock: Mutex<()>,
}

impl CheckpointManager {
    pub fn open(
        store: Arc<ContentStore>,
        layout: &StateLayout,
        ignore: Vec<String>,
        events: EventBus,
    ) -> Result<Self, ServerError> {
        let manager = Self {
            store,
            checkpoints_dir: layout.checkpoints_dir(),
            pending_dir: layout.pending_checkpoints_dir(),
            refs_dir: layout.refs_dir(),
            ignore,
            events,
            commit_lock: Mutex::new(()),
        };
        manager.clear_pending();
        Ok(manager)
    }

    /// Walks `project_root`, stores every file, and commits a manifest.
    /// Idempotent over an unchanged tree: the same file set yields the same
    /// checkpoint id, and re-creating an existing checkpoint is a no-op.
    pub fn create(
        &self,
        project_root: &Path,
        options: CreateCheckpointOptions,
        cancel: &CancellationToken,
    ) -> Result<String, ServerError> {
        if let Some(parent) = &options.parent {
            if !self.exists(parent) {
                return Err(ServerError::CheckpointNotFound { id: parent.clone() });
            }
        }

        let files = self.walk_project(project_root)?;
        let mut entries = BTreeMap::new();
        for (rel, abs) in files {
            if cancel.is_cancelled() {
                return Err(ServerError::Cancelled);
            }
            let bytes =
                fs::read(&abs).map_err(|source| ServerError::io("read", &abs, source))?;
            let outcome = self.store.put(&bytes)?;
            entries.insert(
                rel,
                ManifestEntry {
                    hash: outcome.hash,
                    mode: file_mode(&abs),
                    size: bytes.len() as u64,
                },
            );
        }

        let manifest = Manifest {
            files: entries,
            parent: options.parent,
            author: options.author,
            message: options.message,
            created_at_unix_ms: unix_ms(),
            tags: options.tags,
        };
        let id = manifest.id()?;

        let _guard = self.commit_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.exists(&id) {
            debug!(checkpoint = %id, "tree already checkpointed");
            return Ok(id);
        }

        let mut linked: Vec<BlobHash> = Vec::new();
        let commit = (|| -> Result<(), ServerError> {
            for entry in manifest.files.values() {
                if cancel.is_cancelled() {
                    return Err(ServerError::Cancelled);
                }
                self.store.link(&id, &entry.hash)?;
                linked.push(entry.hash);
            }

            let pending = self.pending_dir.join(format!("{id}.json"));
            let bytes =
                serde_json::to_vec_pretty(&manifest).map_err(|source| ServerError::Encode {
                    context: "checkpoint manifest",
                    source,
                })?;
            fs::write(&pending, &bytes)
                .map_err(|source| ServerError::io("write", &pending, source))?;
            let target = self.manifest_path(&id);
            fs::rename(&pending, &target)
                .map_err(|source| ServerError::io("rename into", &target, source))?;
            Ok(())
        })();

        if let Err(err) = commit {
            for hash in &linked {
                if let Err(unlink_err) = self.store.unlink(&id, hash) {
                    warn!(%unlink_err, "rollback unlink failed");
                }
            }
            let _ = fs::remove_file(self.pending_dir.join(format!("{id}.json")));
            return Err(err);
        }

        info!(
            checkpoint = %id,
            files = manifest.files.len(),
            bytes = manifest.total_bytes(),
            "checkpoint created"
        );
        self.events.publish(ServerEvent::CheckpointCreated {
            id: id.clone(),
            files: manifest.files.len(),
            bytes: manifest.total_bytes(),
        });
        Ok(id)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.manifest_path(id).is_file()
    }

    pub fn get(&self, id: &str) -> Result<Manifest, ServerError> {
        let path = self.manifest_path(id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(ServerError::CheckpointNotFound { id: id.to_string() });
            }
            Err(source) => return Err(ServerError::io("read", &path, source)),
        };
        serde_json::from_slice(&bytes).map_err(|source| ServerError::Encode {
            context: "checkpoint manifest",
            source,
        })
    }

    /// All stored checkpoints, newest first.
    pub fn list(&self) -> Result<Vec<CheckpointSummary>, ServerError> {
        let mut out = Vec::new();
        for id in self.manifest_ids()? {
            match self.get(&id) {
                Ok(manifest) => out.push(CheckpointSummary::of(id, &manifest)),
                Err(err) => warn!(checkpoint = %id, %err, "skipping unreadable manifest"),
            }
        }
        out.sort_by(|a, b| b.created_at_unix_ms.cmp(&a.created_at_unix_ms));
        Ok(out)
    }

    pub fn diff(&self, a: &str, b: &str) -> Result<DiffReport, ServerError> {
        let a = self.get(a)?;
        let b = self.get(b)?;
        Ok(diff_manifests(&a, &b))
    }

    /// Rebuilds a working tree from a checkpoint. The manifest wins every
    /// conflict; files present in the target but absent from the manifest
    /// are removed last.
    pub fn restore(
        &self,
        id: &str,
        target_root: &Path,
        create_backup: bool,
    ) -> Result<RestoreReport, ServerError> {
        let manifest = self.get(id)?;
        let mut report = RestoreReport::default();

        if create_backup && target_root.is_dir() {
            let backup = self.create(
                target_root,
                CreateCheckpointOptions {
                    message: format!("backup before restoring {id}"),
                    author: "foreman".to_string(),
                    tags: Vec::new(),
                    parent: None,
                },
                &CancellationToken::new(),
            )?;
            report.backup_id = Some(backup);
        }

        fs::create_dir_all(target_root)
            .map_err(|source| ServerError::io("create", target_root, source))?;

        for (rel, entry) in &manifest.files {
            let bytes = self.store.get_verified(&entry.hash)?;
            let dest = target_root.join(rel);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .map_err(|source| ServerError::io("create", parent, source))?;
            }
            write_file_atomic(&dest, &bytes)?;
            set_mode(&dest, entry.mode);
            report.files_written += 1;
        }

        for (rel, abs) in self.walk_project(target_root)? {
            if !manifest.files.contains_key(&rel) {
                fs::remove_file(&abs).map_err(|source| ServerError::io("remove", &abs, source))?;
                report.files_removed += 1;
            }
        }

        info!(checkpoint = %id, files = report.files_written, removed = report.files_removed, "checkpoint restored");
        self.events
            .publish(ServerEvent::CheckpointRestored { id: id.to_string() });
        Ok(report)
    }

    pub fn create_ref(&self, name: &str, id: &str) -> Result<(), ServerError> {
        validate_ref_name(name)?;
        if !self.exists(id) {
            return Err(ServerError::CheckpointNotFound { id: id.to_string() });
        }
        let _guard = self.commit_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let path = self.refs_dir.join(name);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.refs_dir)
            .map_err(|source| ServerError::io("create temp file in", &self.refs_dir, source))?;
        io::Write::write_all(&mut tmp, id.as_bytes())
            .map_err(|source| ServerError::io("write", tmp.path().to_path_buf(), source))?;
        tmp.persist(&path)
            .map_err(|err| ServerError::io("rename into", &path, err.error))?;
        Ok(())
    }

    pub fn get_ref(&self, name: &str) -> Result<String, ServerError> {
        validate_ref_name(name)?;
        let path = self.refs_dir.join(name);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(contents.trim().to_string()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(ServerError::RefNotFound {
                name: name.to_string(),
            }),
            Err(source) => Err(ServerError::io("read", &path, source)),
        }
    }

    pub fn delete_ref(&self, name: &str) -> Result<(), ServerError> {
        validate_ref_name(name)?;
        let _guard = self.commit_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let path = self.refs_dir.join(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(ServerError::RefNotFound {
                name: name.to_string(),
            }),
            Err(source) => Err(ServerError::io("remove", &path, source)),
        }
    }

    /// All refs as `(name, checkpoint id)`, sorted by name.
    pub fn list_refs(&self) -> Result<Vec<(String, String)>, ServerError> {
        let entries = match fs::read_dir(&self.refs_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(ServerError::io("read", &self.refs_dir, source)),
        };
        let mut out = Vec::new();
        for entry in entries.flatten() {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if let Ok(contents) = fs::read_to_string(entry.path()) {
                out.push((name, contents.trim().to_string()));
            }
        }
        out.sort();
        Ok(out)
    }

    /// Removes every checkpoint unreachable from the refs (following parent
    /// chains), then sweeps the content store. On a dry run nothing is
    /// unlinked or deleted, so the reported blob count is a lower bound.
    pub fn gc(&self, dry_run: bool) -> Result<GcSummary, ServerError> {
        let _guard = self.commit_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut live: HashSet<String> = HashSet::new();
        let mut stack: Vec<String> = self
            .list_refs()?
            .into_iter()
            .map(|(_, id)| id)
            .collect();
        while let Some(id) = stack.pop() {
            if !live.insert(id.clone()) {
                continue;
            }
            match self.get(&id) {
                Ok(manifest) => {
                    if let Some(parent) = manifest.parent {
                        stack.push(parent);
                    }
                }
                Err(err) => warn!(checkpoint = %id, %err, "ref points at unreadable checkpoint"),
            }
        }

        let mut roots: HashSet<BlobHash> = HashSet::new();
        for id in &live {
            if let Ok(manifest) = self.get(id) {
                roots.extend(manifest.files.values().map(|entry| entry.hash));
            }
        }

        let mut objects_removed = 0u64;
        for id in self.manifest_ids()? {
            if live.contains(&id) {
                continue;
            }
            objects_removed += 1;
            if dry_run {
                continue;
            }
            if let Ok(manifest) = self.get(&id) {
                for entry in manifest.files.values() {
                    if let Err(err) = self.store.unlink(&id, &entry.hash) {
                        warn!(checkpoint = %id, %err, "unlink during gc failed");
                    }
                }
            }
            let path = self.manifest_path(&id);
            if let Err(err) = fs::remove_file(&path) {
                warn!(checkpoint = %id, %err, "failed to remove manifest");
            }
        }

        let report = self.store.gc(&roots, dry_run)?;
        let summary = GcSummary {
            objects_removed,
            blobs_removed: report.blobs_removed,
            bytes_freed: report.bytes_freed,
            dry_run,
        };
        info!(
            objects_removed = summary.objects_removed,
            blobs_removed = summary.blobs_removed,
            bytes_freed = summary.bytes_freed,
            dry_run,
            "checkpoint gc finished"
        );
        self.events.publish(ServerEvent::GcCompleted {
            objects_removed: summary.objects_removed,
            bytes_freed: summary.bytes_freed,
        });
        Ok(summary)
    }

    fn manifest_path(&self, id: &str) -> PathBuf {
        self.checkpoints_dir.join(format!("{id}.json"))
    }

    fn manifest_ids(&self) -> Result<Vec<String>, ServerError> {
        let entries = match fs::read_dir(&self.checkpoints_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(ServerError::io("read", &self.checkpoints_dir, source)),
        };
        let mut ids = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Project files as sorted `(relative, absolute)` pairs, honoring
    /// `.gitignore` and the configured ignore globs; `.git` never walks.
    fn walk_project(&self, root: &Path) -> Result<Vec<(String, PathBuf)>, ServerError> {
        let mut overrides = OverrideBuilder::new(root);
        for pattern in &self.ignore {
            overrides
                .add(&format!("!{pattern}"))
                .map_err(|err| ServerError::InvalidConfig {
                    message: format!("bad checkpoint ignore pattern `{pattern}`: {err}"),
                })?;
        }
        let overrides = overrides.build().map_err(|err| ServerError::InvalidConfig {
            message: format!("checkpoint ignore patterns: {err}"),
        })?;

        let walker = WalkBuilder::new(root)
            .hidden(false)
            .git_ignore(true)
            .git_global(false)
            .git_exclude(false)
            .require_git(false)
            .overrides(overrides)
            .filter_entry(|entry| entry.file_name() != ".git")
            .build();

        let mut files = Vec::new();
        for result in walker {
            let entry = result.map_err(|err| ServerError::Internal {
                message: format!("walking {}: {err}", root.display()),
            })?;
            if !entry.file_type().map_or(false, |kind| kind.is_file()) {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(root)
                .map_err(|_| ServerError::Internal {
                    message: format!("walker escaped root {}", root.display()),
                })?
                .to_string_lossy()
                .into_owned();
            files.push((rel, entry.path().to_path_buf()));
        }
        files.sort();
        Ok(files)
    }

    fn clear_pending(&self) {
        let Ok(entries) = fs::read_dir(&self.pending_dir) else {
            return;
        };
        for entry in entries.flatten() {
            debug!(pending = %entry.path().display(), "clearing interrupted checkpoint");
            let _ = fs::remove_file(entry.path());
        }
    }
}

fn write_file_atomic(dest: &Path, bytes: &[u8]) -> Result<(), ServerError> {
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|source| ServerError::io("create temp file in", dir, source))?;
    io::Write::write_all(&mut tmp, bytes)
        .map_err(|source| ServerError::io("write", tmp.path().to_path_buf(), source))?;
    tmp.persist(dest)
        .map_err(|err| ServerError::io("rename into", dest, err.error))?;
    Ok(())
}

#[cfg(unix)]
fn file_mode(path: &Path) -> u32 {
    use std::os::unix::fs::MetadataExt;
    fs::metadata(path).map(|meta| meta.mode() & 0o7777).unwrap_or(0o644)
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> u32 {
    0o644
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode));
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) {}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
