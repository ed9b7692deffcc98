use std::{
    collections::HashSet,
    fs,
    path::Path,
    sync::PoisonError,
    time::SystemTime,
};

use tracing::{debug, info, warn};

use crate::{store::BLOB_EXTENSION, BlobHash, ContentStore, StoreError};

/// Outcome of a [`ContentStore::gc`] pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GcReport {
    pub blobs_removed: u64,
    pub bytes_freed: u64,
    pub temp_files_removed: u64,
    pub dry_run: bool,
}

impl ContentStore {
    /// Two-phase mark-and-sweep.
    ///
    /// Mark: everything in `roots` plus every blob with a nonzero external
    /// refcount survives. Sweep: unmarked blobs are deleted, as are temp
    /// files older than the configured grace period (leftovers of
    /// interrupted writes). The sweep phase holds the store's exclusive GC
    /// lock; concurrent `put`s of marked content remain safe because an
    /// existing blob file is never rewritten.
    pub fn gc(&self, roots: &HashSet<BlobHash>, dry_run: bool) -> Result<GcReport, StoreError> {
        let mut marked: HashSet<String> = roots.iter().map(BlobHash::to_hex).collect();
        for held in self.held_hashes() {
            marked.insert(held);
        }

        let _sweep = self
            .sweep_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut report = GcReport {
            dry_run,
            ..GcReport::default()
        };
        let grace = self.options().temp_grace;
        let now = SystemTime::now();

        let shards = match fs::read_dir(self.root()) {
            Ok(entries) => entries,
            Err(source) => return Err(StoreError::io("read", self.root(), source)),
        };
        for shard in shards.flatten() {
            let shard_path = shard.path();
            if !shard_path.is_dir() {
                continue;
            }
            let entries = match fs::read_dir(&shard_path) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(shard = %shard_path.display(), %err, "skipping unreadable shard");
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                match blob_hex_of(&path) {
                    Some(hex) => {
                        if marked.contains(&hex) {
                            continue;
                        }
                        let size = entry.metadata().map(|meta| meta.len()).unwrap_or(0);
                        if !dry_run {
                            if let Err(err) = fs::remove_file(&path) {
                                warn!(blob = %path.display(), %err, "failed to sweep blob");
                                continue;
                            }
                            self.record_freed(size);
                        }
                        report.blobs_removed += 1;
                        report.bytes_freed += size;
                        debug!(blob = %hex, size, dry_run, "swept blob");
                    }
                    // Anything that is not a blob here is a temp file from
                    // an interrupted put; sweep it once it ages out.
                    None => {
                        let expired = entry
                            .metadata()
                            .and_then(|meta| meta.modified())
                            .ok()
                            .and_then(|modified| now.duration_since(modified).ok())
                            .is_some_and(|age| age >= grace);
                        if expired {
                            if !dry_run {
                                if let Err(err) = fs::remove_file(&path) {
                                    warn!(temp = %path.display(), %err, "failed to sweep temp file");
                                    continue;
                                }
                            }
                            report.temp_files_removed += 1;
                        }
                    }
                }
            }
        }

        info!(
            blobs_removed = report.blobs_removed,
            bytes_freed = report.bytes_freed,
            temp_files_removed = report.temp_files_removed,
            dry_run,
            "content store gc finished"
        );
        Ok(report)
    }
}

fn blob_hex_of(path: &Path) -> Option<String> {
    if path.extension()?.to_str()? != BLOB_EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    stem.parse::<BlobHash>().ok().map(|hash| hash.to_hex())
}
