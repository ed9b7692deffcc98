use std::{
    fs, io,
    io::Write,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::Duration,
};

use tracing::{debug, warn};

use crate::{refcount::RefcountIndex, BlobHash, StoreError};

pub(crate) const BLOB_EXTENSION: &str = "zst";
pub(crate) const REFCOUNT_FILE: &str = "refcounts.db";

/// Tunables for a [`ContentStore`].
#[derive(Clone, Debug)]
pub struct StoreOptions {
    /// zstd compression level applied on `put`.
    pub zstd_level: i32,
    /// Verify the content hash on every `get` (otherwise only GC and
    /// checkpoint restore verify).
    pub verify_on_read: bool,
    /// Hard ceiling on compressed bytes stored, when set.
    pub disk_quota: Option<u64>,
    /// Temp files older than this are swept as crash leftovers.
    pub temp_grace: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            zstd_level: 7,
            verify_on_read: false,
            disk_quota: None,
            temp_grace: Duration::from_secs(15 * 60),
        }
    }
}

/// Result of a [`ContentStore::put`].
#[derive(Clone, Copy, Debug)]
pub struct PutOutcome {
    pub hash: BlobHash,
    /// `true` when the blob already existed and nothing was written.
    pub already_present: bool,
    /// Compressed bytes now on disk for this blob.
    pub stored_bytes: u64,
}

/// SHA-256-addressed blob store, zstd-compressed, sharded by the first hash
/// byte. See the crate docs for the layout and retention model.
pub struct ContentStore {
    root: PathBuf,
    options: StoreOptions,
    refcounts: Mutex<RefcountIndex>,
    /// Approximate compressed usage, maintained across put/sweep.
    usage: AtomicU64,
    /// Held exclusively for the sweep phase of GC.
    pub(crate) sweep_lock: Mutex<()>,
}

impl ContentStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>, options: StoreOptions) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StoreError::io("create", &root, source))?;
        let refcounts = RefcountIndex::load(root.join(REFCOUNT_FILE))?;
        let usage = scan_usage(&root)?;
        debug!(root = %root.display(), usage, "content store opened");
        Ok(Self {
            root,
            options,
            refcounts: Mutex::new(refcounts),
            usage: AtomicU64::new(usage),
            sweep_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Stores `bytes`, returning its content hash. Idempotent: an existing
    /// blob is left untouched. Never changes refcounts.
    pub fn put(&self, bytes: &[u8]) -> Result<PutOutcome, StoreError> {
        let hash = BlobHash::of(bytes);
        let path = self.blob_path(&hash);
        if let Ok(meta) = fs::metadata(&path) {
            return Ok(PutOutcome {
                hash,
                already_present: true,
                stored_bytes: meta.len(),
            });
        }

        let compressed = zstd::encode_all(bytes, self.options.zstd_level)
            .map_err(|source| StoreError::io("compress", &path, source))?;

        if let Some(quota) = self.options.disk_quota {
            let projected = self
                .usage
                .load(Ordering::Relaxed)
                .saturating_add(compressed.len() as u64);
            if projected > quota {
                return Err(StoreError::QuotaExceeded { quota });
            }
        }

        let shard_dir = self.root.join(hash.shard());
        fs::create_dir_all(&shard_dir)
            .map_err(|source| StoreError::io("create", &shard_dir, source))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&shard_dir)
            .map_err(|source| StoreError::io("create temp file in", &shard_dir, source))?;
        tmp.write_all(&compressed)
            .map_err(|source| StoreError::io("write", tmp.path().to_path_buf(), source))?;
        tmp.as_file()
            .sync_all()
            .map_err(|source| StoreError::io("sync", tmp.path().to_path_buf(), source))?;

        match tmp.persist(&path) {
            Ok(_) => {}
            // Lost a race against a concurrent put of the same content; the
            // winner's bytes are identical.
            Err(err) if path.exists() => {
                drop(err);
                return Ok(PutOutcome {
                    hash,
                    already_present: true,
                    stored_bytes: compressed.len() as u64,
                });
            }
            Err(err) => return Err(StoreError::io("rename into", &path, err.error)),
        }

        self.usage
            .fetch_add(compressed.len() as u64, Ordering::Relaxed);
        debug!(%hash, bytes = bytes.len(), compressed = compressed.len(), "blob stored");
        Ok(PutOutcome {
            hash,
            already_present: false,
            stored_bytes: compressed.len() as u64,
        })
    }

    /// Reads a blob back, decompressing and (optionally) verifying it.
    pub fn get(&self, hash: &BlobHash) -> Result<Vec<u8>, StoreError> {
        let bytes = self.get_unverified(hash)?;
        if self.options.verify_on_read {
            self.verify(hash, &bytes)?;
        }
        Ok(bytes)
    }

    /// Reads and always verifies, regardless of `verify_on_read`. Used by
    /// checkpoint restore.
    pub fn get_verified(&self, hash: &BlobHash) -> Result<Vec<u8>, StoreError> {
        let bytes = self.get_unverified(hash)?;
        self.verify(hash, &bytes)?;
        Ok(bytes)
    }

    pub fn has(&self, hash: &BlobHash) -> bool {
        self.blob_path(hash).is_file()
    }

    /// Records `holder` (a checkpoint id) as retaining `hash`.
    pub fn link(&self, holder: &str, hash: &BlobHash) -> Result<(), StoreError> {
        let mut refcounts = self.refcounts.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        refcounts.link(holder, hash)?;
        Ok(())
    }

    /// Drops the `holder` -> `hash` retention edge. Unknown pairs are a
    /// no-op.
    pub fn unlink(&self, holder: &str, hash: &BlobHash) -> Result<(), StoreError> {
        let mut refcounts = self.refcounts.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        refcounts.unlink(holder, hash)?;
        Ok(())
    }

    pub fn holder_count(&self, hash: &BlobHash) -> usize {
        let refcounts = self.refcounts.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        refcounts.holder_count(hash)
    }

    /// Compressed bytes currently attributed to the store.
    pub fn usage_bytes(&self) -> u64 {
        self.usage.load(Ordering::Relaxed)
    }

    pub(crate) fn held_hashes(&self) -> Vec<String> {
        let refcounts = self.refcounts.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        refcounts.held_hashes().map(str::to_string).collect()
    }

    pub(crate) fn record_freed(&self, bytes: u64) {
        let mut current = self.usage.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(bytes);
            match self.usage.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    pub(crate) fn blob_path(&self, hash: &BlobHash) -> PathBuf {
        self.root
            .join(hash.shard())
            .join(format!("{}.{BLOB_EXTENSION}", hash.to_hex()))
    }

    fn get_unverified(&self, hash: &BlobHash) -> Result<Vec<u8>, StoreError> {
        let path = self.blob_path(hash);
        let compressed = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound { hash: *hash });
            }
            Err(source) => return Err(StoreError::io("read", &path, source)),
        };
        zstd::decode_all(compressed.as_slice()).map_err(|err| StoreError::Corrupt {
            hash: *hash,
            detail: format!("decompression failed: {err}"),
        })
    }

    fn verify(&self, hash: &BlobHash, bytes: &[u8]) -> Result<(), StoreError> {
        let computed = BlobHash::of(bytes);
        if computed != *hash {
            warn!(expected = %hash, %computed, "blob hash mismatch");
            return Err(StoreError::Corrupt {
                hash: *hash,
                detail: format!("content hashes to {computed}"),
            });
        }
        Ok(())
    }
}

fn scan_usage(root: &Path) -> Result<u64, StoreError> {
    let mut total = 0u64;
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(source) => return Err(StoreError::io("read", root, source)),
    };
    for entry in entries {
        let entry = entry.map_err(|source| StoreError::io("read", root, source))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let shard = match fs::read_dir(&path) {
            Ok(shard) => shard,
            Err(_) => continue,
        };
        for file in shard.flatten() {
            let file_path = file.path();
            if file_path.extension().and_then(|ext| ext.to_str()) == Some(BLOB_EXTENSION) {
                if let Ok(meta) = file.metadata() {
                    total = total.saturating_add(meta.len());
                }
            }
        }
    }
    Ok(total)
}
