use std::{
    collections::{BTreeMap, BTreeSet},
    fs, io,
    path::{Path, PathBuf},
};

use crate::{BlobHash, StoreError};

/// On-disk refcount index: blob hash -> set of holder ids.
///
/// The whole index is rewritten atomically on every mutation (temp file in
/// the same directory, then rename), so a crash mid-write leaves the
/// previous index intact. Holder sets rather than bare counters make
/// `link`/`unlink` idempotent per holder.
#[derive(Debug)]
pub(crate) struct RefcountIndex {
    path: PathBuf,
    map: BTreeMap<String, BTreeSet<String>>,
}

impl RefcountIndex {
    pub(crate) fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let map = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| {
                StoreError::RefcountIndex {
                    path: path.clone(),
                    source,
                }
            })?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(StoreError::io("read", &path, source)),
        };
        Ok(Self { path, map })
    }

    /// Records `holder` as referencing `hash`. Returns `true` when the pair
    /// was newly added.
    pub(crate) fn link(&mut self, holder: &str, hash: &BlobHash) -> Result<bool, StoreError> {
        let added = self
            .map
            .entry(hash.to_hex())
            .or_default()
            .insert(holder.to_string());
        if added {
            self.save()?;
        }
        Ok(added)
    }

    /// Removes the `holder` -> `hash` pair. Returns `true` when it existed.
    pub(crate) fn unlink(&mut self, holder: &str, hash: &BlobHash) -> Result<bool, StoreError> {
        let key = hash.to_hex();
        let Some(holders) = self.map.get_mut(&key) else {
            return Ok(false);
        };
        let removed = holders.remove(holder);
        if holders.is_empty() {
            self.map.remove(&key);
        }
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    pub(crate) fn holder_count(&self, hash: &BlobHash) -> usize {
        self.map.get(&hash.to_hex()).map_or(0, BTreeSet::len)
    }

    /// Every hash with at least one holder.
    pub(crate) fn held_hashes(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(String::as_str)
    }

    fn save(&self) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(&self.map).map_err(|source| {
            StoreError::RefcountIndex {
                path: self.path.clone(),
                source,
            }
        })?;
        let dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .map_err(|source| StoreError::io("create temp file in", &dir, source))?;
        io::Write::write_all(&mut tmp, &bytes)
            .map_err(|source| StoreError::io("write", tmp.path().to_path_buf(), source))?;
        tmp.persist(&self.path)
            .map_err(|err| StoreError::io("rename into", &self.path, err.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_unlink_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("refcounts.db");
        let hash = BlobHash::of(b"payload");

        let mut index = RefcountIndex::load(&path).unwrap();
        assert!(index.link("c1", &hash).unwrap());
        assert!(!index.link("c1", &hash).unwrap());
        assert!(index.link("c2", &hash).unwrap());
        assert_eq!(index.holder_count(&hash), 2);

        // Reload from disk and keep going.
        let mut index = RefcountIndex::load(&path).unwrap();
        assert_eq!(index.holder_count(&hash), 2);
        assert!(index.unlink("c1", &hash).unwrap());
        assert!(!index.unlink("c1", &hash).unwrap());
        assert_eq!(index.holder_count(&hash), 1);
    }

    #[test]
    fn empty_holder_sets_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("refcounts.db");
        let hash = BlobHash::of(b"x");

        let mut index = RefcountIndex::load(&path).unwrap();
        index.link("c1", &hash).unwrap();
        index.unlink("c1", &hash).unwrap();
        assert_eq!(index.holder_count(&hash), 0);
        assert_eq!(index.held_hashes().count(), 0);
    }
}
