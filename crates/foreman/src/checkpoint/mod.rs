use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use content_store::BlobHash;

use crate::error::ServerError;

mod manager;

pub use manager::{
    CheckpointManager, CreateCheckpointOptions, GcSummary, RestoreReport,
};

/// One file in a checkpoint manifest.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestEntry {
    pub hash: BlobHash,
    pub mode: u32,
    pub size: u64,
}

/// A checkpoint's canonical manifest.
///
/// `files` maps relative paths (lexicographically ordered by the map) to
/// their blob entries. The checkpoint id is the SHA-256 of the canonical
/// encoding of `files` alone: metadata like message, author, tags, and
/// creation time never changes identity, so checkpointing an unchanged
/// tree twice yields the same id.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub files: BTreeMap<String, ManifestEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub author: String,
    pub message: String,
    pub created_at_unix_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Manifest {
    /// Content id over the canonical file map.
    pub fn id(&self) -> Result<String, ServerError> {
        let canonical =
            serde_json::to_vec(&self.files).map_err(|source| ServerError::Encode {
                context: "canonical manifest",
                source,
            })?;
        Ok(hex::encode(Sha256::digest(&canonical)))
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.values().map(|entry| entry.size).sum()
    }
}

/// Listing row for a stored checkpoint.
#[derive(Clone, Debug, Serialize)]
pub struct CheckpointSummary {
    pub id: String,
    pub message: String,
    pub author: String,
    pub created_at_unix_ms: u64,
    pub tags: Vec<String>,
    pub parent: Option<String>,
    pub file_count: usize,
    pub total_bytes: u64,
}

impl CheckpointSummary {
    pub fn of(id: String, manifest: &Manifest) -> Self {
        Self {
            id,
            message: manifest.message.clone(),
            author: manifest.author.clone(),
            created_at_unix_ms: manifest.created_at_unix_ms,
            tags: manifest.tags.clone(),
            parent: manifest.parent.clone(),
            file_count: manifest.files.len(),
            total_bytes: manifest.total_bytes(),
        }
    }
}

/// Manifest-level difference between two checkpoints.
#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct DiffReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
}

impl DiffReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

/// Paths in `b` but not `a` are added; paths in `a` but not `b` are
/// removed; paths whose blob hash or mode differ are modified.
pub fn diff_manifests(a: &Manifest, b: &Manifest) -> DiffReport {
    let mut report = DiffReport::default();
    for (path, entry) in &b.files {
        match a.files.get(path) {
            None => report.added.push(path.clone()),
            Some(previous) if previous != entry => report.modified.push(path.clone()),
            Some(_) => {}
        }
    }
    for path in a.files.keys() {
        if !b.files.contains_key(path) {
            report.removed.push(path.clone());
        }
    }
    report
}

const MAX_REF_NAME_BYTES: usize = 64;

/// Ref names are short ascii identifiers: alphanumeric first character,
/// then alphanumerics plus `.`, `_`, `-`. No path separators, since refs
/// are single files under `refs/`.
pub(crate) fn validate_ref_name(name: &str) -> Result<(), ServerError> {
    let invalid = || ServerError::InvalidRefName {
        name: name.to_string(),
    };
    if name.is_empty() || name.len() > MAX_REF_NAME_BYTES || !name.is_ascii() {
        return Err(invalid());
    }
    let mut chars = name.chars();
    let first = chars.next().ok_or_else(invalid)?;
    if !first.is_ascii_alphanumeric() {
        return Err(invalid());
    }
    for ch in chars {
        if !(ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-')) {
            return Err(invalid());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(files: &[(&str, &[u8], u32)]) -> Manifest {
        Manifest {
            files: files
                .iter()
                .map(|(path, contents, mode)| {
                    (
                        path.to_string(),
                        ManifestEntry {
                            hash: BlobHash::of(contents),
                            mode: *mode,
                            size: contents.len() as u64,
                        },
                    )
                })
                .collect(),
            parent: None,
            author: "tests".into(),
            message: "m".into(),
            created_at_unix_ms: 0,
            tags: Vec::new(),
        }
    }

    #[test]
    fn id_ignores_metadata() {
        let mut a = manifest(&[("a.txt", b"A", 0o644)]);
        let mut b = manifest(&[("a.txt", b"A", 0o644)]);
        a.message = "first".into();
        b.message = "second".into();
        b.created_at_unix_ms = 999;
        assert_eq!(a.id().unwrap(), b.id().unwrap());
    }

    #[test]
    fn id_tracks_content_and_mode() {
        let a = manifest(&[("a.txt", b"A", 0o644)]);
        let b = manifest(&[("a.txt", b"B", 0o644)]);
        let c = manifest(&[("a.txt", b"A", 0o755)]);
        assert_ne!(a.id().unwrap(), b.id().unwrap());
        assert_ne!(a.id().unwrap(), c.id().unwrap());
    }

    #[test]
    fn diff_is_symmetric() {
        let a = manifest(&[("same", b"x", 0o644), ("gone", b"y", 0o644), ("edit", b"1", 0o644)]);
        let b = manifest(&[("same", b"x", 0o644), ("new", b"z", 0o644), ("edit", b"2", 0o644)]);

        let ab = diff_manifests(&a, &b);
        let ba = diff_manifests(&b, &a);
        assert_eq!(ab.added, vec!["new".to_string()]);
        assert_eq!(ab.removed, vec!["gone".to_string()]);
        assert_eq!(ab.modified, vec!["edit".to_string()]);
        assert_eq!(ab.added, ba.removed);
        assert_eq!(ab.removed, ba.added);
        assert_eq!(ab.modified, ba.modified);
    }

    #[test]
    fn diff_with_self_is_empty() {
        let a = manifest(&[("a", b"x", 0o644)]);
        assert!(diff_manifests(&a, &a).is_empty());
    }

    #[test]
    fn ref_names_are_validated() {
        assert!(validate_ref_name("release-1.2").is_ok());
        assert!(validate_ref_name("main").is_ok());
        assert!(validate_ref_name("").is_err());
        assert!(validate_ref_name(".hidden").is_err());
        assert!(validate_ref_name("has/slash").is_err());
        assert!(validate_ref_name("spaced out").is_err());
    }
}
