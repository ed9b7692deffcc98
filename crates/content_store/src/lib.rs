#![forbid(unsafe_code)]
//! Content-addressed blob storage for checkpoint data.
//!
//! Blobs are keyed by the SHA-256 of their uncompressed bytes and stored
//! zstd-compressed in a sharded directory layout (`<root>/<aa>/<hash>.zst`,
//! where `aa` is the first two hex characters of the hash). Writes are
//! atomic (temp file + rename), so a partially written blob is never
//! visible under its final name.
//!
//! Retention is driven by a crash-safe refcount index: higher layers `link`
//! a blob to a holder id (a checkpoint) when they commit and `unlink` it
//! when they roll back or delete. [`ContentStore::gc`] removes every blob
//! that is neither held nor reachable from the root set the caller passes
//! in, plus stale temp files left behind by interrupted writes.

mod gc;
mod hash;
mod refcount;
mod store;

pub use gc::GcReport;
pub use hash::BlobHash;
pub use store::{ContentStore, PutOutcome, StoreOptions};

use std::{io, path::PathBuf};

use thiserror::Error;

/// Errors surfaced by the blob store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("blob {hash} not found")]
    NotFound { hash: BlobHash },
    #[error("blob {hash} is corrupt: {detail}")]
    Corrupt { hash: BlobHash, detail: String },
    #[error("store would exceed disk quota of {quota} bytes")]
    QuotaExceeded { quota: u64 },
    #[error("invalid blob hash `{input}`")]
    InvalidHash { input: String },
    #[error("failed to {action} `{path}`: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("refcount index at `{path}` is unreadable: {source}")]
    RefcountIndex {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub(crate) fn io(action: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io {
            action,
            path: path.into(),
            source,
        }
    }
}
