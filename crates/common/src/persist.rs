//! Change-detecting snapshot writes shared by every in-memory store.

use std::io;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::fs::AtomicFileStore;

/// Result of a flush request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Written,
    Unchanged,
}

/// An in-memory store that can be snapshotted to disk.
pub trait Persistent: Send + Sync {
    /// Short name used in logs ("registry", "tasks").
    fn label(&self) -> &'static str;

    /// Copy the store out and write it. With `force == false` the write is
    /// skipped when the content matches the last successful write.
    fn flush(&self, force: bool) -> io::Result<FlushOutcome>;
}

/// Writes serialised snapshots through an [`AtomicFileStore`], remembering the
/// digest of the last successful write.
///
/// The internal mutex only serialises writers of this one file; it is never
/// the lock guarding the store's data.
#[derive(Debug)]
pub struct SnapshotWriter {
    file: AtomicFileStore,
    last_digest: Mutex<Option<[u8; 32]>>,
}

impl SnapshotWriter {
    pub fn new(file: AtomicFileStore) -> Self {
        Self {
            file,
            last_digest: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn write_if_changed(&self, bytes: &[u8], force: bool) -> io::Result<FlushOutcome> {
        let digest: [u8; 32] = Sha256::digest(bytes).into();
        let mut last = self
            .last_digest
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if !force && last.as_ref() == Some(&digest) {
            return Ok(FlushOutcome::Unchanged);
        }

        self.file.write(bytes)?;
        *last = Some(digest);
        debug!(
            path = %self.file.path().display(),
            digest = %hex::encode(&digest[..6]),
            bytes = bytes.len(),
            "snapshot written"
        );
        Ok(FlushOutcome::Written)
    }
}
