//! In-memory device registry with periodic durable snapshots.
//!
//! Every device that checks in gets an open JSON document keyed by its id.
//! Handlers merge partial fields into it; a background loop snapshots the
//! whole map to disk. The data lock is only ever held for in-memory copy and
//! merge work, never across I/O.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::fs::AtomicFileStore;
use crate::persist::{FlushOutcome, Persistent, SnapshotWriter};

/// Attribute document of one device. No schema beyond "is an object".
pub type DeviceEntry = Map<String, Value>;

pub struct DeviceRegistry {
    entries: Mutex<HashMap<String, DeviceEntry>>,
    writer: SnapshotWriter,
}

impl DeviceRegistry {
    /// Load the snapshot at `path`.
    ///
    /// A missing or unreadable snapshot is not an error: the registry starts
    /// empty and the next flush recreates the file.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let file = AtomicFileStore::new(path);
        let entries = match file.read() {
            Ok(Some(bytes)) => parse_snapshot(&bytes).unwrap_or_else(|err| {
                warn!(
                    path = %file.path().display(),
                    "device snapshot unreadable, starting empty: {}",
                    err
                );
                HashMap::new()
            }),
            Ok(None) => {
                info!(path = %file.path().display(), "no device snapshot yet, starting empty");
                HashMap::new()
            }
            Err(err) => {
                warn!(
                    path = %file.path().display(),
                    "failed to read device snapshot, starting empty: {}",
                    err
                );
                HashMap::new()
            }
        };

        if !entries.is_empty() {
            info!(devices = entries.len(), "device registry loaded");
        }

        Self {
            entries: Mutex::new(entries),
            writer: SnapshotWriter::new(file),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, DeviceEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the entry for `id`; empty when the device is unknown.
    pub fn get(&self, id: &str) -> DeviceEntry {
        self.lock().get(id).cloned().unwrap_or_default()
    }

    /// Top-level merge: each key of `partial` replaces the stored key wholesale.
    pub fn merge(&self, id: &str, partial: DeviceEntry) {
        let mut entries = self.lock();
        let entry = entries.entry(id.to_string()).or_default();
        for (key, value) in partial {
            entry.insert(key, value);
        }
    }

    /// Read-modify-write of one entry under the registry lock.
    ///
    /// `apply` must stay in-memory; it runs with the lock held.
    pub fn update<R>(&self, id: &str, apply: impl FnOnce(&mut DeviceEntry) -> R) -> R {
        let mut entries = self.lock();
        apply(entries.entry(id.to_string()).or_default())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Deep copy of every entry, ordered by id so serialisation is stable.
    pub fn snapshot_all(&self) -> BTreeMap<String, DeviceEntry> {
        self.lock()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect()
    }

    pub fn path(&self) -> PathBuf {
        self.writer.path().to_path_buf()
    }
}

impl Persistent for DeviceRegistry {
    fn label(&self) -> &'static str {
        "registry"
    }

    fn flush(&self, force: bool) -> io::Result<FlushOutcome> {
        let snapshot = self.snapshot_all();
        let bytes = serde_json::to_vec_pretty(&snapshot)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        self.writer.write_if_changed(&bytes, force)
    }
}

fn parse_snapshot(bytes: &[u8]) -> Result<HashMap<String, DeviceEntry>, serde_json::Error> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(HashMap::new());
    }

    let raw: BTreeMap<String, Value> = serde_json::from_slice(bytes)?;
    let mut entries = HashMap::with_capacity(raw.len());
    for (id, value) in raw {
        match value {
            Value::Object(entry) => {
                entries.insert(id, entry);
            }
            other => warn!(device = %id, kind = %json_kind(&other), "dropping non-object device entry"),
        }
    }
    Ok(entries)
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
