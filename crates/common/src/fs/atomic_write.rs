use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

/// Prefix of the sibling temp files created next to a target while writing.
pub const TEMP_PREFIX: &str = ".tmp_";

/// Replace `path` with `bytes` so that readers never observe a partial file.
///
/// The content goes to a temp file in the same directory, is fsynced, then
/// renamed over the destination. The directory entry is synced afterwards on
/// unix so the rename itself survives a crash. On failure the temp file is
/// removed and the previous content of `path` is left as it was.
pub fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = parent_dir(path);
    fs::create_dir_all(&dir)?;

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "snapshot".to_string());

    // NamedTempFile deletes itself on drop, which covers every early return.
    let mut temp = tempfile::Builder::new()
        .prefix(&format!("{}{}.", TEMP_PREFIX, file_name))
        .tempfile_in(&dir)?;

    temp.write_all(bytes)?;
    temp.flush()?;
    temp.as_file().sync_all()?;

    temp.persist(path).map_err(|err| err.error)?;
    sync_dir(&dir)
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[cfg(target_family = "unix")]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(target_family = "unix"))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

/// A single durable file written exclusively through [`write_atomically`].
#[derive(Debug, Clone)]
pub struct AtomicFileStore {
    path: PathBuf,
}

impl AtomicFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current content, or `None` when the file does not exist yet.
    pub fn read(&self) -> io::Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn write(&self, bytes: &[u8]) -> io::Result<()> {
        write_atomically(&self.path, bytes)
    }

    pub fn write_json<T: Serialize>(&self, value: &T) -> io::Result<()> {
        let bytes = serde_json::to_vec_pretty(value).map_err(|err| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Failed to serialise {}: {}", self.path.display(), err),
            )
        })?;
        self.write(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn temp_leftovers(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(TEMP_PREFIX))
            .collect()
    }

    #[test]
    fn write_creates_parent_and_replaces_content() {
        let dir = tempdir().unwrap();
        let store = AtomicFileStore::new(dir.path().join("nested/state.json"));

        assert!(store.read().unwrap().is_none());

        store.write(b"first").unwrap();
        store.write(b"second, longer content").unwrap();

        assert_eq!(store.read().unwrap().unwrap(), b"second, longer content");
        assert!(temp_leftovers(&dir.path().join("nested")).is_empty());
    }

    #[test]
    fn write_json_is_pretty_and_parseable() {
        let dir = tempdir().unwrap();
        let store = AtomicFileStore::new(dir.path().join("doc.json"));
        store
            .write_json(&serde_json::json!({"a": 1, "b": [true]}))
            .unwrap();

        let raw = String::from_utf8(store.read().unwrap().unwrap()).unwrap();
        assert!(raw.contains('\n'));
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["b"][0], true);
    }

    #[test]
    fn crash_before_rename_leaves_previous_snapshot() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("registry.json");
        write_atomically(&target, br#"{"dev-1":{"sn":"A"}}"#).unwrap();

        // What a process killed between the temp write and the rename leaves behind.
        let orphan = dir.path().join(format!("{}registry.json.abc123", TEMP_PREFIX));
        fs::write(&orphan, br#"{"dev-1":{"sn":"#).unwrap();

        let content = fs::read(&target).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&content).unwrap();
        assert_eq!(parsed["dev-1"]["sn"], "A");

        let registry = crate::registry::DeviceRegistry::open(&target);
        assert_eq!(registry.device_ids(), vec!["dev-1".to_string()]);
        assert_eq!(registry.get("dev-1")["sn"], "A");

        write_atomically(&target, br#"{"dev-1":{"sn":"B"}}"#).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&fs::read(&target).unwrap()).unwrap();
        assert_eq!(parsed["dev-1"]["sn"], "B");
    }

    #[cfg(target_family = "unix")]
    #[test]
    fn failed_rename_reports_error_and_cleans_temp() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("occupied");
        fs::create_dir_all(target.join("child")).unwrap();

        let err = write_atomically(&target, b"payload").unwrap_err();
        assert_ne!(err.kind(), io::ErrorKind::NotFound);
        assert!(target.join("child").is_dir());
        assert!(temp_leftovers(dir.path()).is_empty());
    }
}
