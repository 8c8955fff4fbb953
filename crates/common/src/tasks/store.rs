use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::document::{DefaultTask, TaskDocument, TaskInstance, TaskTemplate};
use crate::fs::AtomicFileStore;
use crate::persist::{FlushOutcome, Persistent, SnapshotWriter};
use crate::scheduler::new_command_id;

#[derive(Debug, Error)]
pub enum TaskStoreError {
    #[error("task configuration {0} does not exist; create it before starting the daemon")]
    MissingConfig(PathBuf),

    #[error("failed to read task configuration {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("task configuration {path} is not valid JSON: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("device {0} has no task list")]
    UnknownDevice(String),

    #[error("task index {index} out of range for device {device} ({len} tasks)")]
    IndexOutOfRange {
        device: String,
        index: usize,
        len: usize,
    },

    #[error("task template {0} is not defined")]
    UnknownTemplate(String),

    #[error("interval must be positive, got {0}")]
    InvalidInterval(i64),
}

/// A command claimed for delivery by [`TaskStore::pop_next_pending`].
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCommand {
    pub template: String,
    pub command_uuid: String,
    pub kind: Value,
    pub body: Value,
}

/// Owner of the task document: templates, default policy and the per-device
/// instance lists.
pub struct TaskStore {
    document: Mutex<TaskDocument>,
    writer: SnapshotWriter,
}

impl TaskStore {
    /// Load the task configuration at `path`.
    ///
    /// Unlike the device registry this is a hard start: without a
    /// configuration file there is nothing to schedule.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, TaskStoreError> {
        let file = AtomicFileStore::new(path);
        let path = file.path().to_path_buf();

        let bytes = file
            .read()
            .map_err(|source| TaskStoreError::Io {
                path: path.clone(),
                source,
            })?
            .ok_or_else(|| TaskStoreError::MissingConfig(path.clone()))?;

        let document = if bytes.iter().all(u8::is_ascii_whitespace) {
            warn!(path = %path.display(), "task configuration is empty, using empty document");
            TaskDocument::default()
        } else {
            let raw: Value = serde_json::from_slice(&bytes).map_err(|source| {
                TaskStoreError::Corrupt {
                    path: path.clone(),
                    source,
                }
            })?;
            TaskDocument::from_value(raw)
        };

        info!(
            path = %path.display(),
            templates = document.templates.len(),
            devices = document.device_tasks.len(),
            "task store loaded"
        );

        Ok(Self::with_document(file.path(), document))
    }

    /// Build a store around an in-memory document persisted to `path`.
    pub fn with_document(path: &Path, document: TaskDocument) -> Self {
        Self {
            document: Mutex::new(document.normalized()),
            writer: SnapshotWriter::new(AtomicFileStore::new(path)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TaskDocument> {
        self.document.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `apply` against the live document under the store lock.
    pub(crate) fn with_document_mut<R>(&self, apply: impl FnOnce(&mut TaskDocument) -> R) -> R {
        apply(&mut self.lock())
    }

    /// Copy of the current document.
    pub fn load(&self) -> TaskDocument {
        self.lock().clone()
    }

    /// Swap in a whole new document.
    pub fn replace(&self, document: TaskDocument) {
        let document = document.normalized();
        *self.lock() = document;
    }

    /// Normalise arbitrary JSON (an admin upload) and swap it in.
    pub fn replace_value(&self, raw: Value) {
        self.replace(TaskDocument::from_value(raw));
    }

    pub fn task_exists_for_device(&self, device: &str) -> bool {
        self.lock().device_tasks.contains_key(device)
    }

    /// Materialise the default policy for a device that has no task list.
    ///
    /// Returns `false` without touching anything when the device already has
    /// a list, even an empty one.
    pub fn add_default_tasks(&self, device: &str) -> bool {
        let mut doc = self.lock();
        if doc.device_tasks.contains_key(device) {
            return false;
        }

        let mut instances = Vec::with_capacity(doc.default_tasks.len());
        for default in &doc.default_tasks {
            if default.name.is_empty() || !doc.templates.contains_key(&default.name) {
                warn!(
                    device = %device,
                    template = %default.name,
                    "default task references unknown template, skipping"
                );
                continue;
            }
            instances.push(TaskInstance::recurring(default.name.clone(), default.interval));
        }

        info!(device = %device, tasks = instances.len(), "default tasks assigned");
        doc.device_tasks.insert(device.to_string(), instances);
        true
    }

    /// Claim the first undelivered instance of `device`, in list order.
    ///
    /// Scan and claim happen under one lock acquisition, so concurrent polls
    /// for the same device never receive the same instance. Pending instances
    /// whose template has disappeared are skipped and left as they are.
    pub fn pop_next_pending(&self, device: &str, now: f64) -> Option<PendingCommand> {
        let mut guard = self.lock();
        let doc = &mut *guard;
        let list = doc.device_tasks.get_mut(device)?;

        for instance in list.iter_mut().filter(|instance| !instance.consumed) {
            let Some(template) = doc.templates.get(&instance.template) else {
                warn!(
                    device = %device,
                    template = %instance.template,
                    "pending task references unknown template, skipping"
                );
                continue;
            };

            instance.consumed = true;
            instance.last_executed = now;
            debug!(device = %device, command = %instance.command_uuid, "task claimed");

            return Some(PendingCommand {
                template: instance.template.clone(),
                command_uuid: instance.command_uuid.clone(),
                kind: template.kind.clone(),
                body: template.body.clone(),
            });
        }
        None
    }

    /// Append a recurring instance; it fires on the next scheduler tick.
    pub fn add_task(&self, device: &str, template: &str, interval: i64) -> Result<(), TaskStoreError> {
        if interval <= 0 {
            return Err(TaskStoreError::InvalidInterval(interval));
        }
        let mut doc = self.lock();
        if !doc.templates.contains_key(template) {
            return Err(TaskStoreError::UnknownTemplate(template.to_string()));
        }
        doc.device_tasks
            .entry(device.to_string())
            .or_default()
            .push(TaskInstance::recurring(template, interval));
        Ok(())
    }

    /// Queue a single-delivery command. The scheduler never touches it; it
    /// stays in the list until deleted.
    pub fn issue_one_time(&self, device: &str, template: &str, now: f64) -> Result<String, TaskStoreError> {
        let mut doc = self.lock();
        if !doc.templates.contains_key(template) {
            return Err(TaskStoreError::UnknownTemplate(template.to_string()));
        }
        let command_uuid = new_command_id();
        doc.device_tasks
            .entry(device.to_string())
            .or_default()
            .push(TaskInstance::one_time(template, command_uuid.clone(), now));
        info!(device = %device, template = %template, command = %command_uuid, "one-time command queued");
        Ok(command_uuid)
    }

    pub fn update_interval(&self, device: &str, index: usize, interval: i64) -> Result<(), TaskStoreError> {
        if interval <= 0 {
            return Err(TaskStoreError::InvalidInterval(interval));
        }
        let mut doc = self.lock();
        let instance = instance_mut(&mut doc, device, index)?;
        instance.interval = interval;
        Ok(())
    }

    pub fn delete_task(&self, device: &str, index: usize) -> Result<TaskInstance, TaskStoreError> {
        let mut doc = self.lock();
        let list = doc
            .device_tasks
            .get_mut(device)
            .ok_or_else(|| TaskStoreError::UnknownDevice(device.to_string()))?;
        if index >= list.len() {
            return Err(TaskStoreError::IndexOutOfRange {
                device: device.to_string(),
                index,
                len: list.len(),
            });
        }
        Ok(list.remove(index))
    }

    pub fn set_default_tasks(&self, defaults: Vec<DefaultTask>) {
        self.lock().default_tasks = defaults;
    }

    /// Replace the whole template mapping. Instances referencing a name that
    /// is no longer defined are kept and skipped until it comes back.
    pub fn set_templates(&self, templates: BTreeMap<String, TaskTemplate>) {
        self.lock().templates = templates;
    }

    pub fn path(&self) -> &Path {
        self.writer.path()
    }
}

fn instance_mut<'a>(
    doc: &'a mut TaskDocument,
    device: &str,
    index: usize,
) -> Result<&'a mut TaskInstance, TaskStoreError> {
    let list = doc
        .device_tasks
        .get_mut(device)
        .ok_or_else(|| TaskStoreError::UnknownDevice(device.to_string()))?;
    let len = list.len();
    list.get_mut(index).ok_or_else(|| TaskStoreError::IndexOutOfRange {
        device: device.to_string(),
        index,
        len,
    })
}

impl Persistent for TaskStore {
    fn label(&self) -> &'static str {
        "tasks"
    }

    fn flush(&self, force: bool) -> io::Result<FlushOutcome> {
        let snapshot = self.load();
        let bytes = serde_json::to_vec_pretty(&snapshot)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        self.writer.write_if_changed(&bytes, force)
    }
}
