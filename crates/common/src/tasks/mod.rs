mod document;
mod store;

pub use document::{
    DefaultTask, TaskDocument, TaskInstance, TaskTemplate, DEFAULT_INTERVAL_SECS, DOCUMENT_VERSION,
};
pub use store::{PendingCommand, TaskStore, TaskStoreError};
