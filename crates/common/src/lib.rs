// # -----------------------------
// # crates/common/src/lib.rs
// # -----------------------------
//! Shared state of the fleet daemon: device registry, task store, scheduler
//! tick, command channel wire types and the atomic file writes behind every
//! snapshot.

pub mod beacon;
pub mod checkin;
pub mod fs;
pub mod persist;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod tasks;

use std::time::{SystemTime, UNIX_EPOCH};

pub use persist::{FlushOutcome, Persistent};
pub use registry::{DeviceEntry, DeviceRegistry};
pub use tasks::{PendingCommand, TaskDocument, TaskStore, TaskStoreError};

/// Current unix time in fractional seconds, the unit of `lastExecuted`.
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}

/// Current unix time in whole seconds, the unit of `update_time`.
pub fn unix_now() -> i64 {
    now_ts() as i64
}
