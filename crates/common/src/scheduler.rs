//! Interval firing of recurring task instances.

use tracing::debug;
use uuid::Uuid;

use crate::tasks::TaskStore;

/// Fresh command identifier (UUID v4, 32 lowercase hex chars).
pub fn new_command_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// What one scheduler pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub fired: usize,
    pub skipped_unknown_template: usize,
    pub skipped_bad_interval: usize,
}

impl TickReport {
    pub fn skipped(&self) -> usize {
        self.skipped_unknown_template + self.skipped_bad_interval
    }
}

/// Fire every recurring instance whose interval has elapsed at `now`.
///
/// A fired instance gets a new command id, `lastExecuted = now` and becomes
/// pending again. This happens on elapsed time alone: an instance whose
/// previous command was never delivered is re-armed with a new id.
/// One-time instances are never touched. Instances with a non-positive
/// interval or an unknown template are skipped and stay in the list.
pub fn run_tick(store: &TaskStore, now: f64) -> TickReport {
    store.with_document_mut(|doc| {
        let mut report = TickReport::default();
        for (device, list) in doc.device_tasks.iter_mut() {
            for instance in list.iter_mut().filter(|instance| !instance.one_time) {
                if !doc.templates.contains_key(&instance.template) {
                    debug!(device = %device, template = %instance.template, "unknown template, skipping");
                    report.skipped_unknown_template += 1;
                    continue;
                }
                if instance.interval <= 0 {
                    debug!(device = %device, interval = instance.interval, "non-positive interval, skipping");
                    report.skipped_bad_interval += 1;
                    continue;
                }
                if now - instance.last_executed >= instance.interval as f64 {
                    instance.command_uuid = new_command_id();
                    instance.last_executed = now;
                    instance.consumed = false;
                    report.fired += 1;
                }
            }
        }
        report
    })
}
