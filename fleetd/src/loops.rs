//! Background loops: periodic snapshot flushes and the scheduler tick.

use std::sync::Arc;
use std::time::Duration;

use fleet_common::persist::{FlushOutcome, Persistent};
use fleet_common::scheduler::{run_tick, TickReport};
use fleet_common::tasks::TaskStore;
use fleet_common::now_ts;
use tokio::sync::watch;
use tokio::task::{spawn_blocking, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Flush `store` every `period` until shutdown.
///
/// The write runs on the blocking pool. A failed flush is logged and retried
/// on the next tick; the in-memory state is untouched.
pub fn spawn_flush_loop<P>(store: Arc<P>, period: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()>
where
    P: Persistent + 'static,
{
    tokio::spawn(async move {
        let label = store.label();
        let mut ticker = ticker(period);
        // The first tick completes immediately; skip it so startup does not
        // rewrite the file it just loaded.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            let flushing = Arc::clone(&store);
            match spawn_blocking(move || flushing.flush(false)).await {
                Ok(Ok(FlushOutcome::Written)) => debug!(store = label, "snapshot written"),
                Ok(Ok(FlushOutcome::Unchanged)) => {}
                Ok(Err(err)) => warn!(store = label, "flush failed, retrying next tick: {}", err),
                Err(err) => warn!(store = label, "flush task panicked: {}", err),
            }
        }
        debug!(store = label, "flush loop stopped");
    })
}

/// Run the scheduler tick every `period` until shutdown.
pub fn spawn_scheduler_loop(
    tasks: Arc<TaskStore>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = ticker(period);
        let mut last = TickReport::default();

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            let report = run_tick(&tasks, now_ts());
            if report.fired > 0 {
                info!(fired = report.fired, "scheduler re-armed tasks");
            }
            if report.skipped() > 0
                && (report.skipped_unknown_template != last.skipped_unknown_template
                    || report.skipped_bad_interval != last.skipped_bad_interval)
            {
                warn!(
                    unknown_template = report.skipped_unknown_template,
                    bad_interval = report.skipped_bad_interval,
                    "scheduler skipping unusable task instances"
                );
            }
            last = report;
        }
        debug!("scheduler loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_common::registry::DeviceRegistry;
    use fleet_common::tasks::{TaskDocument, TaskInstance};
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn flush_loop_writes_dirty_registry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("static/devices.json");
        let registry = Arc::new(DeviceRegistry::open(&path));
        registry.merge("dev-1", json!({"sn": "A"}).as_object().cloned().unwrap());

        let (tx, rx) = watch::channel(false);
        let handle = spawn_flush_loop(Arc::clone(&registry), Duration::from_millis(20), rx);

        let mut written = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if path.exists() {
                written = true;
                break;
            }
        }
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(written, "registry snapshot never appeared");
        let saved: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(saved["dev-1"]["sn"], "A");
    }

    #[tokio::test]
    async fn scheduler_loop_fires_due_instances() {
        let dir = tempdir().unwrap();
        let mut doc = TaskDocument::from_value(json!({
            "TaskConfig": {"locate": {"type": "locate", "body": {}}}
        }));
        doc.device_tasks
            .insert("dev-1".into(), vec![TaskInstance::recurring("locate", 60)]);
        let tasks = Arc::new(TaskStore::with_document(&dir.path().join("tasks.json"), doc));

        let (tx, rx) = watch::channel(false);
        let handle = spawn_scheduler_loop(Arc::clone(&tasks), Duration::from_millis(10), rx);

        let mut pending = None;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            pending = tasks.pop_next_pending("dev-1", now_ts());
            if pending.is_some() {
                break;
            }
        }
        tx.send(true).unwrap();
        handle.await.unwrap();

        let pending = pending.expect("scheduler never armed the instance");
        assert_eq!(pending.template, "locate");
        assert_eq!(pending.command_uuid.len(), 32);
    }

    #[tokio::test]
    async fn loops_stop_on_shutdown() {
        let dir = tempdir().unwrap();
        let tasks = Arc::new(TaskStore::with_document(
            &dir.path().join("tasks.json"),
            TaskDocument::default(),
        ));
        let (tx, rx) = watch::channel(false);
        let flush = spawn_flush_loop(Arc::clone(&tasks), Duration::from_secs(3600), rx.clone());
        let tick = spawn_scheduler_loop(tasks, Duration::from_secs(3600), rx);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            flush.await.unwrap();
            tick.await.unwrap();
        })
        .await
        .expect("loops should stop promptly");
    }
}
