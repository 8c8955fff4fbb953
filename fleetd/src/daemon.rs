//! Daemon assembly: open the stores, bind the command channel and run the
//! background loops until shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use fleet_common::persist::Persistent;
use fleet_common::registry::DeviceRegistry;
use fleet_common::tasks::TaskStore;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{spawn_blocking, JoinHandle};
use tracing::{info, warn};

use crate::config::DaemonConfig;
use crate::loops::{spawn_flush_loop, spawn_scheduler_loop};
use crate::server::CommandChannelServer;

pub struct Daemon {
    registry: Arc<DeviceRegistry>,
    tasks: Arc<TaskStore>,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    server: JoinHandle<Result<()>>,
    loops: Vec<JoinHandle<()>>,
}

impl Daemon {
    /// Start every component described by `config`.
    ///
    /// A missing or unreadable task configuration aborts startup. The device
    /// registry starts empty when its snapshot is missing or corrupt.
    pub async fn start(config: &DaemonConfig) -> Result<Self> {
        let tasks_path = config.tasks_path();
        let tasks = TaskStore::open(&tasks_path)
            .with_context(|| format!("cannot load task configuration from {}", tasks_path.display()))?;
        let tasks = Arc::new(tasks);
        let registry = Arc::new(DeviceRegistry::open(config.registry_path()));
        info!(devices = registry.len(), "device registry ready");

        let listen_addr = config.listen_addr();
        let listener = TcpListener::bind(&listen_addr)
            .await
            .with_context(|| format!("failed to bind command channel on {}", listen_addr))?;
        let local_addr = listener.local_addr()?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let loops = vec![
            spawn_flush_loop(Arc::clone(&registry), config.registry_flush_period(), shutdown_rx.clone()),
            spawn_flush_loop(Arc::clone(&tasks), config.tasks_flush_period(), shutdown_rx.clone()),
            spawn_scheduler_loop(Arc::clone(&tasks), config.scheduler_tick(), shutdown_rx.clone()),
        ];

        let server = Arc::new(CommandChannelServer::new(Arc::clone(&tasks), config.idle_timeout()));
        let server = tokio::spawn(server.serve(listener, shutdown_rx));

        info!(addr = %local_addr, "fleet daemon started");
        Ok(Self {
            registry,
            tasks,
            local_addr,
            shutdown,
            server,
            loops,
        })
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn tasks(&self) -> &Arc<TaskStore> {
        &self.tasks
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, close sessions, stop the loops and write both stores
    /// one last time.
    pub async fn shutdown(self) -> Result<()> {
        info!("shutting down fleet daemon");
        // Receivers may already be gone if a loop ended early.
        let _ = self.shutdown.send(true);

        match self.server.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("command channel ended with error: {:#}", err),
            Err(err) => warn!("command channel task failed: {}", err),
        }
        for handle in self.loops {
            if let Err(err) = handle.await {
                warn!("background loop failed: {}", err);
            }
        }

        // Both stores are written even if the first write fails.
        let registry = final_flush(self.registry).await;
        let tasks = final_flush(self.tasks).await;
        registry.and(tasks)?;
        info!("fleet daemon stopped");
        Ok(())
    }
}

async fn final_flush<P: Persistent + 'static>(store: Arc<P>) -> Result<()> {
    let label = store.label();
    spawn_blocking(move || store.flush(true))
        .await
        .context("final flush task failed")?
        .with_context(|| format!("final flush of {} failed", label))?;
    Ok(())
}
