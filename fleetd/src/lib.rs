//! Fleet daemon: device registry and task store snapshots, the scheduler
//! tick and the device command channel.

pub mod config;
pub mod daemon;
pub mod loops;
pub mod server;

pub use config::DaemonConfig;
pub use daemon::Daemon;
pub use server::{CommandChannelServer, SessionState};
