//! Daemon configuration.
//!
//! Sources in order of precedence:
//! 1. Command-line flags (applied by the binary)
//! 2. Environment variables (`FLEETD_*`)
//! 3. Configuration file (`--config`, or `fleetd.toml` in the working directory)
//! 4. Built-in defaults

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const DEFAULT_CONFIG_FILE: &str = "fleetd.toml";
pub const DEFAULT_TCP_PORT: u16 = 2233;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Interface the command channel binds to.
    pub bind_addr: String,
    pub tcp_port: u16,
    /// Base directory for relative snapshot paths.
    pub data_dir: PathBuf,
    pub registry_file: PathBuf,
    pub tasks_file: PathBuf,
    pub registry_flush_secs: u64,
    pub tasks_flush_secs: u64,
    pub scheduler_tick_ms: u64,
    /// Close a session after this long without a frame; 0 disables.
    pub idle_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            tcp_port: DEFAULT_TCP_PORT,
            data_dir: PathBuf::from("."),
            registry_file: PathBuf::from("static/device_registry_data.json"),
            tasks_file: PathBuf::from("data/tasks.json"),
            registry_flush_secs: 5,
            tasks_flush_secs: 5,
            scheduler_tick_ms: 1000,
            idle_timeout_secs: 300,
        }
    }
}

impl DaemonConfig {
    /// Read the configuration file, falling back to defaults when none exists.
    ///
    /// An explicitly requested file must exist; the implicit `fleetd.toml`
    /// is optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => {
                if !path.is_file() {
                    bail!("configuration file {} does not exist", path.display());
                }
                path.to_path_buf()
            }
            None => {
                let candidate = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !candidate.is_file() {
                    debug!("no {} found, using defaults", DEFAULT_CONFIG_FILE);
                    return Ok(Self::default());
                }
                candidate
            }
        };

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Overlay `FLEETD_*` variables. Unparseable values are logged and ignored.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let read = |key: &str| {
            lookup(key)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        };

        if let Some(addr) = read("FLEETD_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(raw) = read("FLEETD_TCP_PORT") {
            match raw.parse::<u16>() {
                Ok(port) => self.tcp_port = port,
                Err(err) => warn!("Invalid FLEETD_TCP_PORT value '{}': {}", raw, err),
            }
        }
        if let Some(dir) = read("FLEETD_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(raw) = read("FLEETD_IDLE_TIMEOUT") {
            match raw.parse::<u64>() {
                Ok(secs) => self.idle_timeout_secs = secs,
                Err(err) => warn!("Invalid FLEETD_IDLE_TIMEOUT value '{}': {}", raw, err),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.registry_flush_secs == 0 || self.tasks_flush_secs == 0 {
            bail!("flush intervals must be at least one second");
        }
        if self.scheduler_tick_ms == 0 {
            bail!("scheduler_tick_ms must be positive");
        }
        Ok(())
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join(&self.registry_file)
    }

    pub fn tasks_path(&self) -> PathBuf {
        self.data_dir.join(&self.tasks_file)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.tcp_port)
    }

    pub fn registry_flush_period(&self) -> Duration {
        Duration::from_secs(self.registry_flush_secs)
    }

    pub fn tasks_flush_period(&self) -> Duration {
        Duration::from_secs(self.tasks_flush_secs)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}
