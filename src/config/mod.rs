//! Configuration types for A3S Serve
//!
//! Two layers live here:
//! - process configuration (`ServeConfig`), loaded from HCL at startup
//! - the control-plane data objects submitted through the admin API
//!   (`BackendConfig`, `ReplicaConfig`), which are checkpointed as JSON

pub mod backend;
pub mod replica;

pub use backend::{BackendConfig, BackendConfigUpdate, BackendMetadata, MAX_BATCH_WAIT_TIMEOUT};
pub use replica::{ActorOptions, ReplicaConfig};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, ServeError};

/// Top-level process configuration
///
/// # HCL Example
///
/// ```hcl
/// controller {
///   name           = "prod"
///   checkpoint_dir = "/var/lib/a3s-serve"
/// }
///
/// http {
///   enabled = true
///   host    = "0.0.0.0"
///   port    = 8000
/// }
///
/// runtime {
///   executor = "http"
///   base_url = "http://cluster-manager:9090"
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServeConfig {
    #[serde(default)]
    pub controller: ControllerSettings,

    #[serde(default)]
    pub http: HttpSettings,

    #[serde(default)]
    pub runtime: RuntimeSettings,
}

impl ServeConfig {
    /// Load configuration from an HCL file
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            ServeError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_hcl(&content)
    }

    /// Parse configuration from an HCL string
    pub fn from_hcl(content: &str) -> Result<Self> {
        hcl::from_str(content)
            .map_err(|e| ServeError::Config(format!("Failed to parse HCL config: {}", e)))
    }

    /// Validate the configuration for consistency
    pub fn validate(&self) -> Result<()> {
        let c = &self.controller;
        if c.name.trim().is_empty() {
            return Err(ServeError::Config(
                "controller name must not be empty".to_string(),
            ));
        }
        if c.router_refresh_ms == 0 {
            return Err(ServeError::Config(
                "router_refresh_ms must be greater than 0".to_string(),
            ));
        }
        if c.supervise_interval_ms == 0 {
            return Err(ServeError::Config(
                "supervise_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.runtime.executor == ExecutorKind::Http && self.runtime.base_url.is_none() {
            return Err(ServeError::Config(
                "runtime executor 'http' requires base_url".to_string(),
            ));
        }

        for url in &self.http.probe_urls {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ServeError::Config(format!(
                    "probe url '{}' must start with http:// or https://",
                    url
                )));
            }
        }

        Ok(())
    }
}

/// Controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSettings {
    /// Controller instance name; several instances may share one runtime
    #[serde(default = "default_controller_name")]
    pub name: String,

    /// Directory for checkpoint files (in-memory checkpoints when unset)
    #[serde(default)]
    pub checkpoint_dir: Option<String>,

    /// How often routers refresh their registry snapshot (default: 500ms)
    #[serde(default = "default_router_refresh")]
    pub router_refresh_ms: u64,

    /// How often replica liveness is checked (default: 1000ms)
    #[serde(default = "default_supervise_interval")]
    pub supervise_interval_ms: u64,

    /// Upper bound on waiting for a draining replica (default: 30s)
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// Fixed seed for the router's traffic draws (random when unset)
    #[serde(default)]
    pub router_seed: Option<u64>,
}

fn default_controller_name() -> String {
    "default".to_string()
}

fn default_router_refresh() -> u64 {
    500
}

fn default_supervise_interval() -> u64 {
    1000
}

fn default_drain_timeout() -> u64 {
    30
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            name: default_controller_name(),
            checkpoint_dir: None,
            router_refresh_ms: default_router_refresh(),
            supervise_interval_ms: default_supervise_interval(),
            drain_timeout_secs: default_drain_timeout(),
            router_seed: None,
        }
    }
}

impl ControllerSettings {
    pub fn router_refresh(&self) -> Duration {
        Duration::from_millis(self.router_refresh_ms)
    }

    pub fn supervise_interval(&self) -> Duration {
        Duration::from_millis(self.supervise_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Checkpoint file for this controller, if a directory is configured
    pub fn checkpoint_path(&self) -> Option<PathBuf> {
        self.checkpoint_dir
            .as_ref()
            .map(|dir| Path::new(dir).join(format!("{}.checkpoint.json", self.name)))
    }
}

/// Per-node HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSettings {
    /// Start the listener alongside the controller (default: false)
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_http_host")]
    pub host: String,

    #[serde(default = "default_http_port")]
    pub port: u16,

    /// Bound on waiting for listeners to answer `/-/routes` (default: 30s)
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Extra node listeners to probe at startup
    #[serde(default)]
    pub probe_urls: Vec<String>,
}

fn default_http_host() -> String {
    "127.0.0.1".to_string()
}

fn default_http_port() -> u16 {
    8000
}

fn default_probe_timeout() -> u64 {
    30
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_http_host(),
            port: default_http_port(),
            probe_timeout_secs: default_probe_timeout(),
            probe_urls: Vec::new(),
        }
    }
}

impl HttpSettings {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

/// Which replica runtime backs the controller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutorKind {
    /// In-process constructors
    #[default]
    Local,
    /// External cluster manager over HTTP
    Http,
}

/// Replica runtime settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeSettings {
    #[serde(default)]
    pub executor: ExecutorKind,

    /// Cluster manager base URL (required for `http`)
    #[serde(default)]
    pub base_url: Option<String>,
}
