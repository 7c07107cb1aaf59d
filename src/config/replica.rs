//! Replica configuration — how to construct one worker instance of a backend

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::backend::BackendMetadata;
use crate::error::{Result, ServeError};

/// Placement and resource options handed to the replica runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorOptions {
    /// CPUs reserved per replica (default: 1.0)
    #[serde(default = "default_num_cpus")]
    pub num_cpus: f64,

    /// GPUs reserved per replica (default: 0.0)
    #[serde(default)]
    pub num_gpus: f64,

    /// Memory reserved per replica in bytes
    #[serde(default)]
    pub memory: Option<u64>,

    /// Custom resources (e.g., "accelerator" → 1.0)
    #[serde(default)]
    pub resources: BTreeMap<String, f64>,
}

fn default_num_cpus() -> f64 {
    1.0
}

impl Default for ActorOptions {
    fn default() -> Self {
        Self {
            num_cpus: default_num_cpus(),
            num_gpus: 0.0,
            memory: None,
            resources: BTreeMap::new(),
        }
    }
}

/// Describes how to build a replica: a constructor registered with the
/// runtime, its arguments, and placement options.
///
/// The constructor is referenced by name so the configuration can be
/// checkpointed and replayed after a controller restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Name of the constructor registered with the replica runtime
    pub constructor: String,

    /// Arguments passed to the constructor
    #[serde(default)]
    pub init_args: Vec<serde_json::Value>,

    /// Worker placement / resource options
    #[serde(default)]
    pub actor_options: ActorOptions,

    /// Whether the callable takes a list of requests per invocation
    #[serde(default)]
    pub accepts_batches: bool,

    /// Whether the callable blocks its thread (runs on the blocking pool)
    #[serde(default)]
    pub is_blocking: bool,
}

impl ReplicaConfig {
    /// Create a replica config for a registered constructor
    pub fn new(constructor: impl Into<String>) -> Self {
        Self {
            constructor: constructor.into(),
            init_args: Vec::new(),
            actor_options: ActorOptions::default(),
            accepts_batches: false,
            is_blocking: false,
        }
    }

    /// Set constructor arguments
    pub fn with_init_args(mut self, args: Vec<serde_json::Value>) -> Self {
        self.init_args = args;
        self
    }

    /// Set placement options
    pub fn with_actor_options(mut self, options: ActorOptions) -> Self {
        self.actor_options = options;
        self
    }

    /// Mark the callable as accepting batches
    pub fn accept_batch(mut self) -> Self {
        self.accepts_batches = true;
        self
    }

    /// Mark the callable as blocking
    pub fn blocking(mut self) -> Self {
        self.is_blocking = true;
        self
    }

    /// Capability flags carried onto the backend config
    pub fn metadata(&self) -> BackendMetadata {
        BackendMetadata {
            accepts_batches: self.accepts_batches,
            is_blocking: self.is_blocking,
        }
    }

    /// Validate the replica config
    pub fn validate(&self) -> Result<()> {
        if self.constructor.trim().is_empty() {
            return Err(ServeError::Validation(
                "replica constructor must not be empty".to_string(),
            ));
        }
        let opts = &self.actor_options;
        if !opts.num_cpus.is_finite() || opts.num_cpus < 0.0 {
            return Err(ServeError::Validation(format!(
                "num_cpus ({}) must be a non-negative number",
                opts.num_cpus
            )));
        }
        if !opts.num_gpus.is_finite() || opts.num_gpus < 0.0 {
            return Err(ServeError::Validation(format!(
                "num_gpus ({}) must be a non-negative number",
                opts.num_gpus
            )));
        }
        if let Some((name, amount)) = opts
            .resources
            .iter()
            .find(|(_, v)| !v.is_finite() || **v < 0.0)
        {
            return Err(ServeError::Validation(format!(
                "resource '{}' has invalid amount {}",
                name, amount
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_flags() {
        let rc = ReplicaConfig::new("echo").accept_batch().blocking();
        assert!(rc.accepts_batches);
        assert!(rc.is_blocking);
        let meta = rc.metadata();
        assert!(meta.accepts_batches);
        assert!(meta.is_blocking);
    }

    #[test]
    fn test_defaults_from_toml() {
        let rc: ReplicaConfig = toml::from_str(r#"constructor = "model""#).unwrap();
        assert_eq!(rc.constructor, "model");
        assert!(rc.init_args.is_empty());
        assert_eq!(rc.actor_options.num_cpus, 1.0);
        assert_eq!(rc.actor_options.num_gpus, 0.0);
        assert!(!rc.accepts_batches);
    }

    #[test]
    fn test_validate_empty_constructor() {
        let err = ReplicaConfig::new("  ").validate().unwrap_err();
        assert!(err.to_string().contains("constructor"));
    }

    #[test]
    fn test_validate_negative_resources() {
        let mut opts = ActorOptions::default();
        opts.resources.insert("tpu".into(), -1.0);
        let err = ReplicaConfig::new("m")
            .with_actor_options(opts)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("tpu"));

        let opts = ActorOptions {
            num_gpus: f64::NAN,
            ..Default::default()
        };
        assert!(ReplicaConfig::new("m")
            .with_actor_options(opts)
            .validate()
            .is_err());
    }

    #[test]
    fn test_init_args_roundtrip() {
        let rc = ReplicaConfig::new("counter").with_init_args(vec![serde_json::json!(5)]);
        let json = serde_json::to_string(&rc).unwrap();
        let parsed: ReplicaConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, rc);
    }
}
