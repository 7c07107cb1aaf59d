//! Backend registry — tag → (backend config, replica config)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::{BackendConfig, BackendConfigUpdate, ReplicaConfig};
use crate::error::{Result, ServeError};

/// A registered backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendEntry {
    pub config: BackendConfig,
    pub replica_config: ReplicaConfig,
}

/// Registry of backends, keyed by tag
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendRegistry {
    backends: BTreeMap<String, BackendEntry>,
}

impl BackendRegistry {
    /// Register a backend, resolving and validating its config
    pub fn create(
        &mut self,
        tag: &str,
        replica_config: ReplicaConfig,
        options: BackendConfigUpdate,
    ) -> Result<&BackendEntry> {
        if tag.trim().is_empty() {
            return Err(ServeError::Validation(
                "backend tag must not be empty".to_string(),
            ));
        }
        if self.backends.contains_key(tag) {
            return Err(ServeError::Conflict(format!(
                "Cannot create backend. Backend '{}' is already registered.",
                tag
            )));
        }
        replica_config.validate()?;
        let config = BackendConfig::resolve(options, replica_config.metadata())?;

        Ok(self.backends.entry(tag.to_string()).or_insert(BackendEntry {
            config,
            replica_config,
        }))
    }

    /// Merge the supplied fields into a backend's config
    pub fn update_config(
        &mut self,
        tag: &str,
        update: &BackendConfigUpdate,
    ) -> Result<&BackendConfig> {
        let entry = self
            .backends
            .get_mut(tag)
            .ok_or_else(|| not_found(tag))?;
        entry.config = entry.config.merged(update)?;
        Ok(&entry.config)
    }

    /// Remove a backend. Reference checks are the caller's job.
    pub fn remove(&mut self, tag: &str) -> Result<BackendEntry> {
        self.backends.remove(tag).ok_or_else(|| not_found(tag))
    }

    /// Config of one backend
    pub fn get(&self, tag: &str) -> Result<&BackendConfig> {
        self.entry(tag).map(|e| &e.config)
    }

    /// Full entry of one backend
    pub fn entry(&self, tag: &str) -> Result<&BackendEntry> {
        self.backends.get(tag).ok_or_else(|| not_found(tag))
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.backends.contains_key(tag)
    }

    /// Snapshot of all backend configs
    pub fn list(&self) -> BTreeMap<String, BackendConfig> {
        self.backends
            .iter()
            .map(|(tag, e)| (tag.clone(), e.config.clone()))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BackendEntry)> {
        self.backends.iter()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

fn not_found(tag: &str) -> ServeError {
    ServeError::NotFound(format!("backend '{}' is not registered", tag))
}
