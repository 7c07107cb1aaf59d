//! Control-plane registries
//!
//! [`Registries`] is the unit the controller mutates, checkpoints and
//! publishes to routers. Operations that span both registries (reference
//! checks, backend existence) live here; single-registry rules live in
//! the submodules.

pub mod backend;
pub mod endpoint;
pub mod traffic;

pub use backend::{BackendEntry, BackendRegistry};
pub use endpoint::{Endpoint, EndpointInfo, EndpointRegistry};
pub use traffic::TrafficPolicy;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::{BackendConfig, BackendConfigUpdate, ReplicaConfig};
use crate::error::{Result, ServeError};

/// Endpoint and backend registries, always mutated together
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Registries {
    #[serde(default)]
    pub endpoints: EndpointRegistry,
    #[serde(default)]
    pub backends: BackendRegistry,
}

impl Registries {
    pub fn create_endpoint(
        &mut self,
        name: &str,
        backend: &str,
        route: Option<&str>,
        methods: Option<&[String]>,
    ) -> Result<()> {
        self.endpoints
            .create(name, route, methods, backend, 1.0, &self.backends)?;
        Ok(())
    }

    pub fn delete_endpoint(&mut self, name: &str) -> Result<()> {
        self.endpoints.delete(name).map(|_| ())
    }

    pub fn create_backend(
        &mut self,
        tag: &str,
        replica_config: ReplicaConfig,
        options: BackendConfigUpdate,
    ) -> Result<()> {
        self.backends.create(tag, replica_config, options).map(|_| ())
    }

    pub fn update_backend_config(
        &mut self,
        tag: &str,
        update: &BackendConfigUpdate,
    ) -> Result<()> {
        self.backends.update_config(tag, update).map(|_| ())
    }

    /// Remove a backend that no endpoint references
    pub fn delete_backend(&mut self, tag: &str) -> Result<BackendEntry> {
        if !self.backends.contains(tag) {
            return Err(ServeError::NotFound(format!(
                "backend '{}' is not registered",
                tag
            )));
        }
        let users = self.endpoints.referencing(tag);
        if !users.is_empty() {
            return Err(ServeError::Conflict(format!(
                "backend '{}' is still referenced by endpoint(s) {}; \
                 remove it from their traffic policy first",
                tag,
                users.join(", ")
            )));
        }
        self.backends.remove(tag)
    }

    pub fn set_traffic(&mut self, endpoint: &str, weights: BTreeMap<String, f64>) -> Result<()> {
        self.endpoints.set_traffic(endpoint, weights, &self.backends)
    }

    pub fn shadow_traffic(&mut self, endpoint: &str, backend: &str, proportion: f64) -> Result<()> {
        self.endpoints
            .shadow_traffic(endpoint, backend, proportion, &self.backends)
    }

    pub fn list_endpoints(&self) -> BTreeMap<String, EndpointInfo> {
        self.endpoints.list()
    }

    pub fn list_backends(&self) -> BTreeMap<String, BackendConfig> {
        self.backends.list()
    }

    /// Check the cross-registry invariant: every backend named by a policy exists.
    ///
    /// Holds after every successful operation; used to vet recovered state.
    pub fn check_references(&self) -> Result<()> {
        for (name, endpoint) in self.endpoints.iter() {
            if let Some(tag) = endpoint
                .traffic
                .backends()
                .find(|tag| !self.backends.contains(tag))
            {
                return Err(ServeError::Checkpoint(format!(
                    "endpoint '{}' references unknown backend '{}'",
                    name, tag
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_backends(tags: &[&str]) -> Registries {
        let mut reg = Registries::default();
        for tag in tags {
            reg.create_backend(tag, ReplicaConfig::new("echo"), Default::default())
                .unwrap();
        }
        reg
    }

    #[test]
    fn test_delete_backend_referenced_by_weights() {
        let mut reg = with_backends(&["v1"]);
        reg.create_endpoint("api", "v1", Some("/api"), None).unwrap();
        let before = reg.clone();

        let err = reg.delete_backend("v1").unwrap_err();
        assert!(matches!(err, ServeError::Conflict(_)));
        assert!(err.to_string().contains("api"));
        assert_eq!(reg, before);
    }

    #[test]
    fn test_delete_backend_referenced_by_shadow() {
        let mut reg = with_backends(&["v1", "v2"]);
        reg.create_endpoint("api", "v1", None, None).unwrap();
        reg.shadow_traffic("api", "v2", 0.1).unwrap();
        assert!(matches!(
            reg.delete_backend("v2"),
            Err(ServeError::Conflict(_))
        ));

        reg.shadow_traffic("api", "v2", 0.0).unwrap();
        reg.delete_backend("v2").unwrap();
        assert!(!reg.list_backends().contains_key("v2"));
    }

    #[test]
    fn test_delete_backend_after_endpoint_removed() {
        let mut reg = with_backends(&["v1"]);
        reg.create_endpoint("api", "v1", None, None).unwrap();
        reg.delete_endpoint("api").unwrap();
        reg.delete_backend("v1").unwrap();
        assert!(reg.list_backends().is_empty());
    }

    #[test]
    fn test_delete_unknown_backend() {
        let mut reg = Registries::default();
        assert!(matches!(
            reg.delete_backend("ghost"),
            Err(ServeError::NotFound(_))
        ));
    }

    #[test]
    fn test_set_traffic_reflected_in_list() {
        let mut reg = with_backends(&["a", "b"]);
        reg.create_endpoint("api", "a", None, None).unwrap();
        let weights: BTreeMap<_, _> = [("a".to_string(), 0.7), ("b".to_string(), 0.3)]
            .into_iter()
            .collect();
        reg.set_traffic("api", weights.clone()).unwrap();
        assert_eq!(reg.list_endpoints()["api"].traffic, weights);
        reg.check_references().unwrap();
    }

    #[test]
    fn test_check_references_detects_dangling() {
        let mut reg = with_backends(&["a"]);
        reg.create_endpoint("api", "a", None, None).unwrap();
        reg.backends.remove("a").unwrap();
        assert!(reg.check_references().is_err());
    }

    #[test]
    fn test_serde_roundtrip_preserves_state() {
        let mut reg = with_backends(&["a", "b"]);
        reg.create_endpoint("api", "a", Some("/api"), None).unwrap();
        reg.shadow_traffic("api", "b", 0.25).unwrap();
        let json = serde_json::to_string(&reg).unwrap();
        let back: Registries = serde_json::from_str(&json).unwrap();
        assert_eq!(back, reg);
    }
}
