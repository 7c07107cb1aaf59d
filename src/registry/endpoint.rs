//! Endpoint registry — named routes with their traffic policy

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::backend::BackendRegistry;
use super::traffic::TrafficPolicy;
use crate::error::{Result, ServeError};

/// A registered endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    /// HTTP path, unique across endpoints
    pub route: Option<String>,
    /// Uppercase HTTP methods accepted by the endpoint
    pub methods: BTreeSet<String>,
    pub traffic: TrafficPolicy,
}

impl Endpoint {
    /// Whether the endpoint accepts a request method (case-insensitive)
    pub fn accepts_method(&self, method: &str) -> bool {
        self.methods.contains(&method.to_ascii_uppercase())
    }
}

/// Read-only view of an endpoint returned by `list`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub route: Option<String>,
    pub methods: Vec<String>,
    pub traffic: BTreeMap<String, f64>,
    pub shadows: BTreeMap<String, f64>,
}

/// Registry of endpoints, keyed by name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointRegistry {
    endpoints: BTreeMap<String, Endpoint>,
}

impl EndpointRegistry {
    /// Create (or re-create with a new route/methods) an endpoint served by
    /// `initial_backend`.
    ///
    /// `weight` must describe a complete distribution, so anything but 1.0
    /// is rejected.
    pub fn create(
        &mut self,
        name: &str,
        route: Option<&str>,
        methods: Option<&[String]>,
        initial_backend: &str,
        weight: f64,
        backends: &BackendRegistry,
    ) -> Result<&Endpoint> {
        if name.trim().is_empty() {
            return Err(ServeError::Validation(
                "endpoint name must not be empty".to_string(),
            ));
        }
        if let Some(route) = route {
            if !route.starts_with('/') {
                return Err(ServeError::Validation(format!(
                    "route must be a string starting with '/', got '{}'",
                    route
                )));
            }
        }
        let methods = normalize_methods(methods)?;
        if !backends.contains(initial_backend) {
            return Err(ServeError::Validation(format!(
                "backend '{}' is not registered",
                initial_backend
            )));
        }
        let mut weights = BTreeMap::new();
        weights.insert(initial_backend.to_string(), weight);
        let traffic = TrafficPolicy::new(weights)?;

        if let Some(existing) = self.endpoints.get(name) {
            if existing.route.as_deref() == route && existing.methods == methods {
                return Err(ServeError::Conflict(format!(
                    "Route '{}' is already registered to endpoint '{}' with methods {:?}. \
                     To set the backend for this endpoint, use set_traffic.",
                    route.unwrap_or("None"),
                    name,
                    methods
                )));
            }
        }
        if let Some(route) = route {
            if let Some(owner) = self
                .endpoints
                .values()
                .find(|e| e.name != name && e.route.as_deref() == Some(route))
            {
                return Err(ServeError::Conflict(format!(
                    "route '{}' is already owned by endpoint '{}'",
                    route, owner.name
                )));
            }
        }

        let endpoint = Endpoint {
            name: name.to_string(),
            route: route.map(str::to_string),
            methods,
            traffic,
        };
        self.endpoints.insert(name.to_string(), endpoint);
        Ok(&self.endpoints[name])
    }

    /// Remove an endpoint and its policy; backends are untouched
    pub fn delete(&mut self, name: &str) -> Result<Endpoint> {
        self.endpoints
            .remove(name)
            .ok_or_else(|| ServeError::NotFound(format!("endpoint '{}' does not exist", name)))
    }

    /// Replace an endpoint's primary weights
    pub fn set_traffic(
        &mut self,
        name: &str,
        weights: BTreeMap<String, f64>,
        backends: &BackendRegistry,
    ) -> Result<()> {
        if let Some(missing) = weights.keys().find(|tag| !backends.contains(tag)) {
            return Err(ServeError::Validation(format!(
                "attempted to assign traffic to backend '{}' which is not registered",
                missing
            )));
        }
        self.endpoint_mut(name)?.traffic.set_weights(weights)
    }

    /// Set (or clear with proportion 0) a shadow entry
    pub fn shadow_traffic(
        &mut self,
        name: &str,
        backend: &str,
        proportion: f64,
        backends: &BackendRegistry,
    ) -> Result<()> {
        if !backends.contains(backend) {
            return Err(ServeError::Validation(format!(
                "attempted to shadow traffic to backend '{}' which is not registered",
                backend
            )));
        }
        self.endpoint_mut(name)?.traffic.set_shadow(backend, proportion)
    }

    fn endpoint_mut(&mut self, name: &str) -> Result<&mut Endpoint> {
        self.endpoints.get_mut(name).ok_or_else(|| {
            ServeError::Validation(format!("endpoint '{}' is not registered", name))
        })
    }

    pub fn get(&self, name: &str) -> Option<&Endpoint> {
        self.endpoints.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.endpoints.contains_key(name)
    }

    /// Snapshot of every endpoint
    pub fn list(&self) -> BTreeMap<String, EndpointInfo> {
        self.endpoints
            .iter()
            .map(|(name, e)| {
                let info = EndpointInfo {
                    route: e.route.clone(),
                    methods: e.methods.iter().cloned().collect(),
                    traffic: e.traffic.weights.clone(),
                    shadows: e.traffic.shadow.clone(),
                };
                (name.clone(), info)
            })
            .collect()
    }

    /// Names of endpoints whose policy mentions a backend
    pub fn referencing(&self, backend: &str) -> Vec<String> {
        self.endpoints
            .values()
            .filter(|e| e.traffic.references(backend))
            .map(|e| e.name.clone())
            .collect()
    }

    /// route → endpoint name, for endpoints that have a route
    pub fn routes(&self) -> BTreeMap<String, String> {
        self.endpoints
            .values()
            .filter_map(|e| e.route.clone().map(|r| (r, e.name.clone())))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Endpoint)> {
        self.endpoints.iter()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// Uppercase and validate methods; `None` means `{GET}`
pub fn normalize_methods(methods: Option<&[String]>) -> Result<BTreeSet<String>> {
    let Some(methods) = methods else {
        return Ok(BTreeSet::from(["GET".to_string()]));
    };
    if methods.is_empty() {
        return Err(ServeError::Validation(
            "methods must contain at least one HTTP method".to_string(),
        ));
    }
    methods
        .iter()
        .map(|m| {
            let upper = m.trim().to_ascii_uppercase();
            http::Method::from_bytes(upper.as_bytes())
                .map(|_| upper.clone())
                .map_err(|_| ServeError::Validation(format!("invalid HTTP method '{}'", m)))
        })
        .collect()
}
