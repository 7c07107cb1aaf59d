//! Replica runtime — trait and implementations for starting and stopping replicas
//!
//! Provides the `ReplicaRuntime` async trait with two implementations:
//! - `LocalRuntime` — builds replicas in-process from constructors registered by name
//! - `HttpRuntime` — asks an external cluster manager to run replicas and
//!   invokes them over HTTP

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use super::{
    FunctionReplica, InstanceReplica, ReplicaHandle, ServeCallable, ServeInstance, ServeRequest,
};
use crate::config::ReplicaConfig;
use crate::error::{Result, ServeError};

/// Capability to start, stop and observe replicas
#[async_trait]
pub trait ReplicaRuntime: Send + Sync {
    /// Start one replica of `backend` and wait until it can serve
    async fn spawn(&self, backend: &str, config: &ReplicaConfig) -> Result<Arc<ReplicaHandle>>;

    /// Stop a replica; stopping an already-dead replica is not an error
    async fn stop(&self, replica: &ReplicaHandle) -> Result<()>;

    /// Whether a replica is still running
    async fn is_alive(&self, replica: &ReplicaHandle) -> bool;

    /// Runtime name (for logging)
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// LocalRuntime — in-process replicas
// ---------------------------------------------------------------------------

type Constructor = Arc<dyn Fn(&ReplicaConfig) -> Result<Arc<dyn ServeCallable>> + Send + Sync>;

/// Runtime that builds replicas in-process.
///
/// Constructors are registered by name and referenced from
/// [`ReplicaConfig::constructor`], so a recovered controller can rebuild
/// replicas from checkpointed configuration alone.
#[derive(Default)]
pub struct LocalRuntime {
    constructors: RwLock<HashMap<String, Constructor>>,
    live: Mutex<HashMap<String, Arc<ReplicaHandle>>>,
    spawned: AtomicU64,
}

impl LocalRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stateless function
    pub fn register_function<F>(&self, name: impl Into<String>, f: F) -> &Self
    where
        F: Fn(ServeRequest) -> Result<Value> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.register(name, move |config| {
            let replica = FunctionReplica::new(f.clone()).blocking(config.is_blocking);
            Ok(Arc::new(replica) as Arc<dyn ServeCallable>)
        })
    }

    /// Register a stateless function that takes a whole batch
    pub fn register_batch_function<F>(&self, name: impl Into<String>, f: F) -> &Self
    where
        F: Fn(Vec<ServeRequest>) -> Result<Vec<Value>> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.register(name, move |config| {
            let replica = FunctionReplica::batch(f.clone()).blocking(config.is_blocking);
            Ok(Arc::new(replica) as Arc<dyn ServeCallable>)
        })
    }

    /// Register a stateful type; `factory` receives the replica's init args
    pub fn register_class<T, F>(&self, name: impl Into<String>, factory: F) -> &Self
    where
        T: ServeInstance,
        F: Fn(&[Value]) -> Result<T> + Send + Sync + 'static,
    {
        self.register(name, move |config| {
            let instance = factory(&config.init_args)?;
            let replica = InstanceReplica::new(Box::new(instance)).blocking(config.is_blocking);
            Ok(Arc::new(replica) as Arc<dyn ServeCallable>)
        })
    }

    /// Register an arbitrary callable factory
    pub fn register_callable<F>(&self, name: impl Into<String>, factory: F) -> &Self
    where
        F: Fn(&[Value]) -> Result<Arc<dyn ServeCallable>> + Send + Sync + 'static,
    {
        self.register(name, move |config| factory(&config.init_args))
    }

    fn register<F>(&self, name: impl Into<String>, constructor: F) -> &Self
    where
        F: Fn(&ReplicaConfig) -> Result<Arc<dyn ServeCallable>> + Send + Sync + 'static,
    {
        self.constructors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), Arc::new(constructor));
        self
    }

    /// Whether a constructor name is registered
    pub fn has_constructor(&self, name: &str) -> bool {
        self.constructors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    /// Simulate a replica crash. Returns false if the replica is unknown.
    pub fn kill(&self, replica_id: &str) -> bool {
        let removed = self
            .live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(replica_id);
        match removed {
            Some(handle) => {
                handle.mark_stopped();
                tracing::debug!(replica = replica_id, "Replica killed");
                true
            }
            None => false,
        }
    }

    /// Live replica ids of one backend
    pub fn replicas_of(&self, backend: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|h| h.backend() == backend)
            .map(|h| h.id().to_string())
            .collect();
        ids.sort();
        ids
    }

    /// Total live replicas
    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Replicas started since the runtime was created
    pub fn spawned_total(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ReplicaRuntime for LocalRuntime {
    async fn spawn(&self, backend: &str, config: &ReplicaConfig) -> Result<Arc<ReplicaHandle>> {
        let constructor = self
            .constructors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&config.constructor)
            .cloned()
            .ok_or_else(|| {
                ServeError::Runtime(format!(
                    "no constructor named '{}' is registered",
                    config.constructor
                ))
            })?;

        let callable = constructor(config)?;
        let seq = self.spawned.fetch_add(1, Ordering::Relaxed);
        let id = format!("{}#{}-{}", backend, seq, &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let handle = Arc::new(ReplicaHandle::new(id.clone(), backend, callable));

        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, handle.clone());
        Ok(handle)
    }

    async fn stop(&self, replica: &ReplicaHandle) -> Result<()> {
        replica.mark_stopped();
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(replica.id());
        Ok(())
    }

    async fn is_alive(&self, replica: &ReplicaHandle) -> bool {
        !replica.is_stopped()
            && self
                .live
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains_key(replica.id())
    }

    fn name(&self) -> &str {
        "local"
    }
}

// ---------------------------------------------------------------------------
// HttpRuntime — replicas run by an external cluster manager
// ---------------------------------------------------------------------------

/// Body of `POST /v1/replicas`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub backend: String,
    pub replica_config: ReplicaConfig,
}

/// Response of `POST /v1/replicas`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnResponse {
    /// Replica id assigned by the manager
    pub id: String,
    /// Base URL the replica serves on
    pub url: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    alive: bool,
}

/// Runtime that delegates to a cluster manager API
pub struct HttpRuntime {
    /// Base URL of the manager (e.g., "http://localhost:9090")
    base_url: String,
    client: reqwest::Client,
}

impl HttpRuntime {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ReplicaRuntime for HttpRuntime {
    async fn spawn(&self, backend: &str, config: &ReplicaConfig) -> Result<Arc<ReplicaHandle>> {
        let url = format!("{}/v1/replicas", self.base_url);
        let body = SpawnRequest {
            backend: backend.to_string(),
            replica_config: config.clone(),
        };
        let resp = self.client.post(&url).json(&body).send().await.map_err(|e| {
            ServeError::Runtime(format!(
                "replica spawn request failed for '{}': {}",
                backend, e
            ))
        })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ServeError::Runtime(format!(
                "cluster manager returned {} spawning '{}': {}",
                status, backend, body
            )));
        }

        let spawned = resp.json::<SpawnResponse>().await.map_err(|e| {
            ServeError::Runtime(format!(
                "failed to parse spawn response for '{}': {}",
                backend, e
            ))
        })?;

        let callable = HttpReplica::new(spawned.url, self.client.clone());
        Ok(Arc::new(ReplicaHandle::new(
            spawned.id,
            backend,
            Arc::new(callable),
        )))
    }

    async fn stop(&self, replica: &ReplicaHandle) -> Result<()> {
        replica.mark_stopped();
        let url = format!("{}/v1/replicas/{}", self.base_url, replica.id());
        let resp = self.client.delete(&url).send().await.map_err(|e| {
            ServeError::Runtime(format!("replica stop failed for '{}': {}", replica.id(), e))
        })?;
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(ServeError::Runtime(format!(
                "cluster manager returned {} stopping '{}'",
                resp.status(),
                replica.id()
            )));
        }
        Ok(())
    }

    async fn is_alive(&self, replica: &ReplicaHandle) -> bool {
        if replica.is_stopped() {
            return false;
        }
        let url = format!("{}/v1/replicas/{}", self.base_url, replica.id());
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp
                .json::<StatusResponse>()
                .await
                .map(|s| s.alive)
                .unwrap_or(false),
            Ok(_) => false,
            Err(e) => {
                tracing::warn!(replica = replica.id(), error = %e, "Replica status check failed");
                false
            }
        }
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// A replica served over HTTP: `POST {url}/invoke` and `POST {url}/invoke_batch`
pub struct HttpReplica {
    url: String,
    client: reqwest::Client,
}

impl HttpReplica {
    pub fn new(url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    async fn post<B: Serialize + ?Sized, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R> {
        let url = format!("{}/{}", self.url, path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| ServeError::Replica(format!("{} unreachable: {}", url, e)))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(ServeError::Replica(format!(
                "{} returned {}: {}",
                url, status, text
            )));
        }
        resp.json::<R>()
            .await
            .map_err(|e| ServeError::Replica(format!("invalid response from {}: {}", url, e)))
    }
}

#[async_trait]
impl ServeCallable for HttpReplica {
    async fn call(&self, request: ServeRequest) -> Result<Value> {
        self.post("invoke", &request).await
    }

    async fn call_batch(&self, requests: Vec<ServeRequest>) -> Result<Vec<Value>> {
        self.post("invoke_batch", &requests).await
    }
}
