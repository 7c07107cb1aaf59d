//! Sessions — explicit client context for a named controller
//!
//! A [`ServeCluster`] is the namespace controllers live in: one replica
//! runtime, one process configuration, any number of named controllers.
//! Callers get a [`Session`] from [`ServeCluster::init`] or
//! [`ServeCluster::connect`] and issue admin calls through it; there is no
//! process-wide "current controller".

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::config::{
    BackendConfig, BackendConfigUpdate, ControllerSettings, ReplicaConfig, ServeConfig,
};
use crate::controller::checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
use crate::controller::{Controller, ControllerStatus};
use crate::error::{Result, ServeError};
use crate::handle::ServeHandle;
use crate::proxy::{self, HttpProxy, ROUTES_PATH};
use crate::registry::EndpointInfo;
use crate::replica::ReplicaRuntime;
use crate::ControllerState;

struct Instance {
    controller: Arc<Controller>,
    proxy: Option<Arc<HttpProxy>>,
}

/// Namespace of named controllers sharing one replica runtime
pub struct ServeCluster {
    config: ServeConfig,
    runtime: Arc<dyn ReplicaRuntime>,
    instances: tokio::sync::Mutex<HashMap<String, Instance>>,
    /// In-memory checkpoints by controller name, used when no directory is configured
    memory_stores: std::sync::Mutex<HashMap<String, MemoryCheckpointStore>>,
    #[cfg(any(test, feature = "fault-injection"))]
    fault: Option<Arc<dyn crate::controller::fault::FaultPolicy>>,
}

impl ServeCluster {
    pub fn new(config: ServeConfig, runtime: Arc<dyn ReplicaRuntime>) -> Self {
        Self {
            config,
            runtime,
            instances: tokio::sync::Mutex::new(HashMap::new()),
            memory_stores: std::sync::Mutex::new(HashMap::new()),
            #[cfg(any(test, feature = "fault-injection"))]
            fault: crate::controller::fault::CrashAfterCheckpoint::from_env()
                .map(|p| Arc::new(p) as Arc<dyn crate::controller::fault::FaultPolicy>),
        }
    }

    /// Inject faults into every controller started from now on
    #[cfg(any(test, feature = "fault-injection"))]
    pub fn with_fault_policy(
        mut self,
        policy: Arc<dyn crate::controller::fault::FaultPolicy>,
    ) -> Self {
        self.fault = Some(policy);
        self
    }

    pub fn config(&self) -> &ServeConfig {
        &self.config
    }

    /// Start the named controller, or reconnect if it is already running.
    ///
    /// A fresh start recovers from that name's checkpoint when one exists.
    /// With the HTTP listener enabled, returns only after every listener
    /// answers its readiness probe.
    pub async fn init(&self, name: &str) -> Result<Session> {
        if name.trim().is_empty() {
            return Err(ServeError::Validation(
                "controller name must not be empty".to_string(),
            ));
        }
        let mut instances = self.instances.lock().await;
        if let Some(instance) = instances.get(name) {
            if instance.controller.state() != ControllerState::Terminated {
                tracing::debug!(controller = name, "Reconnecting to running controller");
                return Ok(Session::new(instance));
            }
        }

        let settings = ControllerSettings {
            name: name.to_string(),
            ..self.config.controller.clone()
        };
        let store = self.store_for(&settings);
        let builder = Controller::builder(settings, self.runtime.clone()).checkpoint_store(store);
        #[cfg(any(test, feature = "fault-injection"))]
        let builder = match &self.fault {
            Some(policy) => builder.fault_policy(policy.clone()),
            None => builder,
        };
        let controller = builder.start().await?;

        let proxy = if self.config.http.enabled {
            match self.start_http(&controller).await {
                Ok(proxy) => Some(proxy),
                Err(e) => {
                    tracing::error!(controller = name, error = %e, "HTTP listener failed to start");
                    // Keep the checkpoint so a later init can recover
                    controller.terminate(false).await;
                    return Err(e);
                }
            }
        } else {
            None
        };

        let instance = Instance { controller, proxy };
        let session = Session::new(&instance);
        instances.insert(name.to_string(), instance);
        Ok(session)
    }

    /// Session for a controller that is already running
    pub async fn connect(&self, name: &str) -> Result<Session> {
        let instances = self.instances.lock().await;
        match instances.get(name) {
            Some(instance) if instance.controller.state() == ControllerState::Terminated => {
                Err(ServeError::NotFound(format!(
                    "controller '{}' has been shut down; call init to start it again",
                    name
                )))
            }
            Some(instance) => Ok(Session::new(instance)),
            None => Err(ServeError::Unavailable(format!(
                "no controller named '{}' is running; call init first",
                name
            ))),
        }
    }

    /// Names of controllers that have not terminated
    pub async fn controllers(&self) -> Vec<String> {
        let instances = self.instances.lock().await;
        let mut names: Vec<String> = instances
            .iter()
            .filter(|(_, i)| i.controller.state() != ControllerState::Terminated)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    fn store_for(&self, settings: &ControllerSettings) -> Arc<dyn CheckpointStore> {
        match settings.checkpoint_path() {
            Some(path) => Arc::new(FileCheckpointStore::new(path)),
            None => Arc::new(
                self.memory_stores
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .entry(settings.name.clone())
                    .or_default()
                    .clone(),
            ),
        }
    }

    async fn start_http(&self, controller: &Controller) -> Result<Arc<HttpProxy>> {
        let router = controller
            .routers()
            .into_values()
            .next()
            .ok_or_else(|| ServeError::Unavailable("controller has no router".to_string()))?;
        let proxy = HttpProxy::start(&self.config.http.address(), router).await?;

        let timeout = self.config.http.probe_timeout();
        let own = format!("{}{}", proxy.url(), ROUTES_PATH);
        proxy::block_until_http_ready(&own, timeout).await?;
        for url in &self.config.http.probe_urls {
            proxy::block_until_http_ready(url, timeout).await?;
        }
        Ok(Arc::new(proxy))
    }
}

impl std::fmt::Debug for ServeCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServeCluster")
            .field("runtime", &self.runtime.name())
            .finish()
    }
}

/// Connection to one named controller
#[derive(Clone)]
pub struct Session {
    controller: Arc<Controller>,
    proxy: Option<Arc<HttpProxy>>,
}

impl Session {
    fn new(instance: &Instance) -> Self {
        Self {
            controller: instance.controller.clone(),
            proxy: instance.proxy.clone(),
        }
    }

    pub fn name(&self) -> &str {
        self.controller.name()
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    /// Base URL of this controller's HTTP listener, if one is running
    pub fn http_url(&self) -> Option<String> {
        self.proxy.as_ref().map(|p| p.url())
    }

    pub fn status(&self) -> ControllerStatus {
        self.controller.status()
    }

    pub async fn create_endpoint(
        &self,
        name: &str,
        backend: &str,
        route: Option<&str>,
        methods: Option<&[String]>,
    ) -> Result<()> {
        self.controller
            .create_endpoint(name, backend, route, methods)
            .await
    }

    pub async fn delete_endpoint(&self, name: &str) -> Result<()> {
        self.controller.delete_endpoint(name).await
    }

    pub fn list_endpoints(&self) -> Result<BTreeMap<String, EndpointInfo>> {
        self.controller.list_endpoints()
    }

    pub async fn create_backend(
        &self,
        tag: &str,
        replica_config: ReplicaConfig,
        options: BackendConfigUpdate,
    ) -> Result<()> {
        self.controller
            .create_backend(tag, replica_config, options)
            .await
    }

    pub async fn update_backend_config(
        &self,
        tag: &str,
        update: BackendConfigUpdate,
    ) -> Result<()> {
        self.controller.update_backend_config(tag, update).await
    }

    pub fn get_backend_config(&self, tag: &str) -> Result<BackendConfig> {
        self.controller.get_backend_config(tag)
    }

    pub async fn delete_backend(&self, tag: &str) -> Result<()> {
        self.controller.delete_backend(tag).await
    }

    pub fn list_backends(&self) -> Result<BTreeMap<String, BackendConfig>> {
        self.controller.list_backends()
    }

    pub async fn set_traffic(&self, endpoint: &str, weights: BTreeMap<String, f64>) -> Result<()> {
        self.controller.set_traffic(endpoint, weights).await
    }

    pub async fn shadow_traffic(&self, endpoint: &str, backend: &str, proportion: f64) -> Result<()> {
        self.controller
            .shadow_traffic(endpoint, backend, proportion)
            .await
    }

    pub fn get_handle(&self, endpoint: &str, missing_ok: bool) -> Result<ServeHandle> {
        self.controller.get_handle(endpoint, missing_ok)
    }

    /// Call an endpoint once without keeping a handle
    pub async fn call(&self, endpoint: &str, args: Value) -> Result<Value> {
        self.get_handle(endpoint, false)?.remote(args).await
    }

    /// Stop the HTTP listener and shut the controller down
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(proxy) = &self.proxy {
            proxy.stop();
        }
        self.controller.shutdown().await
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("controller", &self.controller.name())
            .field("http", &self.http_url())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::LocalRuntime;
    use serde_json::json;

    fn cluster(http: bool) -> ServeCluster {
        let rt = Arc::new(LocalRuntime::new());
        rt.register_function("echo", |req| Ok(req.args));
        let mut config = ServeConfig::default();
        config.controller.router_refresh_ms = 20;
        config.controller.supervise_interval_ms = 20;
        config.http.enabled = http;
        config.http.port = 0;
        config.http.probe_timeout_secs = 5;
        ServeCluster::new(config, rt)
    }

    #[tokio::test]
    async fn test_connect_before_init() {
        let cluster = cluster(false);
        let err = cluster.connect("app").await.unwrap_err();
        assert!(matches!(err, ServeError::Unavailable(_)));
        assert!(err.to_string().contains("init"));
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let cluster = cluster(false);
        let a = cluster.init("app").await.unwrap();
        a.create_backend("v1", ReplicaConfig::new("echo"), Default::default())
            .await
            .unwrap();

        let b = cluster.init("app").await.unwrap();
        assert!(Arc::ptr_eq(a.controller(), b.controller()));
        assert!(b.list_backends().unwrap().contains_key("v1"));
        assert_eq!(cluster.controllers().await, vec!["app".to_string()]);
    }

    #[tokio::test]
    async fn test_named_controllers_are_isolated() {
        let cluster = cluster(false);
        let a = cluster.init("a").await.unwrap();
        let b = cluster.init("b").await.unwrap();
        a.create_backend("v1", ReplicaConfig::new("echo"), Default::default())
            .await
            .unwrap();
        assert!(b.list_backends().unwrap().is_empty());
        assert_eq!(cluster.controllers().await, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_shutdown_then_reinit_starts_empty() {
        let cluster = cluster(false);
        let session = cluster.init("app").await.unwrap();
        session
            .create_backend("v1", ReplicaConfig::new("echo"), Default::default())
            .await
            .unwrap();
        session.shutdown().await.unwrap();

        assert!(matches!(
            session.list_backends(),
            Err(ServeError::NotFound(_))
        ));
        assert!(matches!(
            cluster.connect("app").await,
            Err(ServeError::NotFound(_))
        ));

        let fresh = cluster.init("app").await.unwrap();
        assert!(fresh.list_backends().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reinit_after_crash_recovers() {
        let cluster = cluster(false)
            .with_fault_policy(Arc::new(crate::controller::fault::CrashAtSeq::new(3)));
        let session = cluster.init("app").await.unwrap();
        session
            .create_backend("v1", ReplicaConfig::new("echo"), Default::default())
            .await
            .unwrap();
        session.create_endpoint("api", "v1", None, None).await.unwrap();
        assert!(session
            .shadow_traffic("api", "v1", 0.5)
            .await
            .is_err());

        let recovered = cluster.init("app").await.unwrap();
        assert!(!Arc::ptr_eq(session.controller(), recovered.controller()));
        let endpoints = recovered.list_endpoints().unwrap();
        assert_eq!(endpoints["api"].shadows.get("v1"), Some(&0.5));
        assert_eq!(recovered.call("api", json!(5)).await.unwrap(), json!(5));
    }

    #[tokio::test]
    async fn test_http_listener_started_and_probed() {
        let cluster = cluster(true);
        let session = cluster.init("web").await.unwrap();
        let url = session.http_url().unwrap();
        session
            .create_backend("v1", ReplicaConfig::new("echo"), Default::default())
            .await
            .unwrap();
        session
            .create_endpoint("api", "v1", Some("/api"), None)
            .await
            .unwrap();

        let body: Value = reqwest::get(format!("{}{}", url, ROUTES_PATH))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body, json!({"/api": ["api", ["GET"]]}));
        session.shutdown().await.unwrap();
    }

    #[test]
    fn test_session_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Session>();
        assert_send_sync::<ServeCluster>();
    }
}
