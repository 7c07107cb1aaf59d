//! Controller — the single writer of control-plane state
//!
//! Every administrative mutation is applied one at a time: copy the
//! committed registries, apply the change, write a checkpoint, then commit
//! and acknowledge. Routers get a fresh table after each commit and pull one
//! periodically; replica counts converge in the background.

pub mod checkpoint;
#[cfg(any(test, feature = "fault-injection"))]
pub mod fault;
pub mod replicas;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::task::JoinHandle;

use crate::config::{BackendConfig, BackendConfigUpdate, ControllerSettings, ReplicaConfig};
use crate::error::{Result, ServeError};
use crate::handle::ServeHandle;
use crate::registry::{EndpointInfo, Registries};
use crate::replica::ReplicaRuntime;
use crate::router::{Router, RoutingTable, RoutingTableSource};
use crate::ControllerState;
use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
use replicas::{DesiredBackend, ReplicaManager};

/// Point-in-time view of a controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerStatus {
    pub name: String,
    pub state: ControllerState,
    /// Sequence number of the last committed mutation
    pub seq: u64,
    pub endpoints: usize,
    pub backends: usize,
    pub replicas: usize,
}

/// Builds and starts a [`Controller`]
pub struct ControllerBuilder {
    settings: ControllerSettings,
    runtime: Arc<dyn ReplicaRuntime>,
    store: Option<Arc<dyn CheckpointStore>>,
    #[cfg(any(test, feature = "fault-injection"))]
    fault: Option<Arc<dyn fault::FaultPolicy>>,
}

impl ControllerBuilder {
    /// Use a specific checkpoint store instead of the one implied by the settings
    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Inject faults into the mutation path
    #[cfg(any(test, feature = "fault-injection"))]
    pub fn fault_policy(mut self, policy: Arc<dyn fault::FaultPolicy>) -> Self {
        self.fault = Some(policy);
        self
    }

    /// Start the controller, recovering from its checkpoint if one exists
    pub async fn start(self) -> Result<Arc<Controller>> {
        let store: Arc<dyn CheckpointStore> = match self.store {
            Some(store) => store,
            None => match self.settings.checkpoint_path() {
                Some(path) => Arc::new(FileCheckpointStore::new(path)),
                None => Arc::new(MemoryCheckpointStore::new()),
            },
        };
        let name = self.settings.name.clone();
        let router = Arc::new(Router::new(
            format!("{}-router", name),
            self.settings.router_seed,
        ));
        let mut routers = BTreeMap::new();
        routers.insert(router.name().to_string(), router.clone());

        let controller = Arc::new_cyclic(|me| Controller {
            me: me.clone(),
            name,
            replicas: ReplicaManager::new(self.runtime, self.settings.drain_timeout()),
            settings: self.settings,
            state: RwLock::new(ControllerState::Initializing),
            registries: RwLock::new(Registries::default()),
            mutation_lock: tokio::sync::Mutex::new(()),
            store,
            routers: RwLock::new(routers),
            tasks: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            publish_lock: Mutex::new(()),
            #[cfg(any(test, feature = "fault-injection"))]
            fault: self.fault,
        });
        tracing::info!(
            controller = %controller.name,
            runtime = controller.replicas.runtime().name(),
            "Controller starting"
        );

        controller.recover().await?;
        controller.publish();

        let refresh = Router::spawn_refresh(
            &router,
            Arc::new(ControllerSource(Arc::downgrade(&controller))),
            controller.settings.router_refresh(),
        );
        let supervise = controller.spawn_supervisor();
        controller
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([refresh, supervise]);

        controller.set_state(ControllerState::Serving);
        tracing::info!(
            controller = %controller.name,
            seq = controller.seq(),
            "Controller serving"
        );
        Ok(controller)
    }
}

/// Authoritative owner of the endpoint and backend registries
pub struct Controller {
    me: Weak<Controller>,
    name: String,
    settings: ControllerSettings,
    state: RwLock<ControllerState>,
    /// Committed state; only replaced while `mutation_lock` is held
    registries: RwLock<Registries>,
    mutation_lock: tokio::sync::Mutex<()>,
    store: Arc<dyn CheckpointStore>,
    replicas: ReplicaManager,
    routers: RwLock<BTreeMap<String, Arc<Router>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    seq: AtomicU64,
    epoch: AtomicU64,
    publish_lock: Mutex<()>,
    #[cfg(any(test, feature = "fault-injection"))]
    fault: Option<Arc<dyn fault::FaultPolicy>>,
}

impl Controller {
    pub fn builder(settings: ControllerSettings, runtime: Arc<dyn ReplicaRuntime>) -> ControllerBuilder {
        ControllerBuilder {
            settings,
            runtime,
            store: None,
            #[cfg(any(test, feature = "fault-injection"))]
            fault: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ControllerState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Sequence number of the last committed mutation
    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Copy of the committed registries
    pub fn registries(&self) -> Registries {
        self.registries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn status(&self) -> ControllerStatus {
        let registries = self.registries.read().unwrap_or_else(|e| e.into_inner());
        ControllerStatus {
            name: self.name.clone(),
            state: self.state(),
            seq: self.seq(),
            endpoints: registries.endpoints.len(),
            backends: registries.backends.len(),
            replicas: self.replicas.live().values().map(Vec::len).sum(),
        }
    }

    /// Live replicas of one backend
    pub fn replica_count(&self, backend: &str) -> usize {
        self.replicas.live_count(backend)
    }

    // ---------------------------------------------------------------------
    // Administrative API
    // ---------------------------------------------------------------------

    pub async fn create_endpoint(
        &self,
        name: &str,
        backend: &str,
        route: Option<&str>,
        methods: Option<&[String]>,
    ) -> Result<()> {
        self.mutate("create_endpoint", |reg| {
            reg.create_endpoint(name, backend, route, methods)
        })
        .await
    }

    pub async fn delete_endpoint(&self, name: &str) -> Result<()> {
        self.mutate("delete_endpoint", |reg| reg.delete_endpoint(name))
            .await
    }

    pub fn list_endpoints(&self) -> Result<BTreeMap<String, EndpointInfo>> {
        self.ensure_readable()?;
        Ok(self.registries.read().unwrap_or_else(|e| e.into_inner()).list_endpoints())
    }

    pub async fn create_backend(
        &self,
        tag: &str,
        replica_config: ReplicaConfig,
        options: BackendConfigUpdate,
    ) -> Result<()> {
        self.mutate("create_backend", move |reg| {
            reg.create_backend(tag, replica_config, options)
        })
        .await
    }

    pub async fn update_backend_config(
        &self,
        tag: &str,
        update: BackendConfigUpdate,
    ) -> Result<()> {
        self.mutate("update_backend_config", move |reg| {
            reg.update_backend_config(tag, &update)
        })
        .await
    }

    pub fn get_backend_config(&self, tag: &str) -> Result<BackendConfig> {
        self.ensure_readable()?;
        self.registries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .backends
            .get(tag)
            .cloned()
    }

    pub async fn delete_backend(&self, tag: &str) -> Result<()> {
        self.mutate("delete_backend", |reg| reg.delete_backend(tag).map(|_| ()))
            .await
    }

    pub fn list_backends(&self) -> Result<BTreeMap<String, BackendConfig>> {
        self.ensure_readable()?;
        Ok(self.registries.read().unwrap_or_else(|e| e.into_inner()).list_backends())
    }

    pub async fn set_traffic(&self, endpoint: &str, weights: BTreeMap<String, f64>) -> Result<()> {
        self.mutate("set_traffic", move |reg| reg.set_traffic(endpoint, weights))
            .await
    }

    pub async fn shadow_traffic(&self, endpoint: &str, backend: &str, proportion: f64) -> Result<()> {
        self.mutate("shadow_traffic", |reg| {
            reg.shadow_traffic(endpoint, backend, proportion)
        })
        .await
    }

    /// Handle bound to this controller's first router
    pub fn get_handle(&self, endpoint: &str, missing_ok: bool) -> Result<ServeHandle> {
        self.ensure_readable()?;
        if !missing_ok
            && !self
                .registries
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .endpoints
                .contains(endpoint)
        {
            return Err(ServeError::NotFound(format!(
                "endpoint '{}' does not exist",
                endpoint
            )));
        }
        let router = self
            .routers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .next()
            .cloned()
            .ok_or_else(|| {
                ServeError::Unavailable(format!("controller '{}' has no router", self.name))
            })?;
        Ok(ServeHandle::new(router, endpoint))
    }

    /// Routers supervised by this controller, by name
    pub fn routers(&self) -> BTreeMap<String, Arc<Router>> {
        self.routers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Tear down routers and replicas, delete the checkpoint, and terminate
    pub async fn shutdown(&self) -> Result<()> {
        let _guard = self.mutation_lock.lock().await;
        if self.state() == ControllerState::Terminated {
            return Err(self.terminated());
        }
        self.terminate(true).await;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    /// Apply one mutation under the single-writer lock
    async fn mutate<T, F>(&self, op: &'static str, apply: F) -> Result<T>
    where
        F: FnOnce(&mut Registries) -> Result<T> + Send,
        T: Send,
    {
        let _guard = self.mutation_lock.lock().await;
        self.ensure_serving()?;

        let mut next = self.registries();
        let out = match apply(&mut next) {
            Ok(out) => out,
            Err(e) => {
                tracing::debug!(controller = %self.name, op, error = %e, "Mutation rejected");
                return Err(e);
            }
        };

        let seq = self.seq() + 1;
        let checkpoint = Checkpoint::new(self.name.clone(), seq, next.clone());
        if let Err(e) = self.store.save(&checkpoint).await {
            tracing::error!(
                controller = %self.name,
                op,
                seq,
                error = %e,
                "Checkpoint write failed, mutation rejected"
            );
            return Err(e);
        }

        #[cfg(any(test, feature = "fault-injection"))]
        {
            if self
                .fault
                .as_ref()
                .is_some_and(|policy| policy.crash_after_checkpoint(seq))
            {
                tracing::warn!(controller = %self.name, op, seq, "Injected crash after checkpoint");
                self.terminate(false).await;
                return Err(ServeError::Unavailable(format!(
                    "controller '{}' crashed during {}",
                    self.name, op
                )));
            }
        }

        *self.registries.write().unwrap_or_else(|e| e.into_inner()) = next;
        self.seq.store(seq, Ordering::SeqCst);
        tracing::info!(controller = %self.name, op, seq, "Mutation committed");

        self.sync_desired();
        self.publish();
        self.spawn_converge();
        Ok(out)
    }

    /// Load the checkpoint (if any) and re-create replicas
    async fn recover(&self) -> Result<()> {
        let Some(checkpoint) = self.store.load().await? else {
            tracing::debug!(controller = %self.name, "No checkpoint, starting empty");
            return Ok(());
        };
        self.set_state(ControllerState::Recovering);
        checkpoint.registries.check_references()?;
        tracing::info!(
            controller = %self.name,
            seq = checkpoint.seq,
            written_at = %checkpoint.written_at,
            endpoints = checkpoint.registries.endpoints.len(),
            backends = checkpoint.registries.backends.len(),
            "Recovering from checkpoint"
        );

        *self.registries.write().unwrap_or_else(|e| e.into_inner()) = checkpoint.registries;
        self.seq.store(checkpoint.seq, Ordering::SeqCst);
        self.sync_desired();
        if let Err(e) = self.replicas.converge(&|| self.publish()).await {
            tracing::warn!(
                controller = %self.name,
                error = %e,
                "Replicas not fully restored, supervisor will retry"
            );
        }
        Ok(())
    }

    fn sync_desired(&self) {
        let desired = self
            .registries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .backends
            .iter()
            .map(|(tag, entry)| {
                (
                    tag.clone(),
                    DesiredBackend {
                        num_replicas: entry.config.num_replicas,
                        replica_config: entry.replica_config.clone(),
                    },
                )
            })
            .collect();
        self.replicas.set_desired(desired);
    }

    fn spawn_converge(&self) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let publisher = me.clone();
            if let Err(e) = me.replicas.converge(&move || publisher.publish()).await {
                tracing::warn!(controller = %me.name, error = %e, "Replica convergence incomplete");
            }
        });
    }

    fn spawn_supervisor(&self) -> JoinHandle<()> {
        let me = self.me.clone();
        let interval = self.settings.supervise_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(controller) = me.upgrade() else {
                    return;
                };
                if controller.state() != ControllerState::Serving {
                    continue;
                }
                controller.replicas.reap_dead().await;
                let publisher = controller.clone();
                if let Err(e) = controller
                    .replicas
                    .converge(&move || publisher.publish())
                    .await
                {
                    tracing::warn!(controller = %controller.name, error = %e, "Supervisor could not restore replicas");
                }
            }
        })
    }

    /// Build a routing table from committed state. Caller holds `publish_lock`.
    fn build_table(&self) -> RoutingTable {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let registries = self.registries.read().unwrap_or_else(|e| e.into_inner());
        RoutingTable {
            epoch,
            endpoints: registries
                .endpoints
                .iter()
                .map(|(name, ep)| (name.clone(), ep.clone()))
                .collect(),
            backends: registries.list_backends(),
            replicas: self.replicas.live(),
        }
    }

    fn routing_table(&self) -> RoutingTable {
        let _guard = self.publish_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.build_table()
    }

    /// Push the current table to every router
    fn publish(&self) {
        let _guard = self.publish_lock.lock().unwrap_or_else(|e| e.into_inner());
        let table = self.build_table();
        for router in self.routers.read().unwrap_or_else(|e| e.into_inner()).values() {
            router.apply(table.clone());
        }
    }

    /// Stop tasks, routers and replicas; optionally delete the checkpoint
    pub(crate) async fn terminate(&self, clear_checkpoint: bool) {
        self.set_state(ControllerState::ShuttingDown);
        tracing::info!(controller = %self.name, "Controller shutting down");

        for task in self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }
        let routers = std::mem::take(&mut *self.routers.write().unwrap_or_else(|e| e.into_inner()));
        for router in routers.values() {
            router.close();
        }
        self.replicas.stop_all().await;

        if clear_checkpoint {
            if let Err(e) = self.store.clear().await {
                tracing::error!(controller = %self.name, error = %e, "Failed to delete checkpoint");
            }
        }

        self.set_state(ControllerState::Terminated);
        tracing::info!(controller = %self.name, "Controller terminated");
    }

    fn ensure_serving(&self) -> Result<()> {
        match self.state() {
            ControllerState::Serving => Ok(()),
            ControllerState::Terminated => Err(self.terminated()),
            state => Err(ServeError::Unavailable(format!(
                "controller '{}' is {}",
                self.name, state
            ))),
        }
    }

    fn ensure_readable(&self) -> Result<()> {
        match self.state() {
            ControllerState::Terminated => Err(self.terminated()),
            ControllerState::Initializing | ControllerState::Recovering => Err(
                ServeError::Unavailable(format!("controller '{}' is still starting", self.name)),
            ),
            _ => Ok(()),
        }
    }

    fn terminated(&self) -> ServeError {
        ServeError::NotFound(format!(
            "controller '{}' has been shut down; initialize a new one",
            self.name
        ))
    }

    fn set_state(&self, new_state: ControllerState) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        tracing::debug!(controller = %self.name, from = %*state, to = %new_state, "State transition");
        *state = new_state;
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("seq", &self.seq())
            .finish()
    }
}

/// Lets routers pull tables without keeping the controller alive
struct ControllerSource(Weak<Controller>);

#[async_trait]
impl RoutingTableSource for ControllerSource {
    async fn routing_table(&self) -> Option<RoutingTable> {
        let controller = self.0.upgrade()?;
        match controller.state() {
            ControllerState::Terminated => None,
            _ => Some(controller.routing_table()),
        }
    }
}
