//! Router — weighted and shadow dispatch over a registry snapshot
//!
//! A router holds a read-only [`RoutingTable`] pushed by the controller (and
//! re-pulled periodically through a [`RoutingTableSource`]). Per call it:
//! 1. resolves the endpoint and checks the method
//! 2. draws the primary backend from the weight distribution
//! 3. fires independent shadow copies without waiting on them
//! 4. enqueues on the primary backend's [`BackendQueue`] and awaits the answer

mod queue;

pub use queue::BackendQueue;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use crate::config::BackendConfig;
use crate::error::{Result, ServeError};
use crate::registry::Endpoint;
use crate::replica::{ReplicaHandle, ServeRequest};

/// Snapshot of everything a router needs to dispatch
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    /// Monotonic version; older tables are ignored
    pub epoch: u64,
    pub endpoints: BTreeMap<String, Endpoint>,
    pub backends: BTreeMap<String, BackendConfig>,
    /// Live replicas per backend tag
    pub replicas: BTreeMap<String, Vec<Arc<ReplicaHandle>>>,
}

/// Where a router pulls fresh tables from
#[async_trait]
pub trait RoutingTableSource: Send + Sync {
    /// Current table, or `None` once the source is gone
    async fn routing_table(&self) -> Option<RoutingTable>;
}

/// Data-plane router
pub struct Router {
    name: String,
    table: RwLock<Arc<RoutingTable>>,
    queues: Mutex<HashMap<String, Arc<BackendQueue>>>,
    rng: Mutex<StdRng>,
    closed: AtomicBool,
}

impl Router {
    /// Create a router; a seed makes traffic draws reproducible
    pub fn new(name: impl Into<String>, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            name: name.into(),
            table: RwLock::new(Arc::new(RoutingTable::default())),
            queues: Mutex::new(HashMap::new()),
            rng: Mutex::new(rng),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Install a routing table. Returns false if it is older than the current one.
    pub fn apply(&self, table: RoutingTable) -> bool {
        let mut current = self.table.write().unwrap_or_else(|e| e.into_inner());
        if self.is_closed() || table.epoch < current.epoch {
            return false;
        }

        {
            let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
            queues.retain(|tag, queue| {
                let keep = table.backends.contains_key(tag);
                if !keep {
                    queue.close();
                }
                keep
            });
            for (tag, config) in &table.backends {
                let replicas = table.replicas.get(tag).cloned().unwrap_or_default();
                match queues.get(tag) {
                    Some(queue) => queue.update(config.clone(), replicas),
                    None => {
                        queues.insert(
                            tag.clone(),
                            BackendQueue::start(tag.clone(), config.clone(), replicas),
                        );
                    }
                }
            }
        }

        tracing::debug!(
            router = %self.name,
            epoch = table.epoch,
            endpoints = table.endpoints.len(),
            backends = table.backends.len(),
            "Routing table applied"
        );
        *current = Arc::new(table);
        true
    }

    /// Current table
    pub fn snapshot(&self) -> Arc<RoutingTable> {
        self.table.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Route one request to `endpoint`
    pub async fn route(&self, endpoint: &str, request: ServeRequest) -> Result<Value> {
        if self.is_closed() {
            return Err(ServeError::Unavailable(format!(
                "router '{}' is closed; reconnect to the controller",
                self.name
            )));
        }
        let table = self.snapshot();
        let ep = table.endpoints.get(endpoint).ok_or_else(|| {
            ServeError::NotFound(format!("endpoint '{}' does not exist", endpoint))
        })?;
        if !ep.accepts_method(&request.method) {
            return Err(ServeError::NotFound(format!(
                "endpoint '{}' does not accept method {}",
                endpoint, request.method
            )));
        }

        let (primary, shadows) = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            let draw: f64 = rng.gen();
            let primary = ep.traffic.select(draw).map(str::to_string);
            let shadows: Vec<String> = ep
                .traffic
                .select_shadows(|| rng.gen::<f64>())
                .into_iter()
                .map(str::to_string)
                .collect();
            (primary, shadows)
        };

        for tag in shadows {
            self.shadow(endpoint, &tag, request.clone());
        }

        let primary = primary.ok_or_else(|| {
            ServeError::Unavailable(format!("endpoint '{}' has no traffic policy", endpoint))
        })?;
        let queue = self.queue(&primary).ok_or_else(|| {
            ServeError::upstream(&primary, "backend is not known to this router")
        })?;
        queue.submit(request).await
    }

    /// Fire-and-forget duplicate; the outcome is only logged
    fn shadow(&self, endpoint: &str, backend: &str, request: ServeRequest) {
        let Some(queue) = self.queue(backend) else {
            tracing::debug!(endpoint, backend, "Shadow backend not known to router, skipping");
            return;
        };
        let rx = queue.enqueue(request);
        let endpoint = endpoint.to_string();
        let backend = backend.to_string();
        tokio::spawn(async move {
            match rx.await {
                Ok(Ok(_)) => tracing::debug!(%endpoint, %backend, "Shadow request completed"),
                Ok(Err(e)) => {
                    tracing::debug!(%endpoint, %backend, error = %e, "Shadow request failed")
                }
                Err(_) => tracing::debug!(%endpoint, %backend, "Shadow request dropped"),
            }
        });
    }

    fn queue(&self, backend: &str) -> Option<Arc<BackendQueue>> {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(backend)
            .cloned()
    }

    /// Queue of one backend, for inspection
    pub fn backend_queue(&self, backend: &str) -> Option<Arc<BackendQueue>> {
        self.queue(backend)
    }

    /// Close every queue; queued requests fail with an upstream error
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let queues: Vec<Arc<BackendQueue>> = self
            .queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, q)| q)
            .collect();
        for queue in queues {
            queue.close();
        }
        tracing::debug!(router = %self.name, "Router closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Periodically pull tables from `source` until it goes away
    pub fn spawn_refresh(
        router: &Arc<Router>,
        source: Arc<dyn RoutingTableSource>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let router: Weak<Router> = Arc::downgrade(router);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(router) = router.upgrade() else {
                    return;
                };
                match source.routing_table().await {
                    Some(table) => {
                        router.apply(table);
                    }
                    None => return,
                }
            }
        })
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("name", &self.name)
            .field("epoch", &self.snapshot().epoch)
            .finish()
    }
}
