//! Replica convergence and supervision
//!
//! The controller records the desired replica count per backend; the
//! manager brings the live set in line with it, one pass at a time.
//! Scale-down removes replicas from routing first, then drains and stops them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::config::ReplicaConfig;
use crate::error::Result;
use crate::replica::{ReplicaHandle, ReplicaRuntime};

/// Direction of a convergence step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScaleDirection {
    Up,
    Down,
}

impl std::fmt::Display for ScaleDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// Target for one backend
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredBackend {
    pub num_replicas: u32,
    pub replica_config: ReplicaConfig,
}

struct LiveBackend {
    replica_config: ReplicaConfig,
    replicas: Vec<Arc<ReplicaHandle>>,
}

/// Owns every live replica handle of one controller
pub struct ReplicaManager {
    runtime: Arc<dyn ReplicaRuntime>,
    desired: Mutex<BTreeMap<String, DesiredBackend>>,
    live: RwLock<BTreeMap<String, LiveBackend>>,
    converge_lock: tokio::sync::Mutex<()>,
    drain_timeout: Duration,
}

impl ReplicaManager {
    pub fn new(runtime: Arc<dyn ReplicaRuntime>, drain_timeout: Duration) -> Self {
        Self {
            runtime,
            desired: Mutex::new(BTreeMap::new()),
            live: RwLock::new(BTreeMap::new()),
            converge_lock: tokio::sync::Mutex::new(()),
            drain_timeout,
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ReplicaRuntime> {
        &self.runtime
    }

    /// Record the target state; takes effect on the next [`converge`](Self::converge)
    pub fn set_desired(&self, desired: BTreeMap<String, DesiredBackend>) {
        *self.desired.lock().unwrap_or_else(|e| e.into_inner()) = desired;
    }

    /// Live replicas per backend
    pub fn live(&self) -> BTreeMap<String, Vec<Arc<ReplicaHandle>>> {
        self.live
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(tag, b)| (tag.clone(), b.replicas.clone()))
            .collect()
    }

    /// Number of live replicas of one backend
    pub fn live_count(&self, backend: &str) -> usize {
        self.live
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(backend)
            .map_or(0, |b| b.replicas.len())
    }

    /// Bring live replicas in line with the latest desired state.
    ///
    /// `on_change` runs if the live set changed, before removed
    /// replicas are drained, so routers stop picking them first.
    pub async fn converge(&self, on_change: &(dyn Fn() + Send + Sync)) -> Result<()> {
        let _guard = self.converge_lock.lock().await;
        let desired = self.desired.lock().unwrap_or_else(|e| e.into_inner()).clone();

        // Remove backends that are gone or whose replica config changed
        let mut retired: Vec<Arc<ReplicaHandle>> = Vec::new();
        {
            let mut live = self.live.write().unwrap_or_else(|e| e.into_inner());
            live.retain(|tag, backend| {
                let keep = desired
                    .get(tag)
                    .is_some_and(|d| d.replica_config == backend.replica_config);
                if !keep {
                    retired.append(&mut backend.replicas);
                }
                keep
            });
        }

        let mut changed = !retired.is_empty();
        let mut first_error = None;
        for (tag, want) in &desired {
            let current = self.live_count(tag);
            let target = want.num_replicas as usize;
            if current < target {
                tracing::info!(
                    backend = %tag,
                    direction = %ScaleDirection::Up,
                    from = current,
                    to = target,
                    "Scaling backend"
                );
                for _ in current..target {
                    match self.runtime.spawn(tag, &want.replica_config).await {
                        Ok(handle) => {
                            tracing::debug!(backend = %tag, replica = handle.id(), "Replica started");
                            let mut live = self.live.write().unwrap_or_else(|e| e.into_inner());
                            live.entry(tag.clone())
                                .or_insert_with(|| LiveBackend {
                                    replica_config: want.replica_config.clone(),
                                    replicas: Vec::new(),
                                })
                                .replicas
                                .push(handle);
                            changed = true;
                        }
                        Err(e) => {
                            tracing::warn!(backend = %tag, error = %e, "Failed to start replica");
                            first_error.get_or_insert(e);
                            break;
                        }
                    }
                }
            } else if current > target {
                tracing::info!(
                    backend = %tag,
                    direction = %ScaleDirection::Down,
                    from = current,
                    to = target,
                    "Scaling backend"
                );
                let mut live = self.live.write().unwrap_or_else(|e| e.into_inner());
                if let Some(backend) = live.get_mut(tag) {
                    retired.extend(backend.replicas.drain(target..));
                    changed = true;
                }
            }
        }

        if changed {
            on_change();
        }

        for replica in retired {
            self.retire(replica).await;
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Drain and stop one replica
    async fn retire(&self, replica: Arc<ReplicaHandle>) {
        if !replica.drain(self.drain_timeout).await {
            tracing::warn!(
                replica = replica.id(),
                in_flight = replica.in_flight(),
                "Drain timed out, stopping replica anyway"
            );
        }
        if let Err(e) = self.runtime.stop(&replica).await {
            tracing::warn!(replica = replica.id(), error = %e, "Failed to stop replica");
        } else {
            tracing::debug!(backend = replica.backend(), replica = replica.id(), "Replica stopped");
        }
    }

    /// Drop replicas the runtime reports dead. Returns how many were removed.
    pub async fn reap_dead(&self) -> usize {
        let _guard = self.converge_lock.lock().await;
        let all: Vec<Arc<ReplicaHandle>> = self
            .live
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .flat_map(|b| b.replicas.iter().cloned())
            .collect();

        let mut dead = Vec::new();
        for replica in all {
            if !self.runtime.is_alive(&replica).await {
                tracing::warn!(
                    backend = replica.backend(),
                    replica = replica.id(),
                    "Replica died, scheduling replacement"
                );
                dead.push(replica.id().to_string());
            }
        }
        if !dead.is_empty() {
            let mut live = self.live.write().unwrap_or_else(|e| e.into_inner());
            for backend in live.values_mut() {
                backend.replicas.retain(|r| !dead.contains(&r.id().to_string()));
            }
        }
        dead.len()
    }

    /// Stop every replica without draining
    pub async fn stop_all(&self) {
        let _guard = self.converge_lock.lock().await;
        self.set_desired(BTreeMap::new());
        let all: Vec<Arc<ReplicaHandle>> = std::mem::take(
            &mut *self.live.write().unwrap_or_else(|e| e.into_inner()),
        )
        .into_values()
        .flat_map(|b| b.replicas)
        .collect();
        for replica in all {
            if let Err(e) = self.runtime.stop(&replica).await {
                tracing::warn!(replica = replica.id(), error = %e, "Failed to stop replica");
            }
        }
    }
}
