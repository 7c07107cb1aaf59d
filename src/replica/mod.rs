//! Replicas — the serving capability and live replica handles
//!
//! A replica is anything implementing [`ServeCallable`]. Two adapters cover
//! the common shapes:
//! - [`FunctionReplica`] — a stateless function (single or batch)
//! - [`InstanceReplica`] — a stateful object implementing [`ServeInstance`]
//!
//! The router never talks to a callable directly; it goes through a
//! [`ReplicaHandle`], which tracks in-flight work so scale-down can drain.

pub mod runtime;

pub use runtime::{HttpRuntime, LocalRuntime, ReplicaRuntime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use crate::error::{Result, ServeError};

/// A request as seen by a replica
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServeRequest {
    /// Uppercase HTTP method (default: GET)
    #[serde(default = "default_method")]
    pub method: String,

    /// Path the request arrived on, when it came through the HTTP listener
    #[serde(default)]
    pub path: Option<String>,

    /// Request payload
    #[serde(default)]
    pub args: Value,
}

fn default_method() -> String {
    "GET".to_string()
}

impl ServeRequest {
    pub fn new(args: Value) -> Self {
        Self {
            method: default_method(),
            path: None,
            args,
        }
    }

    pub fn with_method(mut self, method: impl AsRef<str>) -> Self {
        self.method = method.as_ref().to_ascii_uppercase();
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

/// The serving capability every replica implements
#[async_trait]
pub trait ServeCallable: Send + Sync {
    /// Handle one request
    async fn call(&self, request: ServeRequest) -> Result<Value>;

    /// Handle a batch; results are returned in request order.
    ///
    /// The default calls [`call`](Self::call) for each request in turn.
    async fn call_batch(&self, requests: Vec<ServeRequest>) -> Result<Vec<Value>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.call(request).await?);
        }
        Ok(results)
    }
}

/// Stateless single-request function
pub type ServeFn = Arc<dyn Fn(ServeRequest) -> Result<Value> + Send + Sync>;
/// Stateless batch function
pub type BatchFn = Arc<dyn Fn(Vec<ServeRequest>) -> Result<Vec<Value>> + Send + Sync>;

enum FunctionKind {
    Single(ServeFn),
    Batch(BatchFn),
}

/// Adapter for stateless functions
pub struct FunctionReplica {
    kind: FunctionKind,
    blocking: bool,
}

impl FunctionReplica {
    pub fn new(f: ServeFn) -> Self {
        Self {
            kind: FunctionKind::Single(f),
            blocking: false,
        }
    }

    pub fn batch(f: BatchFn) -> Self {
        Self {
            kind: FunctionKind::Batch(f),
            blocking: false,
        }
    }

    /// Run the function on the blocking pool
    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }
}

#[async_trait]
impl ServeCallable for FunctionReplica {
    async fn call(&self, request: ServeRequest) -> Result<Value> {
        match &self.kind {
            FunctionKind::Single(f) => {
                let f = Arc::clone(f);
                run(self.blocking, move || f(request)).await
            }
            FunctionKind::Batch(f) => {
                let f = Arc::clone(f);
                let mut results = run(self.blocking, move || f(vec![request])).await?;
                match (results.pop(), results.is_empty()) {
                    (Some(value), true) => Ok(value),
                    _ => Err(ServeError::Replica(
                        "batch function must return one result per request".to_string(),
                    )),
                }
            }
        }
    }

    async fn call_batch(&self, requests: Vec<ServeRequest>) -> Result<Vec<Value>> {
        match &self.kind {
            FunctionKind::Single(f) => {
                let f = Arc::clone(f);
                run(self.blocking, move || requests.into_iter().map(|r| f(r)).collect()).await
            }
            FunctionKind::Batch(f) => {
                let f = Arc::clone(f);
                run(self.blocking, move || f(requests)).await
            }
        }
    }
}

/// A stateful serving object, constructed once per replica
pub trait ServeInstance: Send + 'static {
    fn handle(&mut self, request: ServeRequest) -> Result<Value>;

    fn handle_batch(&mut self, requests: Vec<ServeRequest>) -> Result<Vec<Value>> {
        requests.into_iter().map(|r| self.handle(r)).collect()
    }
}

/// Adapter for stateful instances; calls are serialized on the instance
pub struct InstanceReplica {
    instance: Arc<Mutex<Box<dyn ServeInstance>>>,
    blocking: bool,
}

impl InstanceReplica {
    pub fn new(instance: Box<dyn ServeInstance>) -> Self {
        Self {
            instance: Arc::new(Mutex::new(instance)),
            blocking: false,
        }
    }

    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }
}

#[async_trait]
impl ServeCallable for InstanceReplica {
    async fn call(&self, request: ServeRequest) -> Result<Value> {
        let instance = Arc::clone(&self.instance);
        run(self.blocking, move || {
            instance
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .handle(request)
        })
        .await
    }

    async fn call_batch(&self, requests: Vec<ServeRequest>) -> Result<Vec<Value>> {
        let instance = Arc::clone(&self.instance);
        run(self.blocking, move || {
            instance
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .handle_batch(requests)
        })
        .await
    }
}

/// Run a synchronous body inline or on the blocking pool
async fn run<T, F>(blocking: bool, body: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    if blocking {
        tokio::task::spawn_blocking(body)
            .await
            .map_err(|e| ServeError::Replica(format!("blocking task failed: {}", e)))?
    } else {
        body()
    }
}

/// High bit of the handle state: no new work is admitted
const DRAINING: usize = 1 << (usize::BITS - 1);

/// A live replica of one backend
pub struct ReplicaHandle {
    id: String,
    backend: String,
    callable: Arc<dyn ServeCallable>,
    /// in-flight request count, plus the DRAINING bit
    state: AtomicUsize,
    stopped: AtomicBool,
    idle: Notify,
}

impl ReplicaHandle {
    pub fn new(
        id: impl Into<String>,
        backend: impl Into<String>,
        callable: Arc<dyn ServeCallable>,
    ) -> Self {
        Self {
            id: id.into(),
            backend: backend.into(),
            callable,
            state: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            idle: Notify::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Reserve `n` request slots. Fails once the replica drains or stops.
    pub fn try_acquire(&self, n: usize) -> bool {
        if self.is_stopped() {
            return false;
        }
        self.state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| {
                if s & DRAINING != 0 {
                    None
                } else {
                    Some(s + n)
                }
            })
            .is_ok()
    }

    /// Return `n` slots taken by [`try_acquire`](Self::try_acquire)
    pub fn release(&self, n: usize) {
        let prev = self.state.fetch_sub(n, Ordering::SeqCst);
        if prev & DRAINING != 0 && prev & !DRAINING == n {
            self.idle.notify_waiters();
        }
    }

    pub async fn invoke(&self, request: ServeRequest) -> Result<Value> {
        if self.is_stopped() {
            return Err(ServeError::Replica(format!("replica {} is stopped", self.id)));
        }
        self.callable.call(request).await
    }

    pub async fn invoke_batch(&self, requests: Vec<ServeRequest>) -> Result<Vec<Value>> {
        if self.is_stopped() {
            return Err(ServeError::Replica(format!("replica {} is stopped", self.id)));
        }
        self.callable.call_batch(requests).await
    }

    /// Requests currently executing on this replica
    pub fn in_flight(&self) -> usize {
        self.state.load(Ordering::SeqCst) & !DRAINING
    }

    pub fn is_draining(&self) -> bool {
        self.state.load(Ordering::SeqCst) & DRAINING != 0
    }

    /// Stop admitting work and wait for in-flight requests to finish.
    ///
    /// Returns false if `timeout` elapsed first.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.state.fetch_or(DRAINING, Ordering::SeqCst);
        let wait = async {
            loop {
                let notified = self.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.in_flight() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    pub fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ReplicaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaHandle")
            .field("id", &self.id)
            .field("backend", &self.backend)
            .field("in_flight", &self.in_flight())
            .field("draining", &self.is_draining())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo() -> Arc<dyn ServeCallable> {
        Arc::new(FunctionReplica::new(Arc::new(|req: ServeRequest| {
            Ok(req.args)
        })))
    }

    struct Counter {
        count: u64,
    }

    impl ServeInstance for Counter {
        fn handle(&mut self, _request: ServeRequest) -> Result<Value> {
            self.count += 1;
            Ok(json!(self.count))
        }
    }

    #[test]
    fn test_request_builder() {
        let req = ServeRequest::new(json!({"x": 1}))
            .with_method("post")
            .with_path("/api");
        assert_eq!(req.method, "POST");
        assert_eq!(req.path.as_deref(), Some("/api"));
    }

    #[test]
    fn test_request_defaults_from_json() {
        let req: ServeRequest = serde_json::from_value(json!({})).unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.args, Value::Null);
    }

    #[tokio::test]
    async fn test_function_replica_call() {
        let replica = echo();
        let out = replica.call(ServeRequest::new(json!(42))).await.unwrap();
        assert_eq!(out, json!(42));
    }

    #[tokio::test]
    async fn test_function_replica_default_batch() {
        let replica = echo();
        let out = replica
            .call_batch(vec![ServeRequest::new(json!(1)), ServeRequest::new(json!(2))])
            .await
            .unwrap();
        assert_eq!(out, vec![json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn test_batch_function_single_call() {
        let replica = FunctionReplica::batch(Arc::new(|reqs: Vec<ServeRequest>| {
            Ok(reqs.iter().map(|_| json!(reqs.len())).collect())
        }));
        assert_eq!(
            replica.call(ServeRequest::new(Value::Null)).await.unwrap(),
            json!(1)
        );
    }

    #[tokio::test]
    async fn test_batch_function_wrong_length() {
        let replica = FunctionReplica::batch(Arc::new(|_reqs: Vec<ServeRequest>| Ok(vec![])));
        let err = replica.call(ServeRequest::new(Value::Null)).await.unwrap_err();
        assert!(matches!(err, ServeError::Replica(_)));
    }

    #[tokio::test]
    async fn test_blocking_function_runs_on_pool() {
        let replica = FunctionReplica::new(Arc::new(|req: ServeRequest| {
            std::thread::sleep(Duration::from_millis(5));
            Ok(req.args)
        }))
        .blocking(true);
        assert_eq!(
            replica.call(ServeRequest::new(json!("slow"))).await.unwrap(),
            json!("slow")
        );
    }

    #[tokio::test]
    async fn test_instance_keeps_state() {
        let replica = InstanceReplica::new(Box::new(Counter { count: 0 }));
        replica.call(ServeRequest::new(Value::Null)).await.unwrap();
        let out = replica
            .call_batch(vec![
                ServeRequest::new(Value::Null),
                ServeRequest::new(Value::Null),
            ])
            .await
            .unwrap();
        assert_eq!(out, vec![json!(2), json!(3)]);
    }

    #[test]
    fn test_handle_acquire_release() {
        let handle = ReplicaHandle::new("r1", "b", echo());
        assert!(handle.try_acquire(3));
        assert_eq!(handle.in_flight(), 3);
        handle.release(2);
        assert_eq!(handle.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_drain_waits_for_in_flight() {
        let handle = Arc::new(ReplicaHandle::new("r1", "b", echo()));
        assert!(handle.try_acquire(1));

        let h = handle.clone();
        let drain = tokio::spawn(async move { h.drain(Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.is_draining());
        assert!(!handle.try_acquire(1));
        assert!(!drain.is_finished());

        handle.release(1);
        assert!(drain.await.unwrap());
    }

    #[tokio::test]
    async fn test_drain_idle_returns_immediately() {
        let handle = ReplicaHandle::new("r1", "b", echo());
        assert!(handle.drain(Duration::from_millis(10)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_timeout() {
        let handle = ReplicaHandle::new("r1", "b", echo());
        assert!(handle.try_acquire(1));
        assert!(!handle.drain(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn test_stopped_handle_rejects() {
        let handle = ReplicaHandle::new("r1", "b", echo());
        handle.mark_stopped();
        assert!(!handle.try_acquire(1));
        assert!(handle.invoke(ServeRequest::new(Value::Null)).await.is_err());
    }

    #[test]
    fn test_handle_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ReplicaHandle>();
        assert_send_sync::<FunctionReplica>();
        assert_send_sync::<InstanceReplica>();
    }
}
