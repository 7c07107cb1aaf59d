//! Per-backend request queue — admission control and dynamic batching
//!
//! Each backend known to a router owns one [`BackendQueue`]. Callers enqueue
//! and await a oneshot reply; a dispatcher task drains the queue onto the
//! backend's replicas, never letting more than `max_concurrent_queries`
//! requests be outstanding.

use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

use crate::config::BackendConfig;
use crate::error::{Result, ServeError};
use crate::replica::{ReplicaHandle, ServeRequest};

type Reply = oneshot::Sender<Result<Value>>;

struct Pending {
    request: ServeRequest,
    reply: Reply,
    enqueued_at: Instant,
}

struct QueueState {
    config: BackendConfig,
    replicas: Vec<Arc<ReplicaHandle>>,
    next_replica: usize,
    in_flight: usize,
    pending: VecDeque<Pending>,
    closed: bool,
}

/// What the dispatcher should do after a pass over the queue
enum Step {
    /// Sleep until notified
    Idle,
    /// Sleep until notified or until a partial batch times out
    WaitUntil(Instant),
    Closed,
}

/// Queue and dispatcher for one backend
///
/// Batches are assembled from a single backend-wide queue and handed to the
/// next admitting replica when they flush, so with several replicas a batch
/// fills from the whole backend's traffic rather than one replica's share.
pub struct BackendQueue {
    backend: String,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl BackendQueue {
    /// Create a queue and start its dispatcher task
    pub fn start(
        backend: impl Into<String>,
        config: BackendConfig,
        replicas: Vec<Arc<ReplicaHandle>>,
    ) -> Arc<Self> {
        let queue = Arc::new(Self {
            backend: backend.into(),
            state: Mutex::new(QueueState {
                config,
                replicas,
                next_replica: 0,
                in_flight: 0,
                pending: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        });
        tokio::spawn(Arc::clone(&queue).run());
        queue
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Enqueue a request; the receiver resolves with the replica's answer.
    ///
    /// Dropping the receiver before dispatch withdraws the request.
    pub fn enqueue(&self, request: ServeRequest) -> oneshot::Receiver<Result<Value>> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        if state.closed {
            let _ = tx.send(Err(self.removed()));
            return rx;
        }
        state.pending.push_back(Pending {
            request,
            reply: tx,
            enqueued_at: Instant::now(),
        });
        drop(state);
        self.notify.notify_one();
        rx
    }

    /// Enqueue a request and wait for its result
    pub async fn submit(&self, request: ServeRequest) -> Result<Value> {
        self.enqueue(request)
            .await
            .map_err(|_| ServeError::upstream(&self.backend, "request was dropped by the router"))?
    }

    /// Install a new config and replica set
    pub fn update(&self, config: BackendConfig, replicas: Vec<Arc<ReplicaHandle>>) {
        let mut state = self.lock();
        state.config = config;
        state.replicas = replicas;
        drop(state);
        self.notify.notify_one();
    }

    /// Stop the dispatcher and fail everything still queued
    pub fn close(&self) {
        let drained: Vec<Pending> = {
            let mut state = self.lock();
            state.closed = true;
            state.pending.drain(..).collect()
        };
        if !drained.is_empty() {
            tracing::debug!(
                backend = %self.backend,
                failed = drained.len(),
                "Failing queued requests for removed backend"
            );
        }
        for p in drained {
            let _ = p.reply.send(Err(self.removed()));
        }
        self.notify.notify_one();
    }

    /// Requests waiting for dispatch
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Requests dispatched and not yet answered
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn removed(&self) -> ServeError {
        ServeError::upstream(&self.backend, "backend was removed before the request was dispatched")
    }

    async fn run(self: Arc<Self>) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.dispatch_ready() {
                Step::Closed => return,
                Step::Idle => notified.await,
                Step::WaitUntil(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
            }
        }
    }

    /// Dispatch everything admissible right now
    fn dispatch_ready(self: &Arc<Self>) -> Step {
        let mut state = self.lock();
        if state.closed {
            return Step::Closed;
        }
        // Abandoned requests leave the queue before they take a slot
        state.pending.retain(|p| !p.reply.is_closed());

        let batching = state.config.batching_enabled();
        let batch_size = state.config.effective_batch_size();
        let limit = state.config.max_concurrent_queries as usize;

        loop {
            let Some(front) = state.pending.front() else {
                return Step::Idle;
            };
            let free = limit.saturating_sub(state.in_flight);
            if free == 0 {
                return Step::Idle;
            }

            let take = if batching {
                // An unrepresentable deadline flushes now
                let deadline = front.enqueued_at.checked_add(state.config.batch_wait_timeout);
                if let Some(deadline) = deadline {
                    if state.pending.len() < batch_size && Instant::now() < deadline {
                        return Step::WaitUntil(deadline);
                    }
                }
                state.pending.len().min(batch_size).min(free)
            } else {
                1
            };

            let Some(replica) = pick_replica(&mut state, take) else {
                return Step::Idle;
            };
            let batch: Vec<Pending> = state.pending.drain(..take).collect();
            state.in_flight += take;
            self.dispatch(replica, batch, batching);
        }
    }

    fn dispatch(self: &Arc<Self>, replica: Arc<ReplicaHandle>, batch: Vec<Pending>, batching: bool) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let n = batch.len();
            let (requests, replies): (Vec<ServeRequest>, Vec<Reply>) =
                batch.into_iter().map(|p| (p.request, p.reply)).unzip();

            let results = if batching {
                replica.invoke_batch(requests).await
            } else {
                let mut requests = requests;
                match requests.pop() {
                    Some(request) => replica.invoke(request).await.map(|v| vec![v]),
                    None => Ok(Vec::new()),
                }
            };
            replica.release(n);
            queue.complete(n);

            match results {
                Ok(values) if values.len() == n => {
                    for (reply, value) in replies.into_iter().zip(values) {
                        let _ = reply.send(Ok(value));
                    }
                }
                Ok(values) => {
                    let message = format!(
                        "replica returned {} results for a batch of {}",
                        values.len(),
                        n
                    );
                    for reply in replies {
                        let _ = reply.send(Err(ServeError::upstream(&queue.backend, &message)));
                    }
                }
                Err(e) => {
                    tracing::debug!(
                        backend = %queue.backend,
                        replica = replica.id(),
                        error = %e,
                        "Replica invocation failed"
                    );
                    let message = e.to_string();
                    for reply in replies {
                        let _ = reply.send(Err(ServeError::upstream(&queue.backend, &message)));
                    }
                }
            }
        });
    }

    fn complete(&self, n: usize) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(n);
        drop(state);
        self.notify.notify_one();
    }
}

/// Round-robin over replicas that still admit work
fn pick_replica(state: &mut QueueState, n: usize) -> Option<Arc<ReplicaHandle>> {
    let count = state.replicas.len();
    for _ in 0..count {
        let idx = state.next_replica % count;
        state.next_replica = state.next_replica.wrapping_add(1);
        let replica = &state.replicas[idx];
        if replica.try_acquire(n) {
            return Some(Arc::clone(replica));
        }
    }
    None
}
