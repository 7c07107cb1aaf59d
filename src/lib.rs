//! # A3S Serve
//!
//! Control plane and request routing for model serving: named endpoints,
//! versioned backends, weighted and shadow traffic, and a router that
//! admits and batches requests per backend.
//!
//! ## Architecture
//!
//! ```text
//! Session → Controller (registries, checkpoint) → Router snapshot
//!                                                     ↓
//! ServeHandle / HTTP listener → Router → BackendQueue → Replica
//! ```
//!
//! ## Core Features
//!
//! - **Traffic policy**: weighted splits across backends plus independent shadow copies
//! - **Admission control**: per-backend concurrency limit with queueing
//! - **Dynamic batching**: flush on batch size or on wait timeout
//! - **Durable state**: every accepted mutation is checkpointed before it is acknowledged
//! - **Replica supervision**: crashed replicas are replaced by convergence
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use a3s_serve::{config::{ReplicaConfig, ServeConfig}, LocalRuntime, ServeCluster};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> a3s_serve::Result<()> {
//!     let runtime = Arc::new(LocalRuntime::new());
//!     runtime.register_function("echo", |req| Ok(req.args));
//!
//!     let cluster = ServeCluster::new(ServeConfig::default(), runtime);
//!     let serve = cluster.init("default").await?;
//!     serve.create_backend("echo:v1", ReplicaConfig::new("echo"), Default::default()).await?;
//!     serve.create_endpoint("echo", "echo:v1", Some("/echo"), None).await?;
//!     let out = serve.get_handle("echo", false)?.remote(serde_json::json!("hi")).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod handle;
pub mod proxy;
pub mod registry;
pub mod replica;
pub mod router;
pub mod session;

// Re-export main types
pub use controller::{Controller, ControllerStatus};
pub use error::{ErrorKind, Result, ServeError};
pub use handle::ServeHandle;
pub use replica::{HttpRuntime, LocalRuntime, ReplicaRuntime, ServeRequest};
pub use session::{ServeCluster, Session};

use serde::{Deserialize, Serialize};

/// Controller lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(Default)]
pub enum ControllerState {
    /// Created, registries not yet loaded
    #[default]
    Initializing,
    /// Restoring registries and replicas from a checkpoint
    Recovering,
    /// Accepting administrative calls and routing traffic
    Serving,
    /// Tearing down routers and replicas
    ShuttingDown,
    /// Gone; callers must initialize a new controller
    Terminated,
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Recovering => write!(f, "recovering"),
            Self::Serving => write!(f, "serving"),
            Self::ShuttingDown => write!(f, "shutting down"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_state_default() {
        assert_eq!(ControllerState::default(), ControllerState::Initializing);
    }

    #[test]
    fn test_controller_state_display() {
        assert_eq!(ControllerState::Initializing.to_string(), "initializing");
        assert_eq!(ControllerState::Recovering.to_string(), "recovering");
        assert_eq!(ControllerState::Serving.to_string(), "serving");
        assert_eq!(ControllerState::ShuttingDown.to_string(), "shutting down");
        assert_eq!(ControllerState::Terminated.to_string(), "terminated");
    }

    #[test]
    fn test_controller_state_serialization() {
        let json = serde_json::to_string(&ControllerState::Serving).unwrap();
        let parsed: ControllerState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ControllerState::Serving);
    }

    #[test]
    fn test_controller_status_serialization() {
        let status = ControllerStatus {
            name: "prod".to_string(),
            state: ControllerState::Serving,
            seq: 12,
            endpoints: 2,
            backends: 3,
            replicas: 5,
        };
        let json = serde_json::to_string(&status).unwrap();
        let parsed: ControllerStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.state, ControllerState::Serving);
        assert_eq!(parsed.seq, 12);
        assert_eq!(parsed.replicas, 5);
    }
}
