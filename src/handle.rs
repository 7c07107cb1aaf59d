//! Client handle — calls one endpoint through one router

use serde_json::Value;
use std::sync::Arc;

use crate::error::Result;
use crate::replica::ServeRequest;
use crate::router::Router;

/// Lightweight stub for invoking an endpoint from code.
///
/// Holds only the router and the endpoint name; traffic decisions are made
/// by the router on every call, so policy changes apply without refetching
/// the handle. A handle stops working once its controller shuts down.
#[derive(Clone)]
pub struct ServeHandle {
    router: Arc<Router>,
    endpoint: String,
    method: String,
}

impl ServeHandle {
    pub fn new(router: Arc<Router>, endpoint: impl Into<String>) -> Self {
        Self {
            router,
            endpoint: endpoint.into(),
            method: "GET".to_string(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Copy of this handle that sends `method` instead
    pub fn with_method(&self, method: impl AsRef<str>) -> Self {
        Self {
            router: self.router.clone(),
            endpoint: self.endpoint.clone(),
            method: method.as_ref().to_ascii_uppercase(),
        }
    }

    /// Invoke the endpoint with `args` as the payload
    pub async fn remote(&self, args: Value) -> Result<Value> {
        self.call(ServeRequest::new(args).with_method(&self.method))
            .await
    }

    /// Invoke the endpoint with a fully built request
    pub async fn call(&self, request: ServeRequest) -> Result<Value> {
        self.router.route(&self.endpoint, request).await
    }
}

impl std::fmt::Debug for ServeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServeHandle")
            .field("router", &self.router.name())
            .field("endpoint", &self.endpoint)
            .field("method", &self.method)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServeError;

    #[test]
    fn test_with_method_uppercases() {
        let router = Arc::new(Router::new("r", Some(1)));
        let handle = ServeHandle::new(router, "api");
        assert_eq!(handle.method(), "GET");
        let post = handle.with_method("post");
        assert_eq!(post.method(), "POST");
        assert_eq!(post.endpoint(), "api");
        assert_eq!(handle.method(), "GET");
    }

    #[tokio::test]
    async fn test_unknown_endpoint() {
        let router = Arc::new(Router::new("r", Some(1)));
        let handle = ServeHandle::new(router, "missing");
        let err = handle.remote(Value::Null).await.unwrap_err();
        assert!(matches!(err, ServeError::NotFound(_)));
    }

    #[test]
    fn test_debug_shows_router() {
        let handle = ServeHandle::new(Arc::new(Router::new("node-a", None)), "api");
        let debug = format!("{:?}", handle);
        assert!(debug.contains("node-a"));
        assert!(debug.contains("api"));
    }

    #[test]
    fn test_handle_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ServeHandle>();
    }
}
