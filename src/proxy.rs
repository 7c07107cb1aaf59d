//! HTTP listener — turns wire requests into router calls
//!
//! `GET /-/routes` lists the routed endpoints and doubles as the readiness
//! probe; any other path is matched exactly against endpoint routes.

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::error::{Result, ServeError};
use crate::replica::ServeRequest;
use crate::router::Router;

/// Path of the route listing and readiness probe
pub const ROUTES_PATH: &str = "/-/routes";

/// A running HTTP listener bound to one router
pub struct HttpProxy {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl HttpProxy {
    /// Bind `address` and serve requests through `router`
    pub async fn start(address: &str, router: Arc<Router>) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| ServeError::Config(format!("Failed to bind {}: {}", address, e)))?;
        let local_addr = listener.local_addr()?;
        tracing::info!(address = %local_addr, router = router.name(), "HTTP listener started");

        let task = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };
                let router = router.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let _ = http1::Builder::new()
                        .serve_connection(
                            io,
                            service_fn(|req| handle_request(req, router.clone())),
                        )
                        .await;
                });
            }
        });

        Ok(Self { local_addr, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Base URL, e.g. `http://127.0.0.1:8000`
    pub fn url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    pub fn stop(&self) {
        self.task.abort();
        tracing::info!(address = %self.local_addr, "HTTP listener stopped");
    }
}

impl Drop for HttpProxy {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for HttpProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProxy")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

/// `{route: [endpoint, [methods...]]}` for every endpoint with a route
pub fn route_listing(router: &Router) -> BTreeMap<String, (String, Vec<String>)> {
    let table = router.snapshot();
    table
        .endpoints
        .iter()
        .filter_map(|(name, ep)| {
            ep.route.as_ref().map(|route| {
                (
                    route.clone(),
                    (name.clone(), ep.methods.iter().cloned().collect()),
                )
            })
        })
        .collect()
}

async fn handle_request(
    req: hyper::Request<Incoming>,
    router: Arc<Router>,
) -> std::result::Result<hyper::Response<Full<Bytes>>, hyper::Error> {
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();
    let method = parts.method.as_str().to_string();

    if path == ROUTES_PATH {
        return Ok(match serde_json::to_value(route_listing(&router)) {
            Ok(listing) => json_response(200, &listing),
            Err(e) => error_response(&ServeError::from(e)),
        });
    }

    let endpoint = router.snapshot().endpoints.iter().find_map(|(name, ep)| {
        (ep.route.as_deref() == Some(path.as_str())).then(|| name.clone())
    });
    let Some(endpoint) = endpoint else {
        return Ok(error_response(&ServeError::NotFound(format!(
            "no endpoint is routed at {}",
            path
        ))));
    };

    let args = match read_args(body).await {
        Ok(args) => args,
        Err(e) => return Ok(error_response(&e)),
    };

    let request = ServeRequest::new(args)
        .with_method(&method)
        .with_path(path.clone());
    match router.route(&endpoint, request).await {
        Ok(result) => Ok(json_response(200, &result)),
        Err(e) => {
            tracing::debug!(%endpoint, %path, error = %e, "Request failed");
            Ok(error_response(&e))
        }
    }
}

/// Parse a request body as JSON call arguments; an empty body is `null`
async fn read_args<B>(body: B) -> Result<Value>
where
    B: hyper::body::Body,
    B::Error: std::fmt::Display,
{
    let bytes = http_body_util::BodyExt::collect(body)
        .await
        .map_err(|e| ServeError::Validation(format!("failed to read request body: {}", e)))?
        .to_bytes();
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&bytes)
        .map_err(|e| ServeError::Validation(format!("request body is not valid JSON: {}", e)))
}

fn json_response(status: u16, value: &Value) -> hyper::Response<Full<Bytes>> {
    let body = serde_json::to_vec(value).unwrap_or_default();
    let mut response = hyper::Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() =
        http::StatusCode::from_u16(status).unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR);
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    response
}

fn error_response(error: &ServeError) -> hyper::Response<Full<Bytes>> {
    json_response(
        error.kind().status_code(),
        &json!({ "error": error.to_string() }),
    )
}

/// Poll `url` until it answers 2xx or `timeout` elapses
pub async fn block_until_http_ready(url: &str, timeout: Duration) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(1))
        .build()?;
    let deadline = tokio::time::Instant::now() + timeout;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match client.get(url).send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(url, attempts, "HTTP listener ready");
                return Ok(());
            }
            Ok(resp) => {
                tracing::warn!(url, status = resp.status().as_u16(), "Readiness probe not ready yet")
            }
            Err(e) => tracing::warn!(url, error = %e, "Readiness probe failed"),
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(ServeError::Unavailable(format!(
                "HTTP listener at {} not ready after {:?}",
                url, timeout
            )));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, ReplicaConfig};
    use crate::registry::Registries;
    use crate::replica::{FunctionReplica, ReplicaHandle};
    use crate::router::RoutingTable;

    fn router_with_api() -> Arc<Router> {
        let mut reg = Registries::default();
        reg.create_backend("v1", ReplicaConfig::new("echo"), Default::default())
            .unwrap();
        reg.create_endpoint("api", "v1", Some("/api"), Some(&["GET".to_string(), "POST".to_string()]))
            .unwrap();
        reg.create_endpoint("internal", "v1", None, None).unwrap();

        let replica = Arc::new(ReplicaHandle::new(
            "v1#0",
            "v1",
            Arc::new(FunctionReplica::new(Arc::new(|req: ServeRequest| {
                Ok(json!({"method": req.method, "args": req.args}))
            }))),
        ));
        let backends: BTreeMap<String, BackendConfig> = reg.list_backends();
        let table = RoutingTable {
            epoch: 1,
            endpoints: reg.endpoints.iter().map(|(n, e)| (n.clone(), e.clone())).collect(),
            backends,
            replicas: BTreeMap::from([("v1".to_string(), vec![replica])]),
        };
        let router = Arc::new(Router::new("node", Some(1)));
        assert!(router.apply(table));
        router
    }

    #[tokio::test]
    async fn test_route_listing() {
        let router = router_with_api();
        let listing = route_listing(&router);
        assert_eq!(listing.len(), 1);
        let (endpoint, methods) = &listing["/api"];
        assert_eq!(endpoint, "api");
        assert_eq!(methods, &vec!["GET".to_string(), "POST".to_string()]);
    }

    #[tokio::test]
    async fn test_serves_routes_and_requests() {
        let proxy = HttpProxy::start("127.0.0.1:0", router_with_api()).await.unwrap();
        let base = proxy.url();
        block_until_http_ready(&format!("{}{}", base, ROUTES_PATH), Duration::from_secs(5))
            .await
            .unwrap();

        let client = reqwest::Client::new();
        let routes: Value = client
            .get(format!("{}{}", base, ROUTES_PATH))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(routes, json!({"/api": ["api", ["GET", "POST"]]}));

        let resp = client
            .post(format!("{}/api", base))
            .body(r#"{"x": 1}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body, json!({"method": "POST", "args": {"x": 1}}));

        let resp = client.get(format!("{}/nowhere", base)).send().await.unwrap();
        assert_eq!(resp.status(), 404);

        let resp = client.delete(format!("{}/api", base)).send().await.unwrap();
        assert_eq!(resp.status(), 404);

        let resp = client
            .post(format!("{}/api", base))
            .body("{broken")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        proxy.stop();
    }

    #[tokio::test]
    async fn test_truncated_body_rejected() {
        use http_body_util::StreamBody;
        use hyper::body::Frame;

        let frames: Vec<std::result::Result<Frame<Bytes>, std::io::Error>> = vec![
            Ok(Frame::data(Bytes::from_static(b"{\"x\": "))),
            Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-body",
            )),
        ];
        let err = read_args(StreamBody::new(futures_util::stream::iter(frames)))
            .await
            .unwrap_err();
        assert!(matches!(err, ServeError::Validation(_)));
        assert_eq!(err.kind().status_code(), 400);
        assert!(err.to_string().contains("failed to read request body"));

        assert_eq!(read_args(Full::new(Bytes::new())).await.unwrap(), Value::Null);
        assert_eq!(
            read_args(Full::new(Bytes::from_static(b"[1, 2]"))).await.unwrap(),
            json!([1, 2])
        );
    }

    #[tokio::test]
    async fn test_probe_times_out() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = block_until_http_ready(
            &format!("http://{}{}", addr, ROUTES_PATH),
            Duration::from_millis(300),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServeError::Unavailable(_)));
    }
}
