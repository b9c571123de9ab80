//! Dispatch targets: how a routed request reaches a worker.

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use http::uri::{Authority, Scheme};
use http::{Request, Response, Uri, header};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tower::ServiceExt;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("worker has not published a request handler yet")]
    NotReady,
    #[error("invalid upstream uri: {0}")]
    InvalidUri(#[from] http::Error),
    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),
    #[error("upstream did not respond within {0:?}")]
    Timeout(Duration),
}

/// Sends a request to one worker and returns its response.
#[async_trait]
pub trait Dispatch: Send + Sync {
    /// # Errors
    /// Returns `DispatchError` when the worker cannot be reached.
    async fn call(&self, request: Request<Body>) -> Result<Response<Body>, DispatchError>;
}

/// Dispatch into an in-process `axum::Router`, published once the worker built it.
#[derive(Clone, Default)]
pub struct RouterDispatch {
    router: Arc<OnceLock<Router>>,
}

impl RouterDispatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the worker's router. Later calls are ignored.
    pub fn publish(&self, router: Router) {
        _ = self.router.set(router);
    }

    #[must_use]
    pub fn is_published(&self) -> bool {
        self.router.get().is_some()
    }
}

#[async_trait]
impl Dispatch for RouterDispatch {
    async fn call(&self, request: Request<Body>) -> Result<Response<Body>, DispatchError> {
        let router = self.router.get().ok_or(DispatchError::NotReady)?.clone();
        Ok(router
            .oneshot(request)
            .await
            .unwrap_or_else(|never| match never {}))
    }
}

/// Upstream response deadline when none is configured.
pub const DEFAULT_PROXY_TIMEOUT: Duration = Duration::from_secs(30);

/// Dispatch over HTTP/1 to a worker listening on a local socket.
///
/// The deadline covers the worker's response head; streaming bodies are not cut.
#[derive(Clone)]
pub struct HttpDispatch {
    addr: SocketAddr,
    authority: Authority,
    client: Client<HttpConnector, Body>,
    timeout: Duration,
}

impl HttpDispatch {
    /// # Errors
    /// Returns an error if `addr` does not form a valid URI authority.
    pub fn new(addr: SocketAddr) -> Result<Self, http::Error> {
        let authority = Authority::try_from(addr.to_string().as_str()).map_err(http::Error::from)?;
        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build(HttpConnector::new());
        Ok(Self {
            addr,
            authority,
            client,
            timeout: DEFAULT_PROXY_TIMEOUT,
        })
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl Dispatch for HttpDispatch {
    async fn call(&self, request: Request<Body>) -> Result<Response<Body>, DispatchError> {
        let (mut parts, body) = request.into_parts();

        let mut uri = parts.uri.into_parts();
        uri.scheme = Some(Scheme::HTTP);
        uri.authority = Some(self.authority.clone());
        if uri.path_and_query.is_none() {
            uri.path_and_query = Some(http::uri::PathAndQuery::from_static("/"));
        }
        parts.uri = Uri::from_parts(uri).map_err(http::Error::from)?;
        parts.headers.remove(header::CONNECTION);

        let response = tokio::time::timeout(self.timeout, self.client.request(Request::from_parts(parts, body)))
            .await
            .map_err(|_| DispatchError::Timeout(self.timeout))??;
        Ok(response.map(Body::new))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use axum::routing::get;
    use http::StatusCode;
    use http_body_util::BodyExt;

    async fn body_text(response: Response<Body>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn router_dispatch_before_publish_is_not_ready() {
        let dispatch = RouterDispatch::new();
        let err = dispatch
            .call(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotReady));
    }

    #[tokio::test]
    async fn router_dispatch_calls_router() {
        let dispatch = RouterDispatch::new();
        dispatch.publish(Router::new().route("/hello", get(|| async { "hi" })));
        assert!(dispatch.is_published());

        let response = dispatch
            .call(Request::get("/hello").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "hi");
    }

    #[tokio::test]
    async fn http_dispatch_reaches_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route(
            "/items",
            get(|uri: Uri| async move { uri.query().unwrap_or_default().to_owned() }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let dispatch = HttpDispatch::new(addr).unwrap();
        let response = dispatch
            .call(Request::get("/items?page=2").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "page=2");
    }

    #[tokio::test]
    async fn http_dispatch_gives_up_on_hung_worker() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route(
            "/stuck",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                "late"
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let dispatch = HttpDispatch::new(addr)
            .unwrap()
            .with_timeout(Duration::from_millis(100));
        let err = dispatch
            .call(Request::get("/stuck").body(Body::empty()).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Timeout(t) if t == Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn http_dispatch_reports_unreachable_worker() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dispatch = HttpDispatch::new(addr).unwrap();
        let err = dispatch
            .call(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Upstream(_)));
    }
}
