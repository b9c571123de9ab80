//! Management API
//!
//! Read model over the runtime (services, routes, metrics) plus the two
//! manual-intervention operations, served as JSON under `/api/v1`.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::descriptor::{ServiceDescriptor, ServiceId};
use crate::error::RuntimeError;
use crate::mesh::RouteEntry;
use crate::problem::{self, Problem};
use crate::reload::ReloadStatus;
use crate::runtime::RuntimeContext;
use crate::telemetry::MetricRecord;
use crate::worker::{HealthStatus, WorkerState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerView {
    pub worker_id: Uuid,
    pub state: WorkerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub uptime_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub id: ServiceId,
    pub path: String,
    pub mount: Option<String>,
    pub entrypoint: bool,
    pub depends_on: Vec<ServiceId>,
    pub watch_enabled: bool,
    /// `None` until the service's first start.
    pub worker: Option<WorkerView>,
    pub health: Option<HealthStatus>,
    /// Crashes counted against the restart policy in the current window.
    pub crashes: u32,
    /// The restart policy is exhausted; only a manual restart brings it back.
    pub gave_up: bool,
    pub traffic: TrafficView,
    pub reload: ReloadStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrafficView {
    pub draining: bool,
    pub inflight: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteTableView {
    pub generation: u64,
    pub entries: Vec<RouteEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceMetrics {
    pub service_id: ServiceId,
    pub latest: BTreeMap<String, f64>,
    pub samples: Vec<MetricRecord>,
}

impl RuntimeContext {
    /// Status of every configured service, in declaration order.
    #[must_use]
    pub fn list_services(&self) -> Vec<ServiceStatus> {
        self.store()
            .iter()
            .map(|descriptor| self.status_of(descriptor))
            .collect()
    }

    #[must_use]
    pub fn service_status(&self, service: &ServiceId) -> Option<ServiceStatus> {
        self.store().get(service).map(|descriptor| self.status_of(descriptor))
    }

    #[must_use]
    pub fn route_table(&self) -> RouteTableView {
        let table = self.mesh().table();
        RouteTableView {
            generation: table.generation(),
            entries: table.entries().to_vec(),
        }
    }

    #[must_use]
    pub fn service_metrics(&self, service: &ServiceId) -> Option<ServiceMetrics> {
        if !self.store().contains(service) {
            return None;
        }
        Some(ServiceMetrics {
            service_id: service.clone(),
            latest: self.metrics().latest(service),
            samples: self.metrics().recent(service),
        })
    }

    fn status_of(&self, descriptor: &ServiceDescriptor) -> ServiceStatus {
        let id = &descriptor.id;
        let snapshot = self.supervisor().snapshot(id);
        let health = snapshot
            .as_ref()
            .and_then(|s| self.supervisor().health(&s.handle).ok());
        let gate = self.mesh().gate(id);

        ServiceStatus {
            id: id.clone(),
            path: descriptor.path.display().to_string(),
            mount: self.store().mount_for(id),
            entrypoint: self.store().is_entrypoint(id),
            depends_on: descriptor.depends_on.iter().cloned().collect(),
            watch_enabled: descriptor.watch_enabled,
            worker: snapshot.as_ref().map(|s| WorkerView {
                worker_id: s.handle.worker_id,
                state: s.handle.state,
                pid: s.handle.process.and_then(|p| p.pid()),
                restart_count: s.handle.restart_count,
                uptime_ms: u64::try_from(s.handle.uptime().as_millis()).unwrap_or(u64::MAX),
                last_error: s.handle.last_error.clone(),
            }),
            health,
            crashes: snapshot.as_ref().map_or(0, |s| s.crashes),
            gave_up: snapshot.as_ref().is_some_and(|s| s.gave_up),
            traffic: TrafficView {
                draining: gate.is_draining(),
                inflight: gate.inflight(),
            },
            reload: self.reload().status(id),
        }
    }
}

/// Management routes over `ctx`.
pub fn router(ctx: Arc<RuntimeContext>) -> Router {
    Router::new()
        .route("/api/v1/services", get(list_services))
        .route("/api/v1/services/{id}", get(get_service))
        .route("/api/v1/services/{id}/metrics", get(get_metrics))
        .route("/api/v1/services/{id}/restart", post(restart_service))
        .route("/api/v1/services/{id}/reload", post(reload_service))
        .route("/api/v1/routes", get(get_routes))
        .with_state(ctx)
}

fn unknown(id: &ServiceId) -> Problem {
    problem::not_found(format!("service '{id}' is not configured")).with_service(id.as_str())
}

fn to_problem(error: &RuntimeError) -> Problem {
    match error {
        RuntimeError::UnknownService(id) => unknown(id),
        RuntimeError::StaleHandle { service, .. } => {
            problem::conflict(error.to_string()).with_service(service.as_str())
        }
        RuntimeError::RouteConflict(_) => problem::conflict(error.to_string()),
        RuntimeError::Startup(e) => {
            problem::service_unavailable(error.to_string()).with_service(e.service.as_str())
        }
        _ => problem::internal_error(error.to_string()),
    }
}

async fn list_services(State(ctx): State<Arc<RuntimeContext>>) -> Json<Vec<ServiceStatus>> {
    Json(ctx.list_services())
}

async fn get_service(
    State(ctx): State<Arc<RuntimeContext>>,
    Path(id): Path<ServiceId>,
) -> Result<Json<ServiceStatus>, Problem> {
    ctx.service_status(&id).map(Json).ok_or_else(|| unknown(&id))
}

async fn get_metrics(
    State(ctx): State<Arc<RuntimeContext>>,
    Path(id): Path<ServiceId>,
) -> Result<Json<ServiceMetrics>, Problem> {
    ctx.service_metrics(&id).map(Json).ok_or_else(|| unknown(&id))
}

async fn get_routes(State(ctx): State<Arc<RuntimeContext>>) -> Json<RouteTableView> {
    Json(ctx.route_table())
}

async fn restart_service(
    State(ctx): State<Arc<RuntimeContext>>,
    Path(id): Path<ServiceId>,
) -> Result<Json<ServiceStatus>, Problem> {
    tracing::info!(service = %id, "Manual restart requested");
    ctx.request_restart(&id).await.map_err(|e| to_problem(&e))?;
    ctx.service_status(&id).map(Json).ok_or_else(|| unknown(&id))
}

async fn reload_service(
    State(ctx): State<Arc<RuntimeContext>>,
    Path(id): Path<ServiceId>,
) -> Result<Response, Problem> {
    ctx.notify_change(&id).map_err(|e| to_problem(&e))?;
    Ok((StatusCode::ACCEPTED, Json(ctx.reload().status(&id))).into_response())
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::agent::{ServiceApp, ServiceSurface, WorkerContext};
    use crate::backends::InProcessBackend;
    use crate::collaborators::CommandBuildRunner;
    use crate::descriptor::DescriptorStore;
    use crate::runtime::RuntimeSettings;
    use async_trait::async_trait;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    struct Hello;

    #[async_trait]
    impl ServiceApp for Hello {
        async fn build(&self, ctx: &WorkerContext) -> anyhow::Result<ServiceSurface> {
            ctx.link.metric("requests", 7.0);
            Ok(ServiceSurface::new(Router::new().route("/", get(|| async { "hi" }))))
        }
    }

    async fn started() -> Arc<RuntimeContext> {
        let backend = InProcessBackend::new();
        backend.register("api", Arc::new(Hello));
        let store = DescriptorStore::new(
            vec![ServiceDescriptor::new("api", std::env::temp_dir()).with_prefix("/api")],
            None,
        )
        .unwrap();
        let ctx = RuntimeContext::new(
            store,
            Arc::new(backend),
            Arc::new(CommandBuildRunner),
            RuntimeSettings {
                watch: None,
                ..RuntimeSettings::default()
            },
            CancellationToken::new(),
        );
        ctx.start().await.unwrap();
        ctx
    }

    async fn call(ctx: &Arc<RuntimeContext>, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router(ctx.clone())
            .oneshot(
                http::Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn lists_services_and_routes() {
        let ctx = started().await;

        let (status, body) = call(&ctx, "GET", "/api/v1/services").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["id"], "api");
        assert_eq!(body[0]["mount"], "/api");
        assert_eq!(body[0]["worker"]["state"], "ready");
        assert_eq!(body[0]["reload"]["phase"], "idle");
        assert_eq!(body[0]["traffic"]["draining"], false);

        let (status, body) = call(&ctx, "GET", "/api/v1/routes").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["entries"][0]["prefix"], "/api");
        assert_eq!(body["entries"][0]["service_id"], "api");

        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_service_is_404_problem() {
        let ctx = started().await;
        let (status, body) = call(&ctx, "GET", "/api/v1/services/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_FOUND");
        assert_eq!(body["service"], "nope");

        let (status, _) = call(&ctx, "POST", "/api/v1/services/nope/reload").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn manual_restart_replaces_worker() {
        let ctx = started().await;
        let before = ctx.supervisor().current(&"api".into()).unwrap();

        let (status, body) = call(&ctx, "POST", "/api/v1/services/api/restart").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["worker"]["state"], "ready");
        assert_eq!(body["worker"]["restart_count"], 1);
        assert_ne!(body["worker"]["worker_id"], before.worker_id.to_string());
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn worker_metrics_are_exposed() {
        let ctx = started().await;

        let mut latest = serde_json::Value::Null;
        for _ in 0..50 {
            let (status, body) = call(&ctx, "GET", "/api/v1/services/api/metrics").await;
            assert_eq!(status, StatusCode::OK);
            latest = body["latest"].clone();
            if !latest["requests"].is_null() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(latest["requests"], 7.0);
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn reload_is_accepted() {
        let ctx = started().await;
        let (status, _) = call(&ctx, "POST", "/api/v1/services/api/reload").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        ctx.shutdown().await;
    }
}
