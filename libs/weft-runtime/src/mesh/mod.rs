//! Composition Router
//!
//! Maps external request paths onto services and forwards requests to the
//! current worker of each. The routing table is an immutable snapshot swapped
//! atomically; readers never observe a half-updated table.

mod dispatch;
mod gate;
mod table;

pub use dispatch::{DEFAULT_PROXY_TIMEOUT, Dispatch, DispatchError, HttpDispatch, RouterDispatch};
pub use gate::{InflightGuard, TrafficGate};
pub use table::{RouteEntry, RouteMatch, RouteTable, ServiceRoutes, WorkerEndpoint, join_prefix};

use arc_swap::ArcSwap;
use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use http::{HeaderValue, Method, Uri};
use http_body_util::BodyExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::descriptor::{DescriptorStore, ServiceId, normalize_prefix};
use crate::error::RouteConflictError;
use crate::problem::{self, Problem};
use crate::protocol::AnnouncedRoute;
use crate::worker::WorkerState;

/// Header carrying the prefix stripped before forwarding.
pub const X_FORWARDED_PREFIX: &str = "x-forwarded-prefix";

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("no service is mounted at '{path}'")]
    NotFound { path: String },
    #[error("method {method} is not allowed for '{path}'")]
    MethodNotAllowed { method: Method, path: String },
    #[error("unknown service '{0}'")]
    UnknownService(ServiceId),
    #[error("service '{service}' is not available ({state})")]
    ServiceUnavailable {
        service: ServiceId,
        state: WorkerState,
    },
    #[error("service '{service}' is draining")]
    Draining { service: ServiceId },
    #[error("request to service '{service}' failed: {source}")]
    Dispatch {
        service: ServiceId,
        #[source]
        source: DispatchError,
    },
    #[error(transparent)]
    RouteConflict(#[from] RouteConflictError),
}

impl MeshError {
    fn to_problem(&self, retry_after: Duration) -> Problem {
        let detail = self.to_string();
        match self {
            MeshError::NotFound { path } => problem::not_found(detail).with_instance(path.clone()),
            MeshError::MethodNotAllowed { path, .. } => {
                problem::method_not_allowed(detail).with_instance(path.clone())
            }
            MeshError::UnknownService(service) => {
                problem::not_found(detail).with_service(service.to_string())
            }
            MeshError::ServiceUnavailable { service, .. } => {
                problem::service_unavailable(detail).with_service(service.to_string())
            }
            MeshError::Draining { service } => problem::service_unavailable(detail)
                .with_code("SERVICE_DRAINING")
                .with_service(service.to_string())
                .with_retry_after(retry_after),
            MeshError::Dispatch {
                service,
                source: DispatchError::Timeout(_),
            } => problem::gateway_timeout(detail).with_service(service.to_string()),
            MeshError::Dispatch { service, .. } => {
                problem::bad_gateway(detail).with_service(service.to_string())
            }
            MeshError::RouteConflict(_) => problem::conflict(detail),
        }
    }
}

impl IntoResponse for MeshError {
    fn into_response(self) -> Response {
        self.to_problem(DEFAULT_DRAIN_RETRY_AFTER).into_response()
    }
}

const DEFAULT_DRAIN_RETRY_AFTER: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct MeshSettings {
    /// How long to wait for a new worker's route announcement.
    pub reconcile_timeout: Duration,
    /// `Retry-After` advertised while a service drains.
    pub drain_retry_after: Duration,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            reconcile_timeout: Duration::from_secs(5),
            drain_retry_after: DEFAULT_DRAIN_RETRY_AFTER,
        }
    }
}

/// Routes announced by one worker, possibly across several messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Announcement {
    pub mount: Option<String>,
    pub routes: Vec<AnnouncedRoute>,
    pub complete: bool,
}

/// Where a request goes, as decided by the current table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    Service {
        service_id: ServiceId,
        forwarded_path: String,
    },
    MethodNotAllowed,
    NotFound,
}

#[derive(Default)]
struct Registry {
    committed: HashMap<ServiceId, ServiceRoutes>,
    staged: HashMap<(ServiceId, Uuid), Announcement>,
    generation: u64,
}

pub struct Mesh {
    store: Arc<DescriptorStore>,
    table: ArcSwap<RouteTable>,
    /// Serializes table writers; readers only touch `table`.
    registry: Mutex<Registry>,
    staged_changed: Notify,
    gates: DashMap<ServiceId, Arc<TrafficGate>>,
    settings: MeshSettings,
}

impl Mesh {
    #[must_use]
    pub fn new(store: Arc<DescriptorStore>, settings: MeshSettings) -> Self {
        Self {
            store,
            table: ArcSwap::from_pointee(RouteTable::empty()),
            registry: Mutex::new(Registry::default()),
            staged_changed: Notify::new(),
            gates: DashMap::new(),
            settings,
        }
    }

    /// Current routing snapshot.
    #[must_use]
    pub fn table(&self) -> Arc<RouteTable> {
        self.table.load_full()
    }

    /// Traffic gate of a service, created on first use.
    #[must_use]
    pub fn gate(&self, service: &ServiceId) -> Arc<TrafficGate> {
        self.gates
            .entry(service.clone())
            .or_insert_with(TrafficGate::new)
            .clone()
    }

    /// Record a `routes-announce` from a worker. Announcements accumulate until one
    /// is marked complete.
    pub fn stage(&self, service: &ServiceId, worker_id: Uuid, update: Announcement) {
        {
            let mut registry = self.registry.lock();
            let staged = registry
                .staged
                .entry((service.clone(), worker_id))
                .or_default();
            if update.mount.is_some() {
                staged.mount = update.mount;
            }
            staged.routes.extend(update.routes);
            staged.complete |= update.complete;
        }
        self.staged_changed.notify_waiters();
    }

    async fn await_announcement(&self, service: &ServiceId, worker_id: Uuid) -> Option<Announcement> {
        let key = (service.clone(), worker_id);
        let deadline = Instant::now() + self.settings.reconcile_timeout;
        loop {
            let notified = self.staged_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let registry = self.registry.lock();
                if let Some(staged) = registry.staged.get(&key)
                    && staged.complete
                {
                    return Some(staged.clone());
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Publish the routes of a freshly started worker.
    ///
    /// Waits for the worker's complete announcement; a worker that announces
    /// nothing in time is mounted as a catch-all at its default mount.
    ///
    /// # Errors
    /// `RouteConflictError` when the worker's routes collide with another service;
    /// the current table stays in place.
    pub async fn reconcile(&self, endpoint: WorkerEndpoint) -> Result<(), RouteConflictError> {
        let announcement = match self
            .await_announcement(&endpoint.service_id, endpoint.worker_id)
            .await
        {
            Some(announcement) => announcement,
            None => {
                tracing::warn!(
                    service = %endpoint.service_id,
                    worker_id = %endpoint.worker_id,
                    timeout = ?self.settings.reconcile_timeout,
                    "No route announcement received, mounting service as catch-all"
                );
                Announcement {
                    complete: true,
                    ..Announcement::default()
                }
            }
        };
        self.commit(endpoint, &announcement)
    }

    /// Apply a complete announcement from a worker that is already routed.
    ///
    /// Returns `false` when `worker_id` is not the routed worker of `service` or
    /// its staged announcement is not complete yet.
    ///
    /// # Errors
    /// `RouteConflictError` when the new routes collide; the table stays as it was.
    pub fn refresh(&self, service: &ServiceId, worker_id: Uuid) -> Result<bool, RouteConflictError> {
        let (endpoint, announcement) = {
            let registry = self.registry.lock();
            let Some(routes) = registry
                .committed
                .get(service)
                .filter(|routes| routes.endpoint.worker_id == worker_id)
            else {
                return Ok(false);
            };
            let Some(staged) = registry
                .staged
                .get(&(service.clone(), worker_id))
                .filter(|staged| staged.complete)
            else {
                return Ok(false);
            };
            (routes.endpoint.clone(), staged.clone())
        };
        self.commit(endpoint, &announcement)?;
        Ok(true)
    }

    /// Replace one service's routes and swap in the rebuilt table.
    ///
    /// # Errors
    /// `RouteConflictError` when the new routes collide. The table stays as it
    /// was and the worker's staged announcement is discarded.
    pub fn commit(
        &self,
        endpoint: WorkerEndpoint,
        announcement: &Announcement,
    ) -> Result<(), RouteConflictError> {
        let service = endpoint.service_id.clone();
        let worker_id = endpoint.worker_id;
        let entries = self.resolve_entries(&service, announcement);

        let mut registry = self.registry.lock();
        let mut committed = registry.committed.clone();
        committed.insert(
            service.clone(),
            ServiceRoutes {
                endpoint,
                entries,
            },
        );

        let ordered: Vec<ServiceRoutes> = self
            .store
            .ids()
            .iter()
            .filter_map(|id| committed.get(id).cloned())
            .collect();
        let generation = registry.generation + 1;
        let table = match RouteTable::build(&ordered, generation) {
            Ok(table) => table,
            Err(conflict) => {
                registry.staged.remove(&(service, worker_id));
                return Err(conflict);
            }
        };

        self.table.store(Arc::new(table));
        registry.committed = committed;
        registry.generation = generation;
        registry.staged.retain(|(id, _), _| *id != service);
        drop(registry);

        tracing::info!(service = %service, generation, "Route table updated");
        Ok(())
    }

    fn resolve_entries(&self, service: &ServiceId, announcement: &Announcement) -> Vec<RouteEntry> {
        let configured = self.store.get(service).and_then(|d| d.prefix.clone());
        let announced = announcement.mount.as_deref().and_then(|raw| match normalize_prefix(raw) {
            Ok(mount) => Some(mount),
            Err(reason) => {
                tracing::warn!(service = %service, mount = raw, reason, "Ignoring invalid announced mount");
                None
            }
        });
        let mount = configured
            .or(announced)
            .or_else(|| self.store.mount_for(service))
            .unwrap_or_else(|| format!("/{service}"));

        let catch_all = [AnnouncedRoute::catch_all()];
        let routes = if announcement.routes.is_empty() {
            &catch_all[..]
        } else {
            &announcement.routes[..]
        };

        routes
            .iter()
            .map(|route| RouteEntry {
                prefix: join_prefix(&mount, &route.path),
                service_id: service.clone(),
                methods: route.methods.iter().map(|m| m.to_ascii_uppercase()).collect(),
                is_fallback: route.fallback,
                strip_prefix: mount.clone(),
            })
            .collect()
    }

    /// Decide which service a request goes to.
    #[must_use]
    pub fn route(&self, method: &Method, path: &str) -> RouteDecision {
        let table = self.table.load();
        match table.lookup(method, path) {
            RouteMatch::Found {
                entry,
                forwarded_path,
            } => RouteDecision::Service {
                service_id: entry.service_id.clone(),
                forwarded_path,
            },
            RouteMatch::MethodNotAllowed => RouteDecision::MethodNotAllowed,
            RouteMatch::NotFound => RouteDecision::NotFound,
        }
    }

    /// Route and forward an external request. Failures become problem responses.
    pub async fn handle(&self, request: Request) -> Response {
        match self.forward_external(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(error = %e, "Ingress request rejected");
                e.to_problem(self.settings.drain_retry_after).into_response()
            }
        }
    }

    async fn forward_external(&self, request: Request) -> Result<Response, MeshError> {
        let table = self.table.load_full();
        let path = request.uri().path().to_owned();
        let (entry, forwarded_path) = match table.lookup(request.method(), &path) {
            RouteMatch::Found {
                entry,
                forwarded_path,
            } => (entry, forwarded_path),
            RouteMatch::MethodNotAllowed => {
                return Err(MeshError::MethodNotAllowed {
                    method: request.method().clone(),
                    path,
                });
            }
            RouteMatch::NotFound => return Err(MeshError::NotFound { path }),
        };

        let endpoint = table
            .endpoint(&entry.service_id)
            .ok_or_else(|| MeshError::UnknownService(entry.service_id.clone()))?;

        let mut request = request;
        let uri = rewrite_path(request.uri(), &forwarded_path);
        *request.uri_mut() = uri;
        if entry.strip_prefix != "/"
            && let Ok(value) = HeaderValue::from_str(&entry.strip_prefix)
        {
            request.headers_mut().insert(X_FORWARDED_PREFIX, value);
        }

        self.dispatch(endpoint, request).await
    }

    /// Send a request to a service by id; the path is already service-relative.
    ///
    /// # Errors
    /// `UnknownService` when the service has no routed worker, `ServiceUnavailable`
    /// or `Draining` when it cannot take traffic, `Dispatch` when the worker fails.
    pub async fn invoke(&self, service: &ServiceId, request: Request) -> Result<Response, MeshError> {
        let table = self.table.load_full();
        let endpoint = table
            .endpoint(service)
            .ok_or_else(|| MeshError::UnknownService(service.clone()))?;
        self.dispatch(endpoint, request).await
    }

    async fn dispatch(&self, endpoint: &WorkerEndpoint, request: Request) -> Result<Response, MeshError> {
        let service = &endpoint.service_id;
        let state = endpoint.current_state();
        if !state.is_routable() {
            return Err(MeshError::ServiceUnavailable {
                service: service.clone(),
                state,
            });
        }

        let guard = self.gate(service).try_enter().ok_or_else(|| MeshError::Draining {
            service: service.clone(),
        })?;

        let response = endpoint
            .dispatch
            .call(request)
            .await
            .map_err(|source| MeshError::Dispatch {
                service: service.clone(),
                source,
            })?;

        // The request stays in flight until its response body is done.
        Ok(response.map(move |body| {
            Body::new(body.map_frame(move |frame| {
                let _held = &guard;
                frame
            }))
        }))
    }

    /// Axum router sending every request through the mesh.
    pub fn ingress_router(self: &Arc<Self>) -> Router {
        Router::new().fallback(ingress).with_state(self.clone())
    }
}

async fn ingress(State(mesh): State<Arc<Mesh>>, request: Request) -> Response {
    mesh.handle(request).await
}

fn rewrite_path(uri: &Uri, path: &str) -> Uri {
    let path_and_query = match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_owned(),
    };
    Uri::builder()
        .path_and_query(path_and_query)
        .build()
        .unwrap_or_else(|_| uri.clone())
}
