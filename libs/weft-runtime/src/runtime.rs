//! Runtime context and control loop
//!
//! [`RuntimeContext`] owns the descriptor store, the supervisor, the mesh, the
//! reload coordinator and the metrics store. A single control loop consumes
//! [`ControlEvent`]s; anything that may suspend for long (restarts, reloads,
//! backoff timers) runs as a tracked task so the loop never blocks.
//!
//! Phase order: control loop → start (topological, one service at a time,
//! routes reconciled after each) → watch → serve → stop (reverse order).

use axum::Router;
use axum::extract::Request;
use axum::response::Response;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::backends::WorkerBackend;
use crate::backends::log_forwarder::emit_log_entry;
use crate::channel::HealthSignal;
use crate::collaborators::BuildRunner;
use crate::descriptor::{DescriptorStore, ServiceId};
use crate::error::{RuntimeError, StartupCause, StartupError};
use crate::events::ControlEvent;
use crate::mesh::{Announcement, Mesh, MeshError, MeshSettings};
use crate::protocol::Message;
use crate::reload::{ReloadCoordinator, ReloadSettings};
use crate::supervisor::{CrashDecision, Supervisor, SupervisorSettings};
use crate::telemetry::MetricsStore;
use crate::watch::{WatchSettings, spawn_watcher, watch_targets};
use crate::worker::{WorkerHandle, WorkerState};

/// Time granted to background tasks after the last worker stopped.
const TASK_DRAIN_MARGIN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub supervisor: SupervisorSettings,
    pub mesh: MeshSettings,
    pub reload: ReloadSettings,
    /// `None` disables source watching altogether.
    pub watch: Option<WatchSettings>,
    /// Shut the runtime down (exit code 1) when an entrypoint, a dependency or a
    /// service with a fatal policy is given up on.
    pub exit_on_fatal: bool,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            supervisor: SupervisorSettings::default(),
            mesh: MeshSettings::default(),
            reload: ReloadSettings::default(),
            watch: Some(WatchSettings::default()),
            exit_on_fatal: true,
        }
    }
}

pub struct RuntimeContext {
    store: Arc<DescriptorStore>,
    supervisor: Arc<Supervisor>,
    mesh: Arc<Mesh>,
    reload: Arc<ReloadCoordinator>,
    metrics: Arc<MetricsStore>,
    settings: RuntimeSettings,
    control: mpsc::UnboundedSender<ControlEvent>,
    events: Mutex<Option<mpsc::UnboundedReceiver<ControlEvent>>>,
    /// Serializes start, restart and reload per service.
    locks: DashMap<ServiceId, Arc<AsyncMutex<()>>>,
    fatal: Mutex<Option<RuntimeError>>,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl RuntimeContext {
    /// Wire a runtime. Nothing starts until [`RuntimeContext::start`].
    ///
    /// Cancelling `cancel` shuts the runtime down; it also cancels in-flight starts.
    #[must_use]
    pub fn new(
        store: DescriptorStore,
        backend: Arc<dyn WorkerBackend>,
        builder: Arc<dyn BuildRunner>,
        settings: RuntimeSettings,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let store = Arc::new(store);
        let (control, events) = mpsc::unbounded_channel();
        let supervisor = Arc::new(Supervisor::new(
            backend,
            settings.supervisor,
            control.clone(),
            cancel.child_token(),
        ));
        let mesh = Arc::new(Mesh::new(store.clone(), settings.mesh));
        let reload = Arc::new(ReloadCoordinator::new(
            settings.reload,
            supervisor.clone(),
            mesh.clone(),
            builder,
        ));

        Arc::new(Self {
            store,
            supervisor,
            mesh,
            reload,
            metrics: Arc::new(MetricsStore::default()),
            settings,
            control,
            events: Mutex::new(Some(events)),
            locks: DashMap::new(),
            fatal: Mutex::new(None),
            tasks: TaskTracker::new(),
            cancel,
        })
    }

    #[must_use]
    pub fn store(&self) -> &Arc<DescriptorStore> {
        &self.store
    }

    #[must_use]
    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    #[must_use]
    pub fn mesh(&self) -> &Arc<Mesh> {
        &self.mesh
    }

    #[must_use]
    pub fn reload(&self) -> &Arc<ReloadCoordinator> {
        &self.reload
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<MetricsStore> {
        &self.metrics
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Start everything, serve until cancelled, then stop everything.
    ///
    /// # Errors
    /// The startup failure or the fatal runtime failure that ended the run.
    pub async fn run(self: &Arc<Self>) -> Result<(), RuntimeError> {
        if let Err(e) = self.start().await {
            self.shutdown().await;
            return match self.fatal.lock().take() {
                Some(fatal) => Err(fatal),
                None if self.cancel.is_cancelled() && is_cancellation(&e) => Ok(()),
                None => Err(e),
            };
        }

        self.cancel.cancelled().await;
        self.shutdown().await;
        match self.fatal.lock().take() {
            Some(fatal) => Err(fatal),
            None => Ok(()),
        }
    }

    /// Start every service in dependency order and publish its routes.
    ///
    /// A service that cannot be brought up within its restart policy aborts
    /// startup only when it is the entrypoint or something depends on it.
    ///
    /// # Errors
    /// `Startup` for a critical service, `RouteConflict` when published routes
    /// collide.
    pub async fn start(self: &Arc<Self>) -> Result<(), RuntimeError> {
        self.spawn_control_loop();

        tracing::info!(services = self.store.len(), "Phase: start");
        for id in self.store.start_order() {
            if self.cancel.is_cancelled() {
                return Err(StartupError::new(id, StartupCause::Cancelled).into());
            }
            match self.start_service(&id).await {
                Ok(handle) => {
                    tracing::info!(
                        service = %id,
                        worker_id = %handle.worker_id,
                        pid = ?handle.process.and_then(|p| p.pid()),
                        "Service ready"
                    );
                }
                Err(e) if self.is_critical(&id) || !matches!(e, RuntimeError::Startup(_)) => {
                    return Err(e);
                }
                Err(e) => {
                    tracing::error!(service = %id, error = %e, "Service failed to start; continuing without it");
                }
            }
        }

        if let Some(settings) = &self.settings.watch {
            let targets = watch_targets(&self.store);
            if !targets.is_empty() {
                tracing::info!("Phase: watch");
                spawn_watcher(
                    targets,
                    settings.clone(),
                    self.control.clone(),
                    self.cancel.child_token(),
                );
            }
        }

        tracing::info!(routes = self.mesh.table().entries().len(), "Phase: serve");
        Ok(())
    }

    /// Stop every worker, dependents first, and wait for background tasks.
    pub async fn shutdown(&self) {
        tracing::info!("Phase: stop");
        self.cancel.cancel();

        let grace = self.supervisor.settings().stop_grace;
        for id in self.store.start_order().into_iter().rev() {
            let Some(handle) = self.supervisor.current(&id) else {
                continue;
            };
            match self.supervisor.stop(&handle, grace).await {
                Ok(()) => tracing::info!(service = %id, "Stopped service"),
                Err(e) => tracing::warn!(service = %id, error = %e, "Failed to stop service"),
            }
        }

        self.tasks.close();
        if tokio::time::timeout(grace + TASK_DRAIN_MARGIN, self.tasks.wait())
            .await
            .is_err()
        {
            tracing::warn!(pending = self.tasks.len(), "Background tasks still running at shutdown");
        }
    }

    /// Route an inbound request through the mesh.
    pub async fn handle(&self, request: Request) -> Response {
        self.mesh.handle(request).await
    }

    /// Call a service directly, with the same dispatch semantics as ingress.
    ///
    /// # Errors
    /// `MeshError` when the service is unknown, not ready, draining or unreachable.
    pub async fn invoke(&self, service: &ServiceId, request: Request) -> Result<Response, MeshError> {
        self.mesh.invoke(service, request).await
    }

    /// Router serving every inbound request through the mesh.
    #[must_use]
    pub fn ingress_router(&self) -> Router {
        self.mesh.ingress_router()
    }

    /// Feed a source change for `service` into the reload coordinator.
    ///
    /// # Errors
    /// `UnknownService` when `service` is not configured.
    pub fn notify_change(&self, service: &ServiceId) -> Result<(), RuntimeError> {
        if !self.store.contains(service) {
            return Err(RuntimeError::UnknownService(service.clone()));
        }
        _ = self.control.send(ControlEvent::ChangeDetected {
            service_id: service.clone(),
        });
        Ok(())
    }

    /// Manual restart, also the way out of a given-up service.
    ///
    /// # Errors
    /// `UnknownService`, `Startup` when the new worker fails, `RouteConflict`
    /// when its routes cannot be published.
    pub async fn request_restart(&self, service: &ServiceId) -> Result<WorkerHandle, RuntimeError> {
        let _serial = self.service_lock(service).lock_owned().await;
        let handle = match self.supervisor.current(service) {
            Some(handle) => self.supervisor.restart(&handle, "manual restart").await?,
            None => {
                let descriptor = self
                    .store
                    .get(service)
                    .cloned()
                    .ok_or_else(|| RuntimeError::UnknownService(service.clone()))?;
                self.supervisor.start(descriptor).await?
            }
        };
        self.publish(service).await?;
        Ok(handle)
    }

    // ------------------------------------------------------------------
    // Startup and recovery
    // ------------------------------------------------------------------

    fn service_lock(&self, service: &ServiceId) -> Arc<AsyncMutex<()>> {
        self.locks.entry(service.clone()).or_default().clone()
    }

    /// Entrypoints and hard dependencies take the runtime down with them.
    fn is_critical(&self, service: &ServiceId) -> bool {
        self.store.is_entrypoint(service) || !self.store.dependents_of(service).is_empty()
    }

    async fn publish(&self, service: &ServiceId) -> Result<(), RuntimeError> {
        let endpoint = self
            .supervisor
            .endpoint(service)
            .ok_or_else(|| RuntimeError::UnknownService(service.clone()))?;
        self.mesh.reconcile(endpoint).await?;
        Ok(())
    }

    async fn start_service(&self, service: &ServiceId) -> Result<WorkerHandle, RuntimeError> {
        let descriptor = self
            .store
            .get(service)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownService(service.clone()))?;
        let _serial = self.service_lock(service).lock_owned().await;

        loop {
            let error = match self.supervisor.start(descriptor.clone()).await {
                Ok(handle) => {
                    self.publish(service).await?;
                    return Ok(handle);
                }
                Err(e) => e,
            };
            if matches!(error.cause, StartupCause::Cancelled) {
                return Err(error.into());
            }
            let Some(CrashDecision::Restart { attempt, after }) =
                self.supervisor.record_startup_failure(service)
            else {
                return Err(error.into());
            };
            tracing::warn!(
                service = %service,
                error = %error,
                attempt,
                retry_in = ?after,
                "Service failed to start, retrying"
            );
            tokio::select! {
                () = self.cancel.cancelled() => {
                    return Err(StartupError::new(service.clone(), StartupCause::Cancelled).into());
                }
                () = tokio::time::sleep(after) => {}
            }
        }
    }

    fn on_crash(&self, service: &ServiceId, worker_id: Uuid, decision: CrashDecision) {
        match decision {
            CrashDecision::Restart { attempt, after } => {
                tracing::info!(service = %service, attempt, restart_in = ?after, "Scheduling restart");
                let control = self.control.clone();
                let cancel = self.cancel.clone();
                let service_id = service.clone();
                self.tasks.spawn(async move {
                    tokio::select! {
                        () = cancel.cancelled() => {}
                        () = tokio::time::sleep(after) => {
                            _ = control.send(ControlEvent::RestartDue {
                                service_id,
                                worker_id,
                                attempt,
                            });
                        }
                    }
                });
            }
            CrashDecision::GiveUp { crashes, fatal } => {
                let last_error = self
                    .supervisor
                    .current(service)
                    .and_then(|handle| handle.last_error)
                    .unwrap_or_default();
                let error = RuntimeError::Crash {
                    service: service.clone(),
                    crashes,
                    last_error,
                };
                if fatal || self.is_critical(service) {
                    self.fail(error);
                } else {
                    tracing::error!(error = %error, "Service given up on; runtime continues degraded");
                }
            }
        }
    }

    async fn recover(&self, service: &ServiceId, worker_id: Uuid, attempt: u32) {
        let _serial = self.service_lock(service).lock_owned().await;
        if self.cancel.is_cancelled() {
            return;
        }
        let Some(handle) = self
            .supervisor
            .current(service)
            .filter(|h| h.worker_id == worker_id && h.state == WorkerState::Crashed)
        else {
            tracing::debug!(service = %service, worker_id = %worker_id, "Crashed worker already replaced");
            return;
        };

        tracing::info!(service = %service, attempt, "Restarting crashed service");
        let restarted = match self.supervisor.restart(&handle, "crash recovery").await {
            Ok(_) => self.publish(service).await,
            Err(e) => Err(e),
        };
        match restarted {
            Ok(()) => tracing::info!(service = %service, attempt, "Service recovered"),
            Err(RuntimeError::RouteConflict(e)) => self.fail(e.into()),
            Err(e) => {
                tracing::warn!(service = %service, attempt, error = %e, "Restart failed");
                if let Some(decision) = self.supervisor.record_startup_failure(service)
                    && let Some(current) = self.supervisor.current(service)
                {
                    self.on_crash(service, current.worker_id, decision);
                }
            }
        }
    }

    fn fail(&self, error: RuntimeError) {
        if !self.settings.exit_on_fatal {
            tracing::error!(error = %error, "Fatal service failure; runtime continues degraded");
            return;
        }
        tracing::error!(error = %error, "Fatal runtime failure, shutting down");
        self.fatal.lock().get_or_insert(error);
        self.cancel.cancel();
    }

    // ------------------------------------------------------------------
    // Control loop
    // ------------------------------------------------------------------

    fn spawn_control_loop(self: &Arc<Self>) {
        let Some(mut events) = self.events.lock().take() else {
            return;
        };
        let ctx = Arc::clone(self);
        self.tasks.spawn(async move {
            loop {
                let event = tokio::select! {
                    () = ctx.cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                ctx.on_event(event);
            }
            tracing::debug!("Control loop stopped");
        });
    }

    fn on_event(self: &Arc<Self>, event: ControlEvent) {
        match event {
            ControlEvent::Message {
                service_id,
                worker_id,
                message,
            } => self.on_message(&service_id, worker_id, message),
            ControlEvent::WorkerExited {
                service_id,
                worker_id,
                exit,
            } => {
                if let Some(decision) = self.supervisor.handle_exit(&service_id, worker_id, &exit) {
                    self.on_crash(&service_id, worker_id, decision);
                }
            }
            ControlEvent::Health {
                service_id,
                worker_id,
                signal,
            } => match signal {
                HealthSignal::Degraded { missed } => {
                    self.supervisor.mark_degraded(&service_id, worker_id, missed);
                }
                HealthSignal::Recovered => self.supervisor.mark_recovered(&service_id, worker_id),
                HealthSignal::Unresponsive { missed } => {
                    if let Some(decision) = self.supervisor.handle_unresponsive(&service_id, worker_id, missed) {
                        self.on_crash(&service_id, worker_id, decision);
                    }
                }
            },
            ControlEvent::RestartDue {
                service_id,
                worker_id,
                attempt,
            } => {
                let ctx = Arc::clone(self);
                self.tasks.spawn(async move {
                    ctx.recover(&service_id, worker_id, attempt).await;
                });
            }
            ControlEvent::ChangeDetected { service_id } => self.on_change(service_id),
            ControlEvent::ReloadDue { service_id, epoch } => self.on_reload_due(service_id, epoch),
        }
    }

    fn on_message(&self, service: &ServiceId, worker_id: Uuid, message: Message) {
        match message {
            Message::RoutesAnnounce {
                mount,
                routes,
                complete,
            } => {
                self.mesh.stage(
                    service,
                    worker_id,
                    Announcement {
                        mount,
                        routes,
                        complete,
                    },
                );
                if complete {
                    match self.mesh.refresh(service, worker_id) {
                        Ok(true) => tracing::info!(service = %service, "Routes re-announced"),
                        Ok(false) => {}
                        Err(e) => {
                            tracing::error!(service = %service, error = %e, "Rejected re-announced routes");
                        }
                    }
                }
            }
            Message::LogEntry {
                level,
                message,
                fields,
            } => emit_log_entry(service, worker_id, level, &message, &fields),
            Message::MetricSample {
                name,
                value,
                labels,
            } => self.metrics.record(service, worker_id, name, value, labels),
            Message::ReloadRequest { reason } => {
                tracing::info!(service = %service, reason = reason.as_deref().unwrap_or("-"), "Worker requested reload");
                self.on_change(service.clone());
            }
            other => {
                tracing::debug!(service = %service, kind = other.kind(), "Ignoring worker message");
            }
        }
    }

    fn on_change(&self, service: ServiceId) {
        if !self.store.contains(&service) {
            tracing::warn!(service = %service, "Change reported for unknown service");
            return;
        }
        let Some(epoch) = self.reload.change_detected(&service) else {
            return;
        };
        let debounce = self.reload.settings().debounce;
        let control = self.control.clone();
        let cancel = self.cancel.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(debounce) => {
                    _ = control.send(ControlEvent::ReloadDue { service_id: service, epoch });
                }
            }
        });
    }

    fn on_reload_due(self: &Arc<Self>, service: ServiceId, epoch: u64) {
        if !self.reload.debounce_elapsed(&service, epoch) {
            return;
        }
        let ctx = Arc::clone(self);
        self.tasks.spawn(async move {
            let serial = ctx.service_lock(&service).lock_owned().await;
            if let Err(RuntimeError::RouteConflict(e)) = ctx.reload.execute(&service).await {
                ctx.fail(e.into());
            }
            drop(serial);
            if ctx.reload.take_pending(&service) {
                _ = ctx.control.send(ControlEvent::ChangeDetected { service_id: service });
            }
        });
    }
}

fn is_cancellation(error: &RuntimeError) -> bool {
    matches!(
        error,
        RuntimeError::Startup(StartupError {
            cause: StartupCause::Cancelled,
            ..
        })
    )
}

/// Serve `router` on `listener` until `cancel` fires.
///
/// # Errors
/// Fails when the server stops with an I/O error.
pub async fn serve(listener: TcpListener, router: Router, cancel: CancellationToken) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "HTTP server listening");
    let shutdown = async move {
        cancel.cancelled().await;
        tracing::info!(%addr, "HTTP server shutting down gracefully (cancellation)");
    };
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| anyhow::anyhow!(e))
}
