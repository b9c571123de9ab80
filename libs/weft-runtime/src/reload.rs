//! Reload Coordinator
//!
//! Per-service state machine `Idle -> ChangeDetected -> Draining -> Restarting
//! -> Reconciling -> Idle`. Bursts of changes are coalesced by a debounce; the
//! restart happens behind a drained traffic gate and the gate reopens only after
//! the new worker's routes are swapped in.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::collaborators::BuildRunner;
use crate::descriptor::ServiceId;
use crate::error::RuntimeError;
use crate::mesh::{Mesh, TrafficGate};
use crate::protocol::{Message, Subscription};
use crate::supervisor::Supervisor;
use crate::worker::WorkerHandle;

#[derive(Debug, Clone, Copy)]
pub struct ReloadSettings {
    /// Quiet period that closes a burst of changes.
    pub debounce: Duration,
    /// How long in-flight requests may take to finish once draining starts.
    pub drain_grace: Duration,
}

impl Default for ReloadSettings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(300),
            drain_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadPhase {
    #[default]
    Idle,
    ChangeDetected,
    Draining,
    Restarting,
    Reconciling,
}

/// Emitted after a successful reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionChanged {
    pub service_id: ServiceId,
    pub version: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReloadStatus {
    pub phase: ReloadPhase,
    pub version: u64,
    /// Set when the last reload failed; cleared by the next successful one.
    pub last_failure: Option<String>,
}

#[derive(Debug, Default)]
struct ReloadState {
    status: ReloadStatus,
    epoch: u64,
    /// A change arrived while a reload was running.
    pending: bool,
}

pub struct ReloadCoordinator {
    settings: ReloadSettings,
    supervisor: Arc<Supervisor>,
    mesh: Arc<Mesh>,
    builder: Arc<dyn BuildRunner>,
    states: Mutex<HashMap<ServiceId, ReloadState>>,
    versions: broadcast::Sender<VersionChanged>,
}

impl ReloadCoordinator {
    #[must_use]
    pub fn new(
        settings: ReloadSettings,
        supervisor: Arc<Supervisor>,
        mesh: Arc<Mesh>,
        builder: Arc<dyn BuildRunner>,
    ) -> Self {
        let (versions, _) = broadcast::channel(64);
        Self {
            settings,
            supervisor,
            mesh,
            builder,
            states: Mutex::new(HashMap::new()),
            versions,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &ReloadSettings {
        &self.settings
    }

    /// Record a change. Returns the epoch to debounce, or `None` when a reload
    /// is already running (the change is replayed once it finishes).
    pub fn change_detected(&self, service: &ServiceId) -> Option<u64> {
        let mut states = self.states.lock();
        let state = states.entry(service.clone()).or_default();
        match state.status.phase {
            ReloadPhase::Idle | ReloadPhase::ChangeDetected => {
                state.status.phase = ReloadPhase::ChangeDetected;
                state.epoch += 1;
                tracing::debug!(service = %service, epoch = state.epoch, "Change detected");
                Some(state.epoch)
            }
            _ => {
                state.pending = true;
                None
            }
        }
    }

    /// Whether `epoch` closes the current burst; if so the reload begins.
    pub fn debounce_elapsed(&self, service: &ServiceId, epoch: u64) -> bool {
        let mut states = self.states.lock();
        let Some(state) = states.get_mut(service) else {
            return false;
        };
        if state.status.phase != ReloadPhase::ChangeDetected || state.epoch != epoch {
            return false;
        }
        state.status.phase = ReloadPhase::Draining;
        true
    }

    /// Consume the change recorded while the last reload was running.
    pub fn take_pending(&self, service: &ServiceId) -> bool {
        self.states
            .lock()
            .get_mut(service)
            .is_some_and(|state| std::mem::take(&mut state.pending))
    }

    fn set_phase(&self, service: &ServiceId, phase: ReloadPhase) {
        self.states
            .lock()
            .entry(service.clone())
            .or_default()
            .status
            .phase = phase;
        tracing::debug!(service = %service, phase = ?phase, "Reload phase");
    }

    #[must_use]
    pub fn status(&self, service: &ServiceId) -> ReloadStatus {
        self.states
            .lock()
            .get(service)
            .map(|state| state.status.clone())
            .unwrap_or_default()
    }

    /// Stream of successful reloads, for hot-update consumers.
    #[must_use]
    pub fn subscribe_versions(&self) -> broadcast::Receiver<VersionChanged> {
        self.versions.subscribe()
    }

    /// Drain, rebuild, restart and reconcile `service`.
    ///
    /// Draining always ends, whatever the outcome. A failed reload leaves the
    /// service crashed and is not retried.
    ///
    /// # Errors
    /// `UnknownService` when the service never ran, `Build` when its build
    /// fails, `Startup` when the new worker does not come up, `RouteConflict`
    /// when its routes cannot be published.
    pub async fn execute(&self, service: &ServiceId) -> Result<WorkerHandle, RuntimeError> {
        let gate = self.mesh.gate(service);
        self.set_phase(service, ReloadPhase::Draining);
        gate.begin_drain();
        let result = self.cycle(service, &gate).await;
        gate.end_drain();

        let mut states = self.states.lock();
        let state = states.entry(service.clone()).or_default();
        state.status.phase = ReloadPhase::Idle;
        match &result {
            Ok(handle) => {
                state.status.version += 1;
                state.status.last_failure = None;
                let version = state.status.version;
                drop(states);

                tracing::info!(service = %service, worker_id = %handle.worker_id, version, "Service reloaded");
                _ = self.versions.send(VersionChanged {
                    service_id: service.clone(),
                    version,
                });
                let notified = self.supervisor.notify_subscribers(
                    Subscription::VersionChanged,
                    &Message::VersionChanged {
                        service_id: service.to_string(),
                        version,
                    },
                );
                tracing::debug!(service = %service, version, notified, "Version change announced");
            }
            Err(e) => {
                state.status.last_failure = Some(e.to_string());
                drop(states);
                tracing::error!(service = %service, error = %e, "Reload failed; manual restart required");
            }
        }
        result
    }

    async fn cycle(&self, service: &ServiceId, gate: &TrafficGate) -> Result<WorkerHandle, RuntimeError> {
        if !gate.wait_idle(self.settings.drain_grace).await {
            tracing::warn!(
                service = %service,
                inflight = gate.inflight(),
                grace = ?self.settings.drain_grace,
                "Drain grace elapsed with requests still in flight"
            );
        }

        let handle = self
            .supervisor
            .current(service)
            .ok_or_else(|| RuntimeError::UnknownService(service.clone()))?;
        let descriptor = self
            .supervisor
            .descriptor(service)
            .ok_or_else(|| RuntimeError::UnknownService(service.clone()))?;

        self.set_phase(service, ReloadPhase::Restarting);
        if let Err(e) = self.builder.build(&descriptor).await {
            self.supervisor.abandon(&handle, &e.to_string());
            return Err(e.into());
        }
        let handle = self.supervisor.restart(&handle, "source changed").await?;

        self.set_phase(service, ReloadPhase::Reconciling);
        let endpoint = self
            .supervisor
            .endpoint(service)
            .ok_or_else(|| RuntimeError::UnknownService(service.clone()))?;
        self.mesh.reconcile(endpoint).await?;
        Ok(handle)
    }
}
