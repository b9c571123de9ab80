//! Process/Worker Supervisor
//!
//! Sole owner and mutator of worker handles. Starts, stops and restarts one
//! worker per service through a [`WorkerBackend`], tracks health, and emits a
//! [`LifecycleEvent`] for every state transition. Crash recovery decisions are
//! made here; scheduling them is left to the control loop.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backends::{LaunchSpec, LaunchedWorker, WorkerBackend, WorkerExit, WorkerTerminator};
use crate::channel::{
    CapabilityChannel, ChannelError, ChannelOptions, HealthOptions, HealthProbe, spawn_health_monitor,
};
use crate::descriptor::{RestartPolicy, ServiceDescriptor, ServiceId};
use crate::error::{RuntimeError, StartupCause, StartupError};
use crate::events::ControlEvent;
use crate::mesh::{DEFAULT_PROXY_TIMEOUT, Dispatch, HttpDispatch, WorkerEndpoint};
use crate::protocol::{Message, Subscription};
use crate::worker::{HealthStatus, LifecycleEvent, ProcessToken, WorkerHandle, WorkerState};

/// Extra time granted to a terminator after the grace period for the forced kill.
const KILL_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    /// Startup timeout for services that do not set their own.
    pub startup_timeout: Duration,
    pub stop_grace: Duration,
    /// Deadline for a process worker's response to a proxied request.
    pub proxy_timeout: Duration,
    pub channel: ChannelOptions,
    pub health: HealthOptions,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(5),
            proxy_timeout: DEFAULT_PROXY_TIMEOUT,
            channel: ChannelOptions::default(),
            health: HealthOptions::default(),
        }
    }
}

/// Outcome of consulting a service's restart policy after a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashDecision {
    Restart { attempt: u32, after: Duration },
    GiveUp { crashes: u32, fatal: bool },
}

/// Crashes counted against a restart policy.
#[derive(Debug, Default, Clone)]
struct CrashCounter {
    crashes: u32,
    ready_since: Option<Instant>,
}

impl CrashCounter {
    fn ready(&mut self) {
        self.ready_since = Some(Instant::now());
    }

    fn interrupted(&mut self) {
        self.ready_since = None;
    }

    /// Count one crash. The count starts over only when the worker stayed
    /// `Ready` for the whole policy window before crashing.
    fn record(&mut self, policy: &RestartPolicy) -> CrashDecision {
        if let Some(since) = self.ready_since.take()
            && since.elapsed() >= policy.window
        {
            self.crashes = 0;
        }
        self.crashes = self.crashes.saturating_add(1);
        if self.crashes > policy.max_restarts {
            CrashDecision::GiveUp {
                crashes: self.crashes,
                fatal: policy.fatal_after_exceeded,
            }
        } else {
            CrashDecision::Restart {
                attempt: self.crashes,
                after: policy.backoff_for(self.crashes),
            }
        }
    }
}

struct Slot {
    descriptor: Arc<ServiceDescriptor>,
    handle: WorkerHandle,
    state: watch::Sender<WorkerState>,
    terminator: Option<Arc<dyn WorkerTerminator>>,
    channel: Option<Arc<CapabilityChannel>>,
    dispatch: Option<Arc<dyn Dispatch>>,
    probe: Arc<HealthProbe>,
    /// Cancels the worker's helper tasks (message pump, health monitor).
    worker_cancel: CancellationToken,
    counter: CrashCounter,
    gave_up: bool,
}

impl Slot {
    fn is_current(&self, worker_id: Uuid) -> bool {
        self.handle.worker_id == worker_id
    }

    fn retire(&mut self) {
        self.worker_cancel.cancel();
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
        self.dispatch = None;
    }
}

/// Read-only view of a service's supervision state.
#[derive(Debug, Clone)]
pub struct ServiceSnapshot {
    pub handle: WorkerHandle,
    pub crashes: u32,
    pub gave_up: bool,
}

struct Handshake {
    channel: Arc<CapabilityChannel>,
    events: mpsc::UnboundedReceiver<Message>,
    listen: Option<SocketAddr>,
}

pub struct Supervisor {
    backend: Arc<dyn WorkerBackend>,
    settings: SupervisorSettings,
    slots: Mutex<HashMap<ServiceId, Slot>>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
    control: mpsc::UnboundedSender<ControlEvent>,
    cancel: CancellationToken,
}

impl Supervisor {
    /// Worker exits, health signals and worker messages are posted to `control`.
    #[must_use]
    pub fn new(
        backend: Arc<dyn WorkerBackend>,
        settings: SupervisorSettings,
        control: mpsc::UnboundedSender<ControlEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let (lifecycle, _) = broadcast::channel(256);
        Self {
            backend,
            settings,
            slots: Mutex::new(HashMap::new()),
            lifecycle,
            control,
            cancel,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Stream of every worker state transition.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }

    /// Start a worker for `descriptor` and wait until it reports ready.
    ///
    /// # Errors
    /// `StartupError` when a worker is already running, the launch fails, the
    /// worker exits or reports failure during startup, the startup timeout
    /// elapses, or the runtime is shutting down. The worker is left `Crashed`
    /// unless startup was cancelled.
    pub async fn start(&self, descriptor: Arc<ServiceDescriptor>) -> Result<WorkerHandle, StartupError> {
        self.start_worker(descriptor, None).await
    }

    async fn start_worker(
        &self,
        descriptor: Arc<ServiceDescriptor>,
        restart_count: Option<u32>,
    ) -> Result<WorkerHandle, StartupError> {
        let service = descriptor.id.clone();
        let (handle, worker_cancel) = self
            .open_slot(&descriptor, restart_count)
            .map_err(|cause| StartupError::new(service.clone(), cause))?;
        let worker_id = handle.worker_id;

        match self.bring_up(&descriptor, worker_id, &worker_cancel).await {
            Ok(handle) => Ok(handle),
            Err(cause) => {
                self.fail_startup(&service, worker_id, &cause);
                Err(StartupError::new(service, cause))
            }
        }
    }

    fn open_slot(
        &self,
        descriptor: &Arc<ServiceDescriptor>,
        restart_count: Option<u32>,
    ) -> Result<(WorkerHandle, CancellationToken), StartupCause> {
        let mut slots = self.slots.lock();
        if slots
            .get(&descriptor.id)
            .is_some_and(|slot| !slot.handle.state.is_terminal())
        {
            return Err(StartupCause::AlreadyRunning);
        }
        let previous = slots.remove(&descriptor.id);

        let restart_count = restart_count
            .or_else(|| previous.as_ref().map(|p| p.handle.restart_count))
            .unwrap_or(0);
        let handle = WorkerHandle::new(descriptor.id.clone(), restart_count);
        let (state, _) = watch::channel(WorkerState::Starting);
        let worker_cancel = self.cancel.child_token();
        let counter = previous.map(|p| p.counter).unwrap_or_default();

        slots.insert(
            descriptor.id.clone(),
            Slot {
                descriptor: descriptor.clone(),
                handle: handle.clone(),
                state,
                terminator: None,
                channel: None,
                dispatch: None,
                probe: Arc::default(),
                worker_cancel: worker_cancel.clone(),
                counter,
                gave_up: false,
            },
        );
        drop(slots);

        _ = self.lifecycle.send(LifecycleEvent {
            service_id: handle.service_id.clone(),
            worker_id: handle.worker_id,
            from: None,
            to: WorkerState::Starting,
            reason: None,
        });
        Ok((handle, worker_cancel))
    }

    async fn bring_up(
        &self,
        descriptor: &ServiceDescriptor,
        worker_id: Uuid,
        worker_cancel: &CancellationToken,
    ) -> Result<WorkerHandle, StartupCause> {
        let service = &descriptor.id;
        let spec = LaunchSpec::for_worker(descriptor, worker_id);
        let launched = tokio::select! {
            biased;
            () = worker_cancel.cancelled() => return Err(StartupCause::Cancelled),
            launched = self.backend.launch(&spec) => launched.map_err(StartupCause::Launch)?,
        };
        let LaunchedWorker {
            process,
            transport,
            exit,
            terminator,
            local_dispatch,
        } = launched;

        self.attach_process(service, worker_id, process, terminator.clone());
        if worker_cancel.is_cancelled() {
            terminator.terminate(Duration::ZERO).await;
            return Err(StartupCause::Cancelled);
        }
        let mut exited = self.watch_exit(service.clone(), worker_id, exit);

        let timeout = descriptor
            .startup_timeout
            .unwrap_or(self.settings.startup_timeout);
        let handshake = tokio::select! {
            biased;
            () = worker_cancel.cancelled() => Err(StartupCause::Cancelled),
            result = tokio::time::timeout(timeout, self.handshake(service, worker_id, transport)) => {
                result.unwrap_or(Err(StartupCause::Timeout(timeout)))
            }
            exit = exited.wait_for(Option::is_some) => {
                let detail = exit.map_or_else(
                    |_| "exit status unavailable".to_owned(),
                    |exit| exit.as_ref().map(ToString::to_string).unwrap_or_default(),
                );
                Err(StartupCause::Exited(detail))
            }
        }?;

        let dispatch: Arc<dyn Dispatch> = match (local_dispatch, handshake.listen) {
            (Some(dispatch), _) => dispatch,
            (None, Some(addr)) => Arc::new(
                HttpDispatch::new(addr)
                    .map_err(|e| StartupCause::Failed(format!("invalid listen address {addr}: {e}")))?
                    .with_timeout(self.settings.proxy_timeout),
            ),
            (None, None) => {
                return Err(StartupCause::Failed(
                    "worker became ready without reporting a listen address".to_owned(),
                ));
            }
        };

        self.promote(service, worker_id, handshake, dispatch)
    }

    async fn handshake(
        &self,
        service: &ServiceId,
        worker_id: Uuid,
        transport: crate::channel::Transport,
    ) -> Result<Handshake, StartupCause> {
        let (channel, mut events) =
            CapabilityChannel::establish(service.clone(), transport, self.settings.channel).await?;
        loop {
            match events.recv().await {
                Some(Message::Ready { listen }) => {
                    return Ok(Handshake {
                        channel,
                        events,
                        listen,
                    });
                }
                Some(Message::StartupFailed { reason }) => return Err(StartupCause::Failed(reason)),
                Some(message) => self.forward(service, worker_id, message),
                None => return Err(ChannelError::Closed.into()),
            }
        }
    }

    fn forward(&self, service: &ServiceId, worker_id: Uuid, message: Message) {
        _ = self.control.send(ControlEvent::Message {
            service_id: service.clone(),
            worker_id,
            message,
        });
    }

    fn attach_process(
        &self,
        service: &ServiceId,
        worker_id: Uuid,
        process: ProcessToken,
        terminator: Arc<dyn WorkerTerminator>,
    ) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(service)
            && slot.is_current(worker_id)
        {
            slot.handle.process = Some(process);
            slot.terminator = Some(terminator);
        }
    }

    /// Deliver the worker's exit to the control loop and expose it for startup.
    fn watch_exit(
        &self,
        service: ServiceId,
        worker_id: Uuid,
        exit: tokio::sync::oneshot::Receiver<WorkerExit>,
    ) -> watch::Receiver<Option<WorkerExit>> {
        let (tx, rx) = watch::channel(None);
        let control = self.control.clone();
        tokio::spawn(async move {
            let exit = exit
                .await
                .unwrap_or_else(|_| WorkerExit::failed("exit notification lost"));
            tx.send_replace(Some(exit.clone()));
            _ = control.send(ControlEvent::WorkerExited {
                service_id: service,
                worker_id,
                exit,
            });
        });
        rx
    }

    fn promote(
        &self,
        service: &ServiceId,
        worker_id: Uuid,
        handshake: Handshake,
        dispatch: Arc<dyn Dispatch>,
    ) -> Result<WorkerHandle, StartupCause> {
        let Handshake {
            channel,
            mut events,
            ..
        } = handshake;

        let (handle, probe, cancel) = {
            let mut slots = self.slots.lock();
            let slot = slots
                .get_mut(service)
                .filter(|slot| slot.is_current(worker_id) && slot.handle.state == WorkerState::Starting)
                .ok_or(StartupCause::Cancelled)?;
            slot.channel = Some(channel.clone());
            slot.dispatch = Some(dispatch);
            slot.counter.ready();
            self.transition(slot, WorkerState::Ready, None);
            (
                slot.handle.clone(),
                slot.probe.clone(),
                slot.worker_cancel.clone(),
            )
        };

        let control = self.control.clone();
        let pump_service = service.clone();
        let pump_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    biased;
                    () = pump_cancel.cancelled() => break,
                    message = events.recv() => message,
                };
                let Some(message) = message else { break };
                let event = ControlEvent::Message {
                    service_id: pump_service.clone(),
                    worker_id,
                    message,
                };
                if control.send(event).is_err() {
                    break;
                }
            }
        });

        let control = self.control.clone();
        let health_service = service.clone();
        spawn_health_monitor(channel, self.settings.health, probe, cancel, move |signal| {
            _ = control.send(ControlEvent::Health {
                service_id: health_service.clone(),
                worker_id,
                signal,
            });
        });

        tracing::info!(
            service = %service,
            worker_id = %worker_id,
            process = ?handle.process,
            startup_ms = millis(handle.uptime()),
            "Worker is ready"
        );
        Ok(handle)
    }

    fn fail_startup(&self, service: &ServiceId, worker_id: Uuid, cause: &StartupCause) {
        let terminator = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(service).filter(|s| s.is_current(worker_id)) else {
                return;
            };
            slot.retire();
            match slot.handle.state {
                WorkerState::Starting => {
                    let reason = cause.to_string();
                    slot.handle.last_error = Some(reason.clone());
                    self.transition(slot, WorkerState::Crashed, Some(reason));
                }
                WorkerState::Stopping => {
                    self.transition(slot, WorkerState::Stopped, Some("stopped during startup".to_owned()));
                }
                _ => {}
            }
            slot.terminator.clone()
        };

        if matches!(cause, StartupCause::Cancelled) {
            tracing::info!(service = %service, worker_id = %worker_id, "Worker startup cancelled");
        } else {
            tracing::error!(service = %service, worker_id = %worker_id, error = %cause, "Worker failed to start");
        }
        if let Some(terminator) = terminator {
            tokio::spawn(async move { terminator.terminate(Duration::ZERO).await });
        }
    }

    /// Count a failed start against the service's restart policy.
    ///
    /// `None` when the service's current worker is not a crashed one.
    pub fn record_startup_failure(&self, service: &ServiceId) -> Option<CrashDecision> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(service)?;
        if slot.handle.state != WorkerState::Crashed {
            return None;
        }
        Some(Self::decide(slot))
    }

    fn decide(slot: &mut Slot) -> CrashDecision {
        let decision = slot.counter.record(&slot.descriptor.restart_policy);
        if let CrashDecision::GiveUp { crashes, fatal } = decision {
            slot.gave_up = true;
            tracing::error!(
                service = %slot.handle.service_id,
                crashes,
                fatal,
                max_restarts = slot.descriptor.restart_policy.max_restarts,
                "Restart limit exceeded, service stays crashed"
            );
        }
        decision
    }

    /// Stop a worker: ask it to shut down, wait up to `grace`, then force it.
    ///
    /// Idempotent: stopping a stopped, crashed or already replaced worker succeeds.
    ///
    /// # Errors
    /// `UnknownService` when the service was never started.
    pub async fn stop(&self, handle: &WorkerHandle, grace: Duration) -> Result<(), RuntimeError> {
        enum Step {
            Done,
            Wait(watch::Receiver<WorkerState>),
            Terminate {
                channel: Option<Arc<CapabilityChannel>>,
                terminator: Option<Arc<dyn WorkerTerminator>>,
            },
        }

        let step = {
            let mut slots = self.slots.lock();
            let slot = slots
                .get_mut(&handle.service_id)
                .ok_or_else(|| RuntimeError::UnknownService(handle.service_id.clone()))?;
            if !slot.is_current(handle.worker_id) {
                return Ok(());
            }
            match slot.handle.state {
                WorkerState::Stopped => Step::Done,
                WorkerState::Stopping => Step::Wait(slot.state.subscribe()),
                WorkerState::Crashed => {
                    self.transition(slot, WorkerState::Stopped, None);
                    Step::Done
                }
                WorkerState::Starting | WorkerState::Ready | WorkerState::Degraded => {
                    self.transition(slot, WorkerState::Stopping, Some("stop requested".to_owned()));
                    slot.counter.interrupted();
                    slot.worker_cancel.cancel();
                    slot.dispatch = None;
                    let channel = slot.channel.take();
                    let terminator = slot.terminator.clone();
                    Step::Terminate {
                        channel,
                        terminator,
                    }
                }
            }
        };

        match step {
            Step::Done => {}
            Step::Wait(mut state) => {
                let wait = state.wait_for(|s| *s == WorkerState::Stopped);
                _ = tokio::time::timeout(grace + KILL_WAIT, wait).await;
            }
            Step::Terminate {
                channel,
                terminator,
            } => {
                if let Some(channel) = &channel {
                    _ = channel.notify(Message::ShutdownRequest {
                        grace_ms: millis(grace),
                    });
                }
                if let Some(terminator) = terminator {
                    let terminate = terminator.terminate(grace);
                    if tokio::time::timeout(grace + KILL_WAIT, terminate).await.is_err() {
                        tracing::warn!(service = %handle.service_id, "Worker did not terminate in time");
                    }
                }
                if let Some(channel) = channel {
                    channel.close();
                }
                let mut slots = self.slots.lock();
                if let Some(slot) = slots.get_mut(&handle.service_id)
                    && slot.is_current(handle.worker_id)
                {
                    self.transition(slot, WorkerState::Stopped, None);
                }
            }
        }
        Ok(())
    }

    /// Replace a worker with a fresh one. A service that exhausted its restart
    /// policy gets a clean crash count.
    ///
    /// # Errors
    /// `StaleHandle` when `handle` is not the current worker, `Startup` when the
    /// replacement fails to start.
    pub async fn restart(&self, handle: &WorkerHandle, reason: &str) -> Result<WorkerHandle, RuntimeError> {
        let (descriptor, restart_count, running) = {
            let mut slots = self.slots.lock();
            let slot = slots
                .get_mut(&handle.service_id)
                .ok_or_else(|| RuntimeError::UnknownService(handle.service_id.clone()))?;
            if !slot.is_current(handle.worker_id) {
                return Err(RuntimeError::StaleHandle {
                    service: handle.service_id.clone(),
                    worker_id: handle.worker_id,
                });
            }
            if slot.gave_up {
                slot.gave_up = false;
                slot.counter = CrashCounter::default();
            }
            (
                slot.descriptor.clone(),
                slot.handle.restart_count.saturating_add(1),
                !slot.handle.state.is_terminal(),
            )
        };

        tracing::info!(
            service = %handle.service_id,
            worker_id = %handle.worker_id,
            restart_count,
            reason,
            "Restarting worker"
        );
        if running {
            self.stop(handle, self.settings.stop_grace).await?;
        }
        Ok(self.start_worker(descriptor, Some(restart_count)).await?)
    }

    /// React to a worker exit. Returns a decision only for unexpected exits of
    /// the current worker.
    pub fn handle_exit(&self, service: &ServiceId, worker_id: Uuid, exit: &WorkerExit) -> Option<CrashDecision> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(service).filter(|s| s.is_current(worker_id))?;
        if !matches!(slot.handle.state, WorkerState::Ready | WorkerState::Degraded) {
            return None;
        }
        let reason = format!("worker exited unexpectedly ({exit})");
        tracing::warn!(service = %service, worker_id = %worker_id, exit = %exit, "Worker crashed");
        slot.handle.last_error = Some(reason.clone());
        slot.retire();
        self.transition(slot, WorkerState::Crashed, Some(reason));
        Some(Self::decide(slot))
    }

    /// Treat a worker that stopped answering pings as crashed and kill it.
    pub fn handle_unresponsive(&self, service: &ServiceId, worker_id: Uuid, missed: u32) -> Option<CrashDecision> {
        let (decision, terminator) = {
            let mut slots = self.slots.lock();
            let slot = slots.get_mut(service).filter(|s| s.is_current(worker_id))?;
            if !matches!(slot.handle.state, WorkerState::Ready | WorkerState::Degraded) {
                return None;
            }
            let reason = format!("unresponsive after {missed} missed health pings");
            tracing::error!(service = %service, worker_id = %worker_id, missed, "Worker unresponsive");
            slot.handle.last_error = Some(reason.clone());
            slot.retire();
            self.transition(slot, WorkerState::Crashed, Some(reason));
            (Self::decide(slot), slot.terminator.clone())
        };
        if let Some(terminator) = terminator {
            tokio::spawn(async move { terminator.terminate(Duration::ZERO).await });
        }
        Some(decision)
    }

    /// Give up on a worker that cannot be brought back, e.g. after a failed
    /// rebuild: mark it crashed and kill it. Not counted against the policy.
    pub fn abandon(&self, handle: &WorkerHandle, reason: &str) {
        let terminator = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots
                .get_mut(&handle.service_id)
                .filter(|s| s.is_current(handle.worker_id))
            else {
                return;
            };
            if !matches!(
                slot.handle.state,
                WorkerState::Starting | WorkerState::Ready | WorkerState::Degraded
            ) {
                return;
            }
            slot.handle.last_error = Some(reason.to_owned());
            slot.retire();
            self.transition(slot, WorkerState::Crashed, Some(reason.to_owned()));
            slot.terminator.clone()
        };
        if let Some(terminator) = terminator {
            let grace = self.settings.stop_grace;
            tokio::spawn(async move { terminator.terminate(grace).await });
        }
    }

    pub fn mark_degraded(&self, service: &ServiceId, worker_id: Uuid, missed: u32) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(service).filter(|s| s.is_current(worker_id))
            && slot.handle.state == WorkerState::Ready
        {
            slot.counter.interrupted();
            self.transition(
                slot,
                WorkerState::Degraded,
                Some(format!("{missed} missed health pings")),
            );
        }
    }

    pub fn mark_recovered(&self, service: &ServiceId, worker_id: Uuid) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(service).filter(|s| s.is_current(worker_id))
            && slot.handle.state == WorkerState::Degraded
        {
            slot.counter.ready();
            self.transition(slot, WorkerState::Ready, Some("health restored".to_owned()));
        }
    }

    fn transition(&self, slot: &mut Slot, to: WorkerState, reason: Option<String>) {
        let from = slot.handle.state;
        if !from.can_transition_to(to) {
            tracing::debug!(
                service = %slot.handle.service_id,
                from = %from,
                to = %to,
                "Ignoring invalid worker transition"
            );
            return;
        }
        slot.handle.state = to;
        slot.state.send_replace(to);
        tracing::debug!(
            service = %slot.handle.service_id,
            worker_id = %slot.handle.worker_id,
            from = %from,
            to = %to,
            reason = reason.as_deref().unwrap_or(""),
            "Worker state changed"
        );
        _ = self.lifecycle.send(LifecycleEvent {
            service_id: slot.handle.service_id.clone(),
            worker_id: slot.handle.worker_id,
            from: Some(from),
            to,
            reason,
        });
    }

    /// Health of the worker behind `handle`.
    ///
    /// # Errors
    /// `UnknownService` or `StaleHandle` when `handle` is not the current worker.
    pub fn health(&self, handle: &WorkerHandle) -> Result<HealthStatus, RuntimeError> {
        let slots = self.slots.lock();
        let slot = slots
            .get(&handle.service_id)
            .ok_or_else(|| RuntimeError::UnknownService(handle.service_id.clone()))?;
        if !slot.is_current(handle.worker_id) {
            return Err(RuntimeError::StaleHandle {
                service: handle.service_id.clone(),
                worker_id: handle.worker_id,
            });
        }
        Ok(HealthStatus {
            state: slot.handle.state,
            missed_pings: slot.probe.missed(),
            last_pong_ago_ms: slot.probe.last_pong().map(|at| millis(at.elapsed())),
            uptime_ms: millis(slot.handle.uptime()),
            restart_count: slot.handle.restart_count,
        })
    }

    fn current_channel(&self, handle: &WorkerHandle) -> Result<Arc<CapabilityChannel>, RuntimeError> {
        let slots = self.slots.lock();
        let slot = slots
            .get(&handle.service_id)
            .ok_or_else(|| RuntimeError::UnknownService(handle.service_id.clone()))?;
        if !slot.is_current(handle.worker_id) {
            return Err(RuntimeError::StaleHandle {
                service: handle.service_id.clone(),
                worker_id: handle.worker_id,
            });
        }
        slot.channel.clone().ok_or(RuntimeError::Channel(ChannelError::Closed))
    }

    /// Send a message to a worker and wait for its reply.
    ///
    /// # Errors
    /// `StaleHandle` for a replaced worker, `Channel` on timeout or closed channel.
    pub async fn send(&self, handle: &WorkerHandle, message: Message) -> Result<Message, RuntimeError> {
        let channel = self.current_channel(handle)?;
        Ok(channel.send(message).wait().await?)
    }

    /// Register a handler for every message the worker sends.
    ///
    /// # Errors
    /// `StaleHandle` for a replaced worker, `Channel` when it has no open channel.
    pub fn on_message<F>(&self, handle: &WorkerHandle, handler: F) -> Result<(), RuntimeError>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.current_channel(handle)?.on_message(handler);
        Ok(())
    }

    /// Send `message` to every live worker subscribed to `topic`. Returns how many
    /// workers it was queued for.
    pub fn notify_subscribers(&self, topic: Subscription, message: &Message) -> usize {
        let channels: Vec<Arc<CapabilityChannel>> = self
            .slots
            .lock()
            .values()
            .filter_map(|slot| slot.channel.clone())
            .filter(|channel| channel.is_subscribed(topic))
            .collect();
        channels
            .iter()
            .filter(|channel| channel.notify(message.clone()).is_ok())
            .count()
    }

    /// Dispatch target and live state of the service's current worker.
    #[must_use]
    pub fn endpoint(&self, service: &ServiceId) -> Option<WorkerEndpoint> {
        let slots = self.slots.lock();
        let slot = slots.get(service)?;
        Some(WorkerEndpoint {
            service_id: service.clone(),
            worker_id: slot.handle.worker_id,
            dispatch: slot.dispatch.clone()?,
            state: slot.state.subscribe(),
        })
    }

    /// Descriptor the service's current worker was started from.
    #[must_use]
    pub fn descriptor(&self, service: &ServiceId) -> Option<Arc<ServiceDescriptor>> {
        self.slots.lock().get(service).map(|slot| slot.descriptor.clone())
    }

    #[must_use]
    pub fn current(&self, service: &ServiceId) -> Option<WorkerHandle> {
        self.slots.lock().get(service).map(|slot| slot.handle.clone())
    }

    #[must_use]
    pub fn snapshot(&self, service: &ServiceId) -> Option<ServiceSnapshot> {
        self.slots.lock().get(service).map(|slot| ServiceSnapshot {
            handle: slot.handle.clone(),
            crashes: slot.counter.crashes,
            gave_up: slot.gave_up,
        })
    }

    /// Handles of every service that was ever started.
    #[must_use]
    pub fn handles(&self) -> Vec<WorkerHandle> {
        self.slots
            .lock()
            .values()
            .map(|slot| slot.handle.clone())
            .collect()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::agent::{ServiceApp, ServiceSurface, WorkerContext};
    use crate::backends::InProcessBackend;
    use anyhow::{Result, bail};
    use async_trait::async_trait;
    use axum::Router;

    struct Healthy;

    #[async_trait]
    impl ServiceApp for Healthy {
        async fn build(&self, _ctx: &WorkerContext) -> Result<ServiceSurface> {
            Ok(ServiceSurface::new(Router::new()))
        }
    }

    struct BrokenBuild;

    #[async_trait]
    impl ServiceApp for BrokenBuild {
        async fn build(&self, _ctx: &WorkerContext) -> Result<ServiceSurface> {
            bail!("missing configuration")
        }
    }

    struct NeverReady;

    #[async_trait]
    impl ServiceApp for NeverReady {
        async fn build(&self, _ctx: &WorkerContext) -> Result<ServiceSurface> {
            std::future::pending().await
        }
    }

    struct DiesAfterReady;

    #[async_trait]
    impl ServiceApp for DiesAfterReady {
        async fn build(&self, _ctx: &WorkerContext) -> Result<ServiceSurface> {
            Ok(ServiceSurface::new(Router::new()))
        }

        async fn run(&self, _ctx: &WorkerContext) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            bail!("lost database connection")
        }
    }

    fn supervisor(
        apps: Vec<(&str, Arc<dyn ServiceApp>)>,
    ) -> (Supervisor, mpsc::UnboundedReceiver<ControlEvent>) {
        let backend = InProcessBackend::new();
        for (id, app) in apps {
            backend.register(id, app);
        }
        let (control, events) = mpsc::unbounded_channel();
        let supervisor = Supervisor::new(
            Arc::new(backend),
            SupervisorSettings {
                startup_timeout: Duration::from_secs(2),
                stop_grace: Duration::from_millis(200),
                ..SupervisorSettings::default()
            },
            control,
            CancellationToken::new(),
        );
        (supervisor, events)
    }

    fn descriptor(id: &str) -> Arc<ServiceDescriptor> {
        Arc::new(ServiceDescriptor::new(id, std::env::temp_dir()))
    }

    #[tokio::test]
    async fn start_reaches_ready_and_emits_transitions() {
        let (supervisor, _events) = supervisor(vec![("api", Arc::new(Healthy))]);
        let mut lifecycle = supervisor.subscribe();

        let handle = supervisor.start(descriptor("api")).await.unwrap();
        assert_eq!(handle.state, WorkerState::Ready);
        assert_eq!(handle.restart_count, 0);
        assert!(supervisor.endpoint(&"api".into()).is_some());

        let first = lifecycle.recv().await.unwrap();
        assert_eq!((first.from, first.to), (None, WorkerState::Starting));
        let second = lifecycle.recv().await.unwrap();
        assert_eq!(
            (second.from, second.to),
            (Some(WorkerState::Starting), WorkerState::Ready)
        );
    }

    #[tokio::test]
    async fn second_start_while_running_is_refused() {
        let (supervisor, _events) = supervisor(vec![("api", Arc::new(Healthy))]);
        supervisor.start(descriptor("api")).await.unwrap();
        let err = supervisor.start(descriptor("api")).await.unwrap_err();
        assert!(matches!(err.cause, StartupCause::AlreadyRunning));
        assert_eq!(
            supervisor.current(&"api".into()).unwrap().state,
            WorkerState::Ready
        );
    }

    #[tokio::test]
    async fn reported_failure_leaves_worker_crashed() {
        let (supervisor, _events) = supervisor(vec![("api", Arc::new(BrokenBuild))]);
        let err = supervisor.start(descriptor("api")).await.unwrap_err();
        assert_eq!(err.service.as_str(), "api");
        // Either the failure report or the exit that follows it wins the race.
        assert!(matches!(err.cause, StartupCause::Failed(_) | StartupCause::Exited(_)));
        assert!(err.to_string().contains("missing configuration"));
        let current = supervisor.current(&"api".into()).unwrap();
        assert_eq!(current.state, WorkerState::Crashed);
        assert!(current.last_error.is_some());
        assert!(matches!(
            supervisor.record_startup_failure(&"api".into()),
            Some(CrashDecision::Restart { attempt: 1, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn startup_timeout_is_enforced() {
        let (supervisor, _events) = supervisor(vec![("slow", Arc::new(NeverReady))]);
        let err = supervisor.start(descriptor("slow")).await.unwrap_err();
        assert!(matches!(err.cause, StartupCause::Timeout(t) if t == Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (supervisor, _events) = supervisor(vec![("api", Arc::new(Healthy))]);
        let handle = supervisor.start(descriptor("api")).await.unwrap();

        supervisor.stop(&handle, Duration::from_secs(1)).await.unwrap();
        supervisor.stop(&handle, Duration::from_secs(1)).await.unwrap();
        assert_eq!(
            supervisor.current(&"api".into()).unwrap().state,
            WorkerState::Stopped
        );
        assert!(supervisor.endpoint(&"api".into()).is_none());
    }

    #[tokio::test]
    async fn restart_replaces_handle_and_rejects_stale_one() {
        let (supervisor, _events) = supervisor(vec![("api", Arc::new(Healthy))]);
        let first = supervisor.start(descriptor("api")).await.unwrap();

        let second = supervisor.restart(&first, "manual").await.unwrap();
        assert_ne!(first.worker_id, second.worker_id);
        assert_eq!(second.restart_count, 1);
        assert_eq!(second.state, WorkerState::Ready);

        assert!(matches!(
            supervisor.restart(&first, "again").await,
            Err(RuntimeError::StaleHandle { .. })
        ));
        assert!(matches!(
            supervisor.health(&first),
            Err(RuntimeError::StaleHandle { .. })
        ));
        let health = supervisor.health(&second).unwrap();
        assert_eq!(health.state, WorkerState::Ready);
        assert_eq!(health.restart_count, 1);
    }

    #[tokio::test]
    async fn unexpected_exit_is_reported_as_crash() {
        let (supervisor, mut events) = supervisor(vec![("api", Arc::new(DiesAfterReady))]);
        let handle = supervisor.start(descriptor("api")).await.unwrap();

        let exit = loop {
            match events.recv().await.unwrap() {
                ControlEvent::WorkerExited {
                    worker_id, exit, ..
                } if worker_id == handle.worker_id => break exit,
                _ => {}
            }
        };
        let decision = supervisor.handle_exit(&"api".into(), handle.worker_id, &exit);
        assert_eq!(
            decision,
            Some(CrashDecision::Restart {
                attempt: 1,
                after: Duration::from_secs(5),
            })
        );
        assert_eq!(
            supervisor.current(&"api".into()).unwrap().state,
            WorkerState::Crashed
        );
        // A second notification for the same worker is ignored.
        assert_eq!(supervisor.handle_exit(&"api".into(), handle.worker_id, &exit), None);
    }

    #[tokio::test]
    async fn degraded_and_recovered_follow_health() {
        let (supervisor, _events) = supervisor(vec![("api", Arc::new(Healthy))]);
        let handle = supervisor.start(descriptor("api")).await.unwrap();
        let endpoint = supervisor.endpoint(&"api".into()).unwrap();

        supervisor.mark_degraded(&"api".into(), handle.worker_id, 3);
        assert_eq!(endpoint.current_state(), WorkerState::Degraded);
        supervisor.mark_recovered(&"api".into(), handle.worker_id);
        assert_eq!(endpoint.current_state(), WorkerState::Ready);

        let decision = supervisor.handle_unresponsive(&"api".into(), handle.worker_id, 9);
        assert!(matches!(decision, Some(CrashDecision::Restart { .. })));
        assert_eq!(endpoint.current_state(), WorkerState::Crashed);
    }

    #[tokio::test(start_paused = true)]
    async fn crash_counter_gives_up_after_max_restarts() {
        let policy = RestartPolicy {
            max_restarts: 3,
            window: Duration::from_secs(10),
            backoff: Duration::from_millis(100),
            ..RestartPolicy::default()
        };
        let mut counter = CrashCounter::default();
        for attempt in 1..=3 {
            counter.ready();
            tokio::time::advance(Duration::from_secs(1)).await;
            assert_eq!(
                counter.record(&policy),
                CrashDecision::Restart {
                    attempt,
                    after: Duration::from_millis(100),
                }
            );
        }
        counter.ready();
        assert_eq!(
            counter.record(&policy),
            CrashDecision::GiveUp {
                crashes: 4,
                fatal: false,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn crash_counter_resets_after_full_window_ready() {
        let policy = RestartPolicy {
            max_restarts: 1,
            window: Duration::from_secs(10),
            ..RestartPolicy::default()
        };
        let mut counter = CrashCounter::default();
        counter.ready();
        assert!(matches!(counter.record(&policy), CrashDecision::Restart { attempt: 1, .. }));

        counter.ready();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(matches!(counter.record(&policy), CrashDecision::Restart { attempt: 1, .. }));

        // An interruption before the window ends keeps the count.
        counter.ready();
        tokio::time::advance(Duration::from_secs(9)).await;
        counter.interrupted();
        assert!(matches!(counter.record(&policy), CrashDecision::GiveUp { crashes: 2, .. }));
    }
}
