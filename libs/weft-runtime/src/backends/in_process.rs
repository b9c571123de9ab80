//! In-process backend
//!
//! Runs registered [`ServiceApp`]s as tokio tasks behind an in-memory channel.
//! Requests are dispatched straight into the app's router.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use super::{BackendKind, LaunchSpec, LaunchedWorker, WorkerBackend, WorkerExit, WorkerTerminator};
use crate::agent::{AgentConfig, Serve, ServiceApp, run_agent};
use crate::channel::Transport;
use crate::descriptor::ServiceId;
use crate::mesh::RouterDispatch;
use crate::worker::ProcessToken;

struct TaskTerminator {
    done: CancellationToken,
    abort: AbortHandle,
}

#[async_trait]
impl WorkerTerminator for TaskTerminator {
    async fn terminate(&self, grace: Duration) {
        if tokio::time::timeout(grace, self.done.cancelled()).await.is_err() {
            tracing::warn!("In-process worker ignored shutdown, aborting task");
            self.abort.abort();
            self.done.cancelled().await;
        }
    }
}

/// Backend hosting services inside the runtime's own process.
#[derive(Default)]
pub struct InProcessBackend {
    apps: DashMap<ServiceId, Arc<dyn ServiceApp>>,
    next_task: AtomicU64,
}

impl InProcessBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the app that serves `service`; replaces any previous registration.
    pub fn register(&self, service: impl Into<ServiceId>, app: Arc<dyn ServiceApp>) {
        self.apps.insert(service.into(), app);
    }
}

#[async_trait]
impl WorkerBackend for InProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::InProcess
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedWorker> {
        let app = self
            .apps
            .get(&spec.service_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| anyhow!("no in-process app registered for '{}'", spec.service_id))?;

        let task_id = self.next_task.fetch_add(1, Ordering::Relaxed) + 1;
        let (host_side, worker_side) = Transport::pair();
        let dispatch = RouterDispatch::new();
        let config = AgentConfig {
            service_id: spec.service_id.to_string(),
            worker_id: spec.worker_id.to_string(),
            pid: None,
            serve: Serve::Local(dispatch.clone()),
        };

        let agent = tokio::spawn(run_agent(app, worker_side, config));
        let abort = agent.abort_handle();

        let (exit_tx, exit_rx) = oneshot::channel();
        let done = CancellationToken::new();
        let finished = done.clone();
        let service = spec.service_id.clone();
        tokio::spawn(async move {
            let exit = match agent.await {
                Ok(Ok(())) => WorkerExit::code(0),
                Ok(Err(e)) => WorkerExit {
                    code: Some(1),
                    signal: None,
                    detail: Some(format!("{e:#}")),
                },
                Err(e) if e.is_cancelled() => WorkerExit::failed("aborted"),
                Err(e) => WorkerExit::failed(panic_message(&*e.into_panic())),
            };
            tracing::debug!(service = %service, task_id, exit = %exit, "In-process worker finished");
            _ = exit_tx.send(exit);
            finished.cancel();
        });

        tracing::info!(
            service = %spec.service_id,
            worker_id = %spec.worker_id,
            task_id,
            "Started in-process worker"
        );

        Ok(LaunchedWorker {
            process: ProcessToken::Task(task_id),
            transport: host_side,
            exit: exit_rx,
            terminator: Arc::new(TaskTerminator { done, abort }),
            local_dispatch: Some(Arc::new(dispatch)),
        })
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_owned()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::agent::{ServiceSurface, WorkerContext};
    use crate::protocol::{Envelope, Message};
    use axum::Router;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    struct Idle;

    #[async_trait]
    impl ServiceApp for Idle {
        async fn build(&self, _ctx: &WorkerContext) -> Result<ServiceSurface> {
            Ok(ServiceSurface::new(Router::new()))
        }
    }

    struct Panics;

    #[async_trait]
    impl ServiceApp for Panics {
        async fn build(&self, _ctx: &WorkerContext) -> Result<ServiceSurface> {
            Ok(ServiceSurface::new(Router::new()))
        }

        async fn run(&self, _ctx: &WorkerContext) -> Result<()> {
            panic!("boom");
        }
    }

    fn spec(service: &str) -> LaunchSpec {
        LaunchSpec {
            service_id: service.into(),
            worker_id: Uuid::now_v7(),
            working_dir: std::env::temp_dir(),
            command: crate::descriptor::CommandSpec::new("in-process"),
            env: BTreeMap::new(),
        }
    }

    async fn handshake(worker: &mut LaunchedWorker) {
        let hello = worker.transport.inbound.recv().await.unwrap();
        worker
            .transport
            .outbound
            .send(Envelope::reply(1, hello.seq, Message::Ack))
            .unwrap();
    }

    #[tokio::test]
    async fn unregistered_service_fails_to_launch() {
        let backend = InProcessBackend::new();
        let err = backend.launch(&spec("ghost")).await.unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn terminate_aborts_unresponsive_task() {
        let backend = InProcessBackend::new();
        backend.register("idle", Arc::new(Idle));
        let mut worker = backend.launch(&spec("idle")).await.unwrap();
        assert!(matches!(worker.process, ProcessToken::Task(1)));
        assert!(worker.local_dispatch.is_some());
        handshake(&mut worker).await;

        // The agent ignores termination without a shutdown request.
        worker.terminator.terminate(Duration::from_millis(50)).await;
        let exit = worker.exit.await.unwrap();
        assert_eq!(exit.detail.as_deref(), Some("aborted"));
    }

    #[tokio::test]
    async fn shutdown_request_ends_task_cleanly() {
        let backend = InProcessBackend::new();
        backend.register("idle", Arc::new(Idle));
        let mut worker = backend.launch(&spec("idle")).await.unwrap();
        handshake(&mut worker).await;

        worker
            .transport
            .outbound
            .send(Envelope::new(2, Message::ShutdownRequest { grace_ms: 100 }))
            .unwrap();
        worker.terminator.terminate(Duration::from_secs(5)).await;
        assert!(worker.exit.await.unwrap().success());
    }

    #[tokio::test]
    async fn panic_is_reported_as_exit() {
        let backend = InProcessBackend::new();
        backend.register("panics", Arc::new(Panics));
        let mut worker = backend.launch(&spec("panics")).await.unwrap();
        handshake(&mut worker).await;

        let exit = worker.exit.await.unwrap();
        assert!(!exit.success());
        assert_eq!(exit.detail.as_deref(), Some("panicked: boom"));
    }
}
