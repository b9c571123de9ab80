//! Local process backend
//!
//! One child process per worker. The capability channel runs over the child's
//! stdin/stdout as newline-delimited JSON; stderr and non-frame stdout lines are
//! forwarded to the host's logs.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::log_forwarder::{StreamKind, forward_line, spawn_stream_forwarder};
use super::{BackendKind, LaunchSpec, LaunchedWorker, WorkerBackend, WorkerExit, WorkerTerminator};
use crate::channel::spawn_line_transport;
use crate::descriptor::ServiceId;
use crate::worker::ProcessToken;

/// Grace period before force-killing workers when the whole runtime shuts down
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Extra time a terminator waits past the grace period for the kill to land
const FORCE_KILL_MARGIN: Duration = Duration::from_secs(2);

/// Timeout for waiting on forwarder tasks after the child exits
const FORWARDER_DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Send SIGTERM to a child process. `false` when the child already exited or
/// the signal could not be delivered.
#[cfg(unix)]
fn send_terminate_signal(child: &Child) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return false;
    };
    let Ok(pid) = i32::try_from(pid) else {
        tracing::warn!(pid, "PID exceeds i32::MAX, cannot send SIGTERM");
        return false;
    };
    kill(Pid::from_raw(pid), Signal::SIGTERM).is_ok()
}

#[cfg(windows)]
fn send_terminate_signal(_child: &Child) -> bool {
    false
}

#[derive(Clone)]
struct WorkerLabel {
    service: ServiceId,
    worker_id: Uuid,
}

/// SIGTERM, wait up to `grace`, then kill.
async fn stop_child_with_grace(
    child: &mut Child,
    label: &WorkerLabel,
    grace: Duration,
    context: &str,
) -> std::io::Result<ExitStatus> {
    let pid = child.id();
    let graceful = send_terminate_signal(child);
    tracing::debug!(
        service = %label.service,
        worker_id = %label.worker_id,
        pid = ?pid,
        graceful,
        "{context}: sent termination signal"
    );

    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        return status;
    }

    tracing::warn!(
        service = %label.service,
        worker_id = %label.worker_id,
        pid = ?pid,
        "{context}: grace period expired, force killing"
    );
    if let Err(e) = child.kill().await {
        tracing::warn!(
            service = %label.service,
            worker_id = %label.worker_id,
            error = %e,
            "{context}: failed to force kill"
        );
    }
    child.wait().await
}

async fn wait_forwarder(handle: JoinHandle<()>) {
    _ = tokio::time::timeout(FORWARDER_DRAIN_TIMEOUT, handle).await;
}

/// Own the child until it exits, stopping it on request or runtime shutdown.
async fn watch_child(
    mut child: Child,
    label: WorkerLabel,
    mut stop_rx: mpsc::Receiver<Duration>,
    cancel: CancellationToken,
    exit_tx: oneshot::Sender<WorkerExit>,
    done: CancellationToken,
    forwarders: Vec<JoinHandle<()>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Some(grace) = stop_rx.recv() => {
            stop_child_with_grace(&mut child, &label, grace, "stop").await
        }
        () = cancel.cancelled() => {
            stop_child_with_grace(&mut child, &label, SHUTDOWN_GRACE_PERIOD, "shutdown").await
        }
    };

    let exit = match status {
        Ok(status) => WorkerExit::from(status),
        Err(e) => WorkerExit::failed(format!("failed to wait for worker: {e}")),
    };
    tracing::debug!(
        service = %label.service,
        worker_id = %label.worker_id,
        exit = %exit,
        "Worker process exited"
    );

    for forwarder in forwarders {
        wait_forwarder(forwarder).await;
    }
    _ = exit_tx.send(exit);
    done.cancel();
}

struct ProcessTerminator {
    stop_tx: mpsc::Sender<Duration>,
    done: CancellationToken,
}

#[async_trait]
impl WorkerTerminator for ProcessTerminator {
    async fn terminate(&self, grace: Duration) {
        // A full queue means a stop is already under way.
        _ = self.stop_tx.try_send(grace);
        _ = tokio::time::timeout(grace + FORCE_KILL_MARGIN, self.done.cancelled()).await;
    }
}

/// Backend that runs every worker as a local child process.
///
/// When the cancellation token fires, every child still alive receives SIGTERM
/// and is killed after a grace period.
pub struct LocalProcessBackend {
    cancel: CancellationToken,
}

impl LocalProcessBackend {
    #[must_use]
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }
}

#[async_trait]
impl WorkerBackend for LocalProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::LocalProcess
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedWorker> {
        if !spec.working_dir.is_dir() {
            bail!(
                "working directory '{}' of service '{}' does not exist",
                spec.working_dir.display(),
                spec.service_id
            );
        }

        let mut cmd = Command::new(&spec.command.program);
        cmd.args(&spec.command.args)
            .envs(&spec.env)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn '{}'", spec.command))?;
        let pid = child.id().context("spawned worker has no pid")?;
        let stdin = child.stdin.take().context("worker stdin not captured")?;
        let stdout = child.stdout.take().context("worker stdout not captured")?;

        let label = WorkerLabel {
            service: spec.service_id.clone(),
            worker_id: spec.worker_id,
        };

        let line_label = label.clone();
        let (transport, read_task, _write_task) = spawn_line_transport(stdout, stdin, move |line| {
            forward_line(&line_label.service, line_label.worker_id, StreamKind::Stdout, line);
        });

        let mut forwarders = vec![read_task];
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(spawn_stream_forwarder(
                stderr,
                label.service.clone(),
                label.worker_id,
                self.cancel.child_token(),
                StreamKind::Stderr,
            ));
        }

        tracing::info!(
            service = %spec.service_id,
            worker_id = %spec.worker_id,
            pid,
            command = %spec.command,
            "Spawned worker process"
        );

        let (exit_tx, exit_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let done = CancellationToken::new();
        tokio::spawn(watch_child(
            child,
            label,
            stop_rx,
            self.cancel.clone(),
            exit_tx,
            done.clone(),
            forwarders,
        ));

        Ok(LaunchedWorker {
            process: ProcessToken::Pid(pid),
            transport,
            exit: exit_rx,
            terminator: Arc::new(ProcessTerminator { stop_tx, done }),
            local_dispatch: None,
        })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::descriptor::CommandSpec;
    use crate::protocol::Message;
    use std::collections::BTreeMap;

    fn spec(program: &str, args: &[&str]) -> LaunchSpec {
        LaunchSpec {
            service_id: "svc".into(),
            worker_id: Uuid::now_v7(),
            working_dir: std::env::temp_dir(),
            command: CommandSpec::new(program).with_args(args.iter().copied()),
            env: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn missing_working_dir_is_rejected() {
        let backend = LocalProcessBackend::new(CancellationToken::new());
        let mut spec = spec("/bin/sleep", &["1"]);
        spec.working_dir = "/definitely/not/here".into();
        let err = backend.launch(&spec).await.unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn missing_program_is_rejected() {
        let backend = LocalProcessBackend::new(CancellationToken::new());
        let err = backend
            .launch(&spec("/definitely/not/a/binary", &[]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_code_is_reported() {
        let backend = LocalProcessBackend::new(CancellationToken::new());
        let worker = backend
            .launch(&spec("/bin/sh", &["-c", "exit 3"]))
            .await
            .unwrap();
        assert!(matches!(worker.process, ProcessToken::Pid(_)));
        let exit = worker.exit.await.unwrap();
        assert_eq!(exit.code, Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn frames_on_stdout_reach_the_transport() {
        let backend = LocalProcessBackend::new(CancellationToken::new());
        let script = r#"echo "booting"; echo '{"v":1,"seq":1,"body":{"kind":"ready"}}'; sleep 5"#;
        let mut worker = backend
            .launch(&spec("/bin/sh", &["-c", script]))
            .await
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(5), worker.transport.inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.body, Message::Ready { listen: None });

        worker.terminator.terminate(Duration::from_secs(2)).await;
        let exit = worker.exit.await.unwrap();
        assert!(!exit.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_stops_long_running_worker() {
        let backend = LocalProcessBackend::new(CancellationToken::new());
        let worker = backend.launch(&spec("/bin/sleep", &["30"])).await.unwrap();

        tokio::time::timeout(
            Duration::from_secs(5),
            worker.terminator.terminate(Duration::from_secs(2)),
        )
        .await
        .unwrap();

        let exit = worker.exit.await.unwrap();
        assert_eq!(exit.code, None);
        assert_eq!(exit.signal, Some(15));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn backend_cancellation_stops_children() {
        let cancel = CancellationToken::new();
        let backend = LocalProcessBackend::new(cancel.clone());
        let worker = backend.launch(&spec("/bin/sleep", &["30"])).await.unwrap();

        cancel.cancel();
        let exit = tokio::time::timeout(Duration::from_secs(10), worker.exit)
            .await
            .unwrap()
            .unwrap();
        assert!(!exit.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_after_exit_returns_immediately() {
        let backend = LocalProcessBackend::new(CancellationToken::new());
        let worker = backend
            .launch(&spec("/bin/sh", &["-c", "exit 0"]))
            .await
            .unwrap();
        let LaunchedWorker {
            exit, terminator, ..
        } = worker;
        assert!(exit.await.unwrap().success());

        tokio::time::timeout(Duration::from_millis(500), terminator.terminate(Duration::from_secs(30)))
            .await
            .unwrap();
    }
}
