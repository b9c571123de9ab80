//! Worker backends
//!
//! A backend turns a [`LaunchSpec`] into a running worker and hands back
//! everything the supervisor needs to talk to it, watch it, and stop it.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::channel::Transport;
use crate::descriptor::{CommandSpec, ServiceDescriptor, ServiceId};
use crate::mesh::Dispatch;
use crate::protocol::PROTOCOL_VERSION;
use crate::worker::ProcessToken;

pub mod in_process;
pub mod local;
pub mod log_forwarder;

pub use in_process::InProcessBackend;
pub use local::LocalProcessBackend;

pub const ENV_SERVICE_ID: &str = "WEFT_SERVICE_ID";
pub const ENV_WORKER_ID: &str = "WEFT_WORKER_ID";
pub const ENV_PROTOCOL_VERSION: &str = "WEFT_PROTOCOL_VERSION";

/// Address workers bind their HTTP listener to.
pub const WORKER_HOST: &str = "127.0.0.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    LocalProcess,
    InProcess,
}

/// Everything needed to launch one worker of a service.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub service_id: ServiceId,
    pub worker_id: Uuid,
    pub working_dir: PathBuf,
    pub command: CommandSpec,
    pub env: BTreeMap<String, String>,
}

impl LaunchSpec {
    /// Derive the launch spec of a new worker, injecting the runtime's environment.
    #[must_use]
    pub fn for_worker(descriptor: &ServiceDescriptor, worker_id: Uuid) -> Self {
        let mut env = descriptor.env.clone();
        env.insert(ENV_SERVICE_ID.to_owned(), descriptor.id.to_string());
        env.insert(ENV_WORKER_ID.to_owned(), worker_id.to_string());
        env.insert(
            ENV_PROTOCOL_VERSION.to_owned(),
            PROTOCOL_VERSION.to_string(),
        );
        env.insert("HOST".to_owned(), WORKER_HOST.to_owned());
        env.insert("PORT".to_owned(), "0".to_owned());

        Self {
            service_id: descriptor.id.clone(),
            worker_id,
            working_dir: descriptor.path.clone(),
            command: descriptor.entrypoint.clone(),
            env,
        }
    }
}

/// How a worker ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub detail: Option<String>,
}

impl WorkerExit {
    #[must_use]
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
            detail: None,
        }
    }

    #[must_use]
    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            code: None,
            signal: None,
            detail: Some(detail.into()),
        }
    }

    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for WorkerExit {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
            detail: None,
        }
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}")?,
            (None, Some(signal)) => write!(f, "signal {signal}")?,
            (None, None) => f.write_str("unknown exit status")?,
        }
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

/// Ends a worker: waits up to `grace` for it to exit on its own, then forces it.
#[async_trait]
pub trait WorkerTerminator: Send + Sync {
    async fn terminate(&self, grace: Duration);
}

/// A freshly launched worker, not yet handshaken.
pub struct LaunchedWorker {
    pub process: ProcessToken,
    pub transport: Transport,
    /// Resolves once when the worker ends, for whatever reason.
    pub exit: oneshot::Receiver<WorkerExit>,
    pub terminator: Arc<dyn WorkerTerminator>,
    /// Direct dispatch target for workers that live inside this process.
    pub local_dispatch: Option<Arc<dyn Dispatch>>,
}

impl fmt::Debug for LaunchedWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchedWorker")
            .field("process", &self.process)
            .field("transport", &self.transport)
            .field("local_dispatch", &self.local_dispatch.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait WorkerBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Launch one worker.
    ///
    /// # Errors
    /// Returns an error when the worker cannot be created at all.
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedWorker>;
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn launch_spec_injects_runtime_env() {
        let descriptor = ServiceDescriptor::new("api", "/srv/api").with_env("NODE_ENV", "production");
        let worker_id = Uuid::now_v7();
        let spec = LaunchSpec::for_worker(&descriptor, worker_id);

        assert_eq!(spec.env[ENV_SERVICE_ID], "api");
        assert_eq!(spec.env[ENV_WORKER_ID], worker_id.to_string());
        assert_eq!(spec.env[ENV_PROTOCOL_VERSION], PROTOCOL_VERSION.to_string());
        assert_eq!(spec.env["PORT"], "0");
        assert_eq!(spec.env["NODE_ENV"], "production");
        assert_eq!(spec.working_dir, PathBuf::from("/srv/api"));
        assert_eq!(spec.command.to_string(), "npm start");
    }

    #[test]
    fn exit_display() {
        assert_eq!(WorkerExit::code(1).to_string(), "exit code 1");
        assert_eq!(
            WorkerExit::failed("panicked").to_string(),
            "unknown exit status: panicked"
        );
        assert!(WorkerExit::code(0).success());
        assert!(!WorkerExit::code(2).success());
    }
}
