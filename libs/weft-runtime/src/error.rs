//! Runtime error taxonomy.
//!
//! Each concern carries its own `thiserror` enum; `RuntimeError` is what surfaces
//! from the runtime's public operations and decides the process exit code.

use std::time::Duration;

use uuid::Uuid;

use crate::channel::ChannelError;
use crate::collaborators::{BuildError, DependencyInstallError, ResolutionError};
use crate::descriptor::{DescriptorError, ServiceId};
use crate::mesh::MeshError;

/// Two routing entries with an identical prefix point at different services.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("route conflict: prefix '{prefix}' is claimed by both '{first}' and '{second}'")]
pub struct RouteConflictError {
    pub prefix: String,
    pub first: ServiceId,
    pub second: ServiceId,
}

/// Why a worker failed to reach `Ready`.
#[derive(Debug, thiserror::Error)]
pub enum StartupCause {
    #[error("did not become ready within {0:?}")]
    Timeout(Duration),
    #[error("exited during startup ({0})")]
    Exited(String),
    #[error("reported startup failure: {0}")]
    Failed(String),
    #[error("launch failed: {0:#}")]
    Launch(anyhow::Error),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("a worker is already running")]
    AlreadyRunning,
    #[error("startup cancelled")]
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
#[error("service '{service}' failed to start: {cause}")]
pub struct StartupError {
    pub service: ServiceId,
    #[source]
    pub cause: StartupCause,
}

impl StartupError {
    pub fn new(service: ServiceId, cause: StartupCause) -> Self {
        Self { service, cause }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("invalid service configuration: {0}")]
    Config(#[from] DescriptorError),

    #[error(transparent)]
    Startup(#[from] StartupError),

    #[error("service '{service}' crashed {crashes} times and will not be restarted: {last_error}")]
    Crash {
        service: ServiceId,
        crashes: u32,
        last_error: String,
    },

    #[error(transparent)]
    RouteConflict(#[from] RouteConflictError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Mesh(#[from] MeshError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    DependencyInstall(#[from] DependencyInstallError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("worker {worker_id} is no longer the current worker of service '{service}'")]
    StaleHandle { service: ServiceId, worker_id: Uuid },

    #[error("unknown service '{0}'")]
    UnknownService(ServiceId),
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn startup_error_names_service_and_cause() {
        let err = StartupError::new(
            ServiceId::from("api"),
            StartupCause::Timeout(Duration::from_secs(3)),
        );
        let text = err.to_string();
        assert!(text.contains("'api'"));
        assert!(text.contains("3s"));
    }

    #[test]
    fn route_conflict_converts_into_runtime_error() {
        let conflict = RouteConflictError {
            prefix: "/".into(),
            first: "main".into(),
            second: "api".into(),
        };
        let err: RuntimeError = conflict.into();
        assert!(matches!(err, RuntimeError::RouteConflict(_)));
        assert!(err.to_string().contains("'/'"));
    }
}
