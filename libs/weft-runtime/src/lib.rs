#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Weft runtime orchestrator
//!
//! Supervises one worker per configured service, composes their HTTP surfaces
//! behind a single mesh router, and keeps routes consistent across crashes,
//! restarts and hot reloads.
//!
//! ## Modules
//!
//! - [`descriptor`]: validated service descriptors and start order
//! - [`supervisor`]: worker lifecycle, crash policy, health
//! - [`channel`] / [`protocol`]: the capability channel and its wire format
//! - [`backends`]: local process and in-process worker backends
//! - [`mesh`]: route table, ingress dispatch, draining
//! - [`reload`]: debounce, drain, restart, reconcile
//! - [`runtime`]: [`RuntimeContext`] and its control loop
//! - [`management`]: read model and management HTTP API
//! - [`collaborators`]: dependency install, git resolution, builds

pub mod agent;
pub mod backends;
pub mod channel;
pub mod collaborators;
pub mod descriptor;
pub mod error;
pub mod events;
pub mod management;
pub mod mesh;
pub mod problem;
pub mod protocol;
pub mod reload;
pub mod runtime;
pub mod supervisor;
pub mod telemetry;
pub mod watch;
pub mod worker;

pub use agent::{ServiceApp, ServiceSurface, WorkerContext, run_stdio};
pub use backends::{InProcessBackend, LocalProcessBackend, WorkerBackend};
pub use descriptor::{
    BackoffStrategy, CommandSpec, DescriptorError, DescriptorStore, ExternalSource, PackageManager,
    RestartPolicy, ServiceDescriptor, ServiceId,
};
pub use error::{RouteConflictError, RuntimeError, StartupCause, StartupError};
pub use mesh::{Mesh, MeshError, MeshSettings, RouteDecision, RouteEntry, RouteTable};
pub use reload::{ReloadCoordinator, ReloadPhase, ReloadSettings, ReloadStatus, VersionChanged};
pub use runtime::{RuntimeContext, RuntimeSettings};
pub use supervisor::{CrashDecision, Supervisor, SupervisorSettings};
pub use worker::{HealthStatus, LifecycleEvent, WorkerHandle, WorkerState};
