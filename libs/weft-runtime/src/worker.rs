//! Worker handles and the lifecycle state machine.

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::descriptor::ServiceId;

/// Lifecycle state of a single worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Ready,
    Degraded,
    Stopping,
    Stopped,
    Crashed,
}

impl WorkerState {
    /// `Stopped` and `Crashed` end a worker's life; a new start creates a new handle.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Stopped | WorkerState::Crashed)
    }

    /// Whether requests may be dispatched to a worker in this state.
    #[must_use]
    pub fn is_routable(self) -> bool {
        self == WorkerState::Ready
    }

    /// Allowed transitions of the lifecycle graph.
    #[must_use]
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::{Crashed, Degraded, Ready, Starting, Stopped, Stopping};
        matches!(
            (self, next),
            (Starting, Ready | Stopping | Crashed)
                | (Ready, Degraded | Stopping | Crashed)
                | (Degraded, Ready | Stopping | Crashed)
                | (Stopping, Stopped)
                | (Crashed, Stopped)
        )
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Starting => "starting",
            WorkerState::Ready => "ready",
            WorkerState::Degraded => "degraded",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
            WorkerState::Crashed => "crashed",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque identity of the thing executing a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessToken {
    Pid(u32),
    Task(u64),
}

impl ProcessToken {
    #[must_use]
    pub fn pid(self) -> Option<u32> {
        match self {
            ProcessToken::Pid(pid) => Some(pid),
            ProcessToken::Task(_) => None,
        }
    }
}

impl fmt::Display for ProcessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessToken::Pid(pid) => write!(f, "pid {pid}"),
            ProcessToken::Task(id) => write!(f, "task {id}"),
        }
    }
}

/// Snapshot of one running instance of a service.
///
/// Every start produces a fresh `worker_id`; operations addressed to an older
/// id are rejected as stale.
#[derive(Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    pub service_id: ServiceId,
    pub worker_id: Uuid,
    pub state: WorkerState,
    pub process: Option<ProcessToken>,
    pub started_at: Instant,
    pub restart_count: u32,
    pub last_error: Option<String>,
}

impl WorkerHandle {
    #[must_use]
    pub fn new(service_id: ServiceId, restart_count: u32) -> Self {
        Self {
            service_id,
            worker_id: Uuid::now_v7(),
            state: WorkerState::Starting,
            process: None,
            started_at: Instant::now(),
            restart_count,
            last_error: None,
        }
    }

    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("service_id", &self.service_id)
            .field("worker_id", &self.worker_id)
            .field("state", &self.state)
            .field("process", &self.process)
            .field("started_at", &self.started_at)
            .field("restart_count", &self.restart_count)
            .field("last_error", &self.last_error)
            .finish()
    }
}

/// Health view of a worker as reported by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub state: WorkerState,
    pub missed_pings: u32,
    pub last_pong_ago_ms: Option<u64>,
    pub uptime_ms: u64,
    pub restart_count: u32,
}

/// Emitted on every worker state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub service_id: ServiceId,
    pub worker_id: Uuid,
    pub from: Option<WorkerState>,
    pub to: WorkerState,
    pub reason: Option<String>,
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use WorkerState::{Crashed, Degraded, Ready, Starting, Stopped, Stopping};

    #[test]
    fn lifecycle_graph() {
        assert!(Starting.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Degraded));
        assert!(Degraded.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Ready.can_transition_to(Crashed));
        assert!(Crashed.can_transition_to(Stopped));

        assert!(!Stopped.can_transition_to(Ready));
        assert!(!Stopped.can_transition_to(Stopped));
        assert!(!Stopping.can_transition_to(Ready));
        assert!(!Crashed.can_transition_to(Ready));
        assert!(!Starting.can_transition_to(Degraded));
    }

    #[test]
    fn only_ready_is_routable() {
        assert!(Ready.is_routable());
        for state in [Starting, Degraded, Stopping, Stopped, Crashed] {
            assert!(!state.is_routable(), "{state} must not be routable");
        }
    }

    #[test]
    fn new_handles_get_distinct_ids() {
        let a = WorkerHandle::new("api".into(), 0);
        let b = WorkerHandle::new("api".into(), 1);
        assert_ne!(a.worker_id, b.worker_id);
        assert_eq!(a.state, Starting);
        assert_eq!(b.restart_count, 1);
    }
}
