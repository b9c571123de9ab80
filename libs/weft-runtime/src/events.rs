//! Events consumed by the runtime's control loop.

use uuid::Uuid;

use crate::backends::WorkerExit;
use crate::channel::HealthSignal;
use crate::descriptor::ServiceId;
use crate::protocol::Message;

#[derive(Debug, Clone)]
pub enum ControlEvent {
    /// A worker ended, for whatever reason.
    WorkerExited {
        service_id: ServiceId,
        worker_id: Uuid,
        exit: WorkerExit,
    },
    Health {
        service_id: ServiceId,
        worker_id: Uuid,
        signal: HealthSignal,
    },
    /// Non-reply message received from a worker.
    Message {
        service_id: ServiceId,
        worker_id: Uuid,
        message: Message,
    },
    /// Backoff elapsed for a crashed worker.
    RestartDue {
        service_id: ServiceId,
        worker_id: Uuid,
        attempt: u32,
    },
    /// A source change was observed under a watched service.
    ChangeDetected { service_id: ServiceId },
    /// Debounce elapsed; `epoch` identifies the change burst it closes.
    ReloadDue { service_id: ServiceId, epoch: u64 },
}
