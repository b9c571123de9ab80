//! Periodic liveness probing over a capability channel.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{CapabilityChannel, ChannelError};
use crate::protocol::Message;
use crate::telemetry::ThrottledLog;

#[derive(Debug, Clone, Copy)]
pub struct HealthOptions {
    pub interval: Duration,
    /// Consecutive missed pings before the worker is reported degraded.
    pub missed_threshold: u32,
    /// How long a worker may stay degraded before it is declared unresponsive.
    pub degraded_grace: Duration,
}

impl Default for HealthOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            missed_threshold: 3,
            degraded_grace: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthSignal {
    Degraded { missed: u32 },
    Recovered,
    /// Terminal: the monitor stops after emitting it.
    Unresponsive { missed: u32 },
}

/// Probe results shared with whoever reports health.
#[derive(Debug, Default)]
pub struct HealthProbe {
    missed: AtomicU32,
    last_pong: Mutex<Option<Instant>>,
}

impl HealthProbe {
    #[must_use]
    pub fn missed(&self) -> u32 {
        self.missed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn last_pong(&self) -> Option<Instant> {
        *self.last_pong.lock()
    }

    fn record_pong(&self) {
        self.missed.store(0, Ordering::Relaxed);
        *self.last_pong.lock() = Some(Instant::now());
    }

    fn record_miss(&self) -> u32 {
        self.missed.fetch_add(1, Ordering::Relaxed).saturating_add(1)
    }
}

/// Ping the worker every `interval` until `cancel` fires or the worker is
/// declared unresponsive. A channel that closes before `cancel` fires counts as
/// an unresponsive worker.
pub fn spawn_health_monitor<F>(
    channel: Arc<CapabilityChannel>,
    options: HealthOptions,
    probe: Arc<HealthProbe>,
    cancel: CancellationToken,
    on_signal: F,
) -> JoinHandle<()>
where
    F: Fn(HealthSignal) + Send + 'static,
{
    tokio::spawn(async move {
        let throttle = ThrottledLog::new(Duration::from_secs(30));
        let mut ticker = tokio::time::interval(options.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the worker has just become ready.
        ticker.tick().await;

        let mut nonce: u64 = 0;
        let mut degraded_since: Option<Instant> = None;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            nonce = nonce.wrapping_add(1);
            let reply = tokio::select! {
                () = cancel.cancelled() => break,
                reply = channel.send(Message::HealthPing { nonce }).wait() => reply,
            };

            match reply {
                Ok(_) => {
                    probe.record_pong();
                    if degraded_since.take().is_some() {
                        tracing::info!(service = %channel.service_id(), "Worker is responsive again");
                        on_signal(HealthSignal::Recovered);
                    }
                }
                Err(ChannelError::Timeout { .. }) => {
                    let missed = probe.record_miss();
                    if let Some(suppressed) = throttle.admit() {
                        tracing::warn!(
                            service = %channel.service_id(),
                            missed,
                            suppressed,
                            "Health ping not answered"
                        );
                    }
                    match degraded_since {
                        None if missed >= options.missed_threshold => {
                            degraded_since = Some(Instant::now());
                            on_signal(HealthSignal::Degraded { missed });
                        }
                        Some(since) if since.elapsed() >= options.degraded_grace => {
                            on_signal(HealthSignal::Unresponsive { missed });
                            break;
                        }
                        _ => {}
                    }
                }
                Err(ChannelError::Closed) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let missed = probe.record_miss();
                    tracing::warn!(service = %channel.service_id(), "Capability channel closed under a live worker");
                    on_signal(HealthSignal::Unresponsive { missed });
                    break;
                }
                Err(e) => {
                    tracing::debug!(service = %channel.service_id(), error = %e, "Health monitor stopped");
                    break;
                }
            }
        }
    })
}
