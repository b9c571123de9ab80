//! Per-service traffic gate: counts in-flight requests and refuses new ones
//! while the service drains.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Default)]
pub struct TrafficGate {
    draining: AtomicBool,
    inflight: AtomicUsize,
    idle: Notify,
}

/// Held for the lifetime of one dispatched request.
#[derive(Debug)]
pub struct InflightGuard {
    gate: Arc<TrafficGate>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.gate.release();
    }
}

impl TrafficGate {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Admit one request unless the gate is draining.
    ///
    /// The counter is raised before the draining flag is read, so a drain that
    /// starts concurrently either sees this request or this request sees the drain.
    #[must_use]
    pub fn try_enter(self: &Arc<Self>) -> Option<InflightGuard> {
        self.inflight.fetch_add(1, Ordering::SeqCst);
        if self.draining.load(Ordering::SeqCst) {
            self.release();
            return None;
        }
        Some(InflightGuard { gate: self.clone() })
    }

    fn release(&self) {
        if self.inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    pub fn end_drain(&self) {
        self.draining.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    /// Wait until no request is in flight. `false` if `grace` ran out first.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inflight() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.inflight() == 0;
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn guards_track_inflight() {
        let gate = TrafficGate::new();
        let a = gate.try_enter().unwrap();
        let b = gate.try_enter().unwrap();
        assert_eq!(gate.inflight(), 2);
        drop(a);
        drop(b);
        assert_eq!(gate.inflight(), 0);
    }

    #[test]
    fn draining_gate_refuses_new_requests() {
        let gate = TrafficGate::new();
        gate.begin_drain();
        assert!(gate.try_enter().is_none());
        assert_eq!(gate.inflight(), 0);
        gate.end_drain();
        assert!(gate.try_enter().is_some());
    }

    #[tokio::test]
    async fn wait_idle_returns_when_last_request_finishes() {
        let gate = TrafficGate::new();
        let guard = gate.try_enter().unwrap();
        gate.begin_drain();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_idle(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        drop(guard);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_idle_gives_up_after_grace() {
        let gate = TrafficGate::new();
        let _guard = gate.try_enter().unwrap();
        assert!(!gate.wait_idle(Duration::from_millis(300)).await);
    }

    #[tokio::test]
    async fn idle_gate_is_immediately_idle() {
        let gate = TrafficGate::new();
        assert!(gate.wait_idle(Duration::ZERO).await);
    }
}
