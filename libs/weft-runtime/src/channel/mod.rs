//! Capability Channel
//!
//! Bidirectional, message-oriented link between the supervisor and one worker.
//! Sends never block the caller; replies are matched by sequence number and
//! bounded by the acknowledgement timeout.

mod health;
mod transport;

pub use health::{HealthOptions, HealthProbe, HealthSignal, spawn_health_monitor};
pub use transport::{MAX_FRAME_LEN, Transport, spawn_line_transport};

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::descriptor::ServiceId;
use crate::protocol::{Envelope, Message, PROTOCOL_VERSION, Subscription};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("no reply to '{kind}' within {after:?}")]
    Timeout { kind: &'static str, after: Duration },
    #[error("channel closed")]
    Closed,
    #[error("protocol version mismatch: runtime speaks v{expected}, worker speaks v{actual}")]
    VersionMismatch { expected: u32, actual: u32 },
    #[error("handshake failed: {0}")]
    Handshake(String),
}

#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    pub ack_timeout: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
        }
    }
}

pub type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync>;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Message>>>>;

/// Facts learned from the worker's `hello`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub service_id: String,
    pub pid: Option<u32>,
    pub subscriptions: Vec<Subscription>,
}

pub struct CapabilityChannel {
    service_id: ServiceId,
    peer: PeerInfo,
    outbound: mpsc::UnboundedSender<Envelope>,
    next_seq: Arc<AtomicU64>,
    pending: PendingMap,
    handlers: Arc<RwLock<Vec<MessageHandler>>>,
    ack_timeout: Duration,
    closed: CancellationToken,
}

impl std::fmt::Debug for CapabilityChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityChannel")
            .field("service_id", &self.service_id)
            .field("peer", &self.peer)
            .field("pending", &self.pending.lock().len())
            .field("ack_timeout", &self.ack_timeout)
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl CapabilityChannel {
    /// Complete the worker's `hello` handshake and start the inbound dispatcher.
    ///
    /// Returns the channel and a stream of every non-reply message the worker
    /// sends after the handshake. The caller bounds the wait for `hello`.
    ///
    /// # Errors
    /// `VersionMismatch` when the worker speaks another protocol version,
    /// `Handshake` when the first frame is not a `hello`, `Closed` when the
    /// transport ends first.
    pub async fn establish(
        service_id: ServiceId,
        transport: Transport,
        options: ChannelOptions,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<Message>), ChannelError> {
        let Transport {
            outbound,
            mut inbound,
        } = transport;

        let first = inbound.recv().await.ok_or(ChannelError::Closed)?;
        let Message::Hello {
            protocol_version,
            service_id: peer_service,
            pid,
            subscriptions,
        } = first.body
        else {
            return Err(ChannelError::Handshake(format!(
                "expected 'hello', got '{}'",
                first.body.kind()
            )));
        };

        let next_seq = Arc::new(AtomicU64::new(1));
        if protocol_version != PROTOCOL_VERSION || first.v != PROTOCOL_VERSION {
            let actual = if protocol_version == PROTOCOL_VERSION {
                first.v
            } else {
                protocol_version
            };
            let reason = format!("unsupported protocol version {actual}");
            let seq = next_seq.fetch_add(1, Ordering::Relaxed);
            _ = outbound.send(Envelope::reply(
                seq,
                first.seq,
                Message::StartupFailed { reason },
            ));
            return Err(ChannelError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual,
            });
        }
        if peer_service != service_id.as_str() {
            tracing::warn!(
                service = %service_id,
                announced = %peer_service,
                "Worker announced a different service id"
            );
        }

        let seq = next_seq.fetch_add(1, Ordering::Relaxed);
        outbound
            .send(Envelope::reply(seq, first.seq, Message::Ack))
            .map_err(|_| ChannelError::Closed)?;

        let channel = Arc::new(Self {
            service_id,
            peer: PeerInfo {
                service_id: peer_service,
                pid,
                subscriptions,
            },
            outbound,
            next_seq,
            pending: Arc::new(Mutex::new(HashMap::new())),
            handlers: Arc::new(RwLock::new(Vec::new())),
            ack_timeout: options.ack_timeout,
            closed: CancellationToken::new(),
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::dispatch_inbound(
            channel.clone(),
            inbound,
            events_tx,
        ));

        Ok((channel, events_rx))
    }

    async fn dispatch_inbound(
        channel: Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<Envelope>,
        events: mpsc::UnboundedSender<Message>,
    ) {
        loop {
            let envelope = tokio::select! {
                () = channel.closed.cancelled() => break,
                next = inbound.recv() => match next {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            if envelope.v != PROTOCOL_VERSION {
                tracing::warn!(
                    service = %channel.service_id,
                    version = envelope.v,
                    "Dropping frame with foreign protocol version"
                );
                continue;
            }

            if let Some(reply_to) = envelope.reply_to {
                let waiter = channel.pending.lock().remove(&reply_to);
                if let Some(waiter) = waiter {
                    _ = waiter.send(envelope.body);
                }
                continue;
            }

            if envelope.body.wants_ack() {
                let seq = channel.next_seq();
                _ = channel
                    .outbound
                    .send(Envelope::reply(seq, envelope.seq, Message::Ack));
            }

            {
                let handlers = channel.handlers.read();
                for handler in handlers.iter() {
                    handler(&envelope.body);
                }
            }
            _ = events.send(envelope.body);
        }

        channel.closed.cancel();
        // Dropping the senders wakes every waiter with `Closed`.
        channel.pending.lock().clear();
        tracing::debug!(service = %channel.service_id, "Capability channel closed");
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    #[must_use]
    pub fn service_id(&self) -> &ServiceId {
        &self.service_id
    }

    #[must_use]
    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    #[must_use]
    pub fn is_subscribed(&self, topic: Subscription) -> bool {
        self.peer.subscriptions.contains(&topic)
    }

    /// Queue `message` and return a handle resolving to the worker's reply.
    ///
    /// Never blocks; a closed channel yields a reply that fails immediately.
    pub fn send(&self, message: Message) -> PendingReply {
        let kind = message.kind();
        if self.closed.is_cancelled() {
            return PendingReply::failed(kind, ChannelError::Closed);
        }

        let seq = self.next_seq();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(seq, tx);

        if self.outbound.send(Envelope::new(seq, message)).is_err() {
            self.pending.lock().remove(&seq);
            return PendingReply::failed(kind, ChannelError::Closed);
        }

        PendingReply {
            inner: Ok(Waiting {
                seq,
                rx,
                pending: self.pending.clone(),
            }),
            kind,
            timeout: self.ack_timeout,
        }
    }

    /// Queue `message` without waiting for any reply.
    ///
    /// # Errors
    /// Returns `Closed` when the channel is gone.
    pub fn notify(&self, message: Message) -> Result<(), ChannelError> {
        if self.closed.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        let seq = self.next_seq();
        self.outbound
            .send(Envelope::new(seq, message))
            .map_err(|_| ChannelError::Closed)
    }

    /// Register a callback for every inbound non-reply message.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.handlers.write().push(Arc::new(handler));
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.outbound.is_closed()
    }

    /// Resolves once the channel is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

struct Waiting {
    seq: u64,
    rx: oneshot::Receiver<Message>,
    pending: PendingMap,
}

/// Reply to a message sent through [`CapabilityChannel::send`].
#[must_use = "a pending reply does nothing unless awaited"]
pub struct PendingReply {
    inner: Result<Waiting, ChannelError>,
    kind: &'static str,
    timeout: Duration,
}

impl PendingReply {
    fn failed(kind: &'static str, error: ChannelError) -> Self {
        Self {
            inner: Err(error),
            kind,
            timeout: Duration::ZERO,
        }
    }

    /// Wait for the reply, bounded by the channel's acknowledgement timeout.
    ///
    /// # Errors
    /// `Timeout` if the worker does not answer in time, `Closed` if the channel
    /// closes first.
    pub async fn wait(self) -> Result<Message, ChannelError> {
        let Waiting { seq, rx, pending } = self.inner?;
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => {
                pending.lock().remove(&seq);
                Err(ChannelError::Timeout {
                    kind: self.kind,
                    after: self.timeout,
                })
            }
        }
    }
}
