//! Worker-side half of the capability channel.
//!
//! Any [`ServiceApp`] can be hosted by the runtime through this agent: it performs
//! the `hello` handshake, announces routes, reports readiness, answers health
//! pings, acknowledges control messages and honors shutdown requests.

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use axum::Router;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::backends::{ENV_SERVICE_ID, ENV_WORKER_ID, WORKER_HOST};
use crate::channel::{Transport, spawn_line_transport};
use crate::mesh::RouterDispatch;
use crate::protocol::{AnnouncedRoute, Envelope, LogLevel, Message, PROTOCOL_VERSION, Subscription};

/// HTTP surface a service exposes once built.
pub struct ServiceSurface {
    pub router: Router,
    /// Mount suggested by the service; the descriptor's prefix takes precedence.
    pub mount: Option<String>,
    pub routes: Vec<AnnouncedRoute>,
}

impl ServiceSurface {
    /// Surface answering everything under its mount.
    #[must_use]
    pub fn new(router: Router) -> Self {
        Self {
            router,
            mount: None,
            routes: vec![AnnouncedRoute::catch_all()],
        }
    }

    #[must_use]
    pub fn with_mount(mut self, mount: impl Into<String>) -> Self {
        self.mount = Some(mount.into());
        self
    }

    #[must_use]
    pub fn with_routes(mut self, routes: Vec<AnnouncedRoute>) -> Self {
        self.routes = routes;
        self
    }
}

/// A service the runtime can host.
#[async_trait]
pub trait ServiceApp: Send + Sync + 'static {
    /// Notification topics requested in the `hello`.
    fn subscriptions(&self) -> Vec<Subscription> {
        Vec::new()
    }

    /// Build the HTTP surface. Failing here reports a startup failure.
    async fn build(&self, ctx: &WorkerContext) -> Result<ServiceSurface>;

    /// Run until shutdown. Returning before shutdown was requested counts as a crash.
    async fn run(&self, ctx: &WorkerContext) -> Result<()> {
        ctx.shutdown.cancelled().await;
        Ok(())
    }
}

/// Version bump of a service the worker subscribed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionNotice {
    pub service_id: String,
    pub version: u64,
}

/// Outbound side of the channel, usable by the hosted service.
#[derive(Clone)]
pub struct AgentLink {
    outbound: mpsc::UnboundedSender<Envelope>,
    seq: Arc<AtomicU64>,
    versions: broadcast::Sender<VersionNotice>,
}

impl AgentLink {
    fn new(outbound: mpsc::UnboundedSender<Envelope>) -> Self {
        let (versions, _) = broadcast::channel(16);
        Self {
            outbound,
            seq: Arc::new(AtomicU64::new(1)),
            versions,
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, body: Message) -> u64 {
        let seq = self.next_seq();
        _ = self.outbound.send(Envelope::new(seq, body));
        seq
    }

    fn reply(&self, reply_to: u64, body: Message) {
        let seq = self.next_seq();
        _ = self.outbound.send(Envelope::reply(seq, reply_to, body));
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.send(Message::LogEntry {
            level,
            message: message.into(),
            fields: BTreeMap::new(),
        });
    }

    pub fn metric(&self, name: impl Into<String>, value: f64) {
        self.send(Message::MetricSample {
            name: name.into(),
            value,
            labels: BTreeMap::new(),
        });
    }

    /// Ask the runtime to reload this service.
    pub fn request_reload(&self, reason: Option<String>) {
        self.send(Message::ReloadRequest { reason });
    }

    #[must_use]
    pub fn subscribe_versions(&self) -> broadcast::Receiver<VersionNotice> {
        self.versions.subscribe()
    }
}

/// What a hosted service sees of its worker.
pub struct WorkerContext {
    pub service_id: String,
    pub worker_id: String,
    pub shutdown: CancellationToken,
    pub link: AgentLink,
}

/// Where the service's router is exposed.
pub enum Serve {
    /// Publish into an in-process dispatch slot.
    Local(RouterDispatch),
    /// Bind a TCP listener; port `0` picks an ephemeral port.
    Listen(SocketAddr),
}

pub struct AgentConfig {
    pub service_id: String,
    pub worker_id: String,
    pub pid: Option<u32>,
    pub serve: Serve,
}

/// Host `app` as a worker over `transport` until shutdown.
///
/// # Errors
/// Fails when the handshake is refused, the service cannot be built or served,
/// or the service's own `run` fails.
pub async fn run_agent(
    app: Arc<dyn ServiceApp>,
    transport: Transport,
    config: AgentConfig,
) -> Result<()> {
    let Transport {
        outbound,
        mut inbound,
    } = transport;
    let link = AgentLink::new(outbound);

    let hello_seq = link.send(Message::Hello {
        protocol_version: PROTOCOL_VERSION,
        service_id: config.service_id.clone(),
        pid: config.pid,
        subscriptions: app.subscriptions(),
    });
    await_hello_ack(&mut inbound, hello_seq).await?;

    let ctx = WorkerContext {
        service_id: config.service_id,
        worker_id: config.worker_id,
        shutdown: CancellationToken::new(),
        link: link.clone(),
    };

    let surface = match app.build(&ctx).await {
        Ok(surface) => surface,
        Err(e) => {
            link.send(Message::StartupFailed {
                reason: format!("{e:#}"),
            });
            return Err(e.context("service build failed"));
        }
    };

    let listen = match config.serve {
        Serve::Local(slot) => {
            slot.publish(surface.router);
            None
        }
        Serve::Listen(addr) => {
            let listener = match TcpListener::bind(addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    link.send(Message::StartupFailed {
                        reason: format!("failed to bind {addr}: {e}"),
                    });
                    return Err(e).with_context(|| format!("failed to bind {addr}"));
                }
            };
            let local = listener.local_addr()?;
            let shutdown = ctx.shutdown.clone();
            let router = surface.router;
            tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, router)
                    .with_graceful_shutdown(shutdown.cancelled_owned())
                    .await
                {
                    tracing::error!(error = %e, "Worker HTTP server failed");
                }
            });
            Some(local)
        }
    };

    link.send(Message::RoutesAnnounce {
        mount: surface.mount,
        routes: surface.routes,
        complete: true,
    });
    link.send(Message::Ready { listen });

    let control = tokio::spawn(serve_control(inbound, link, ctx.shutdown.clone()));

    let result = app.run(&ctx).await;
    ctx.shutdown.cancel();
    control.abort();
    result
}

async fn await_hello_ack(
    inbound: &mut mpsc::UnboundedReceiver<Envelope>,
    hello_seq: u64,
) -> Result<()> {
    while let Some(envelope) = inbound.recv().await {
        if envelope.reply_to != Some(hello_seq) {
            continue;
        }
        return match envelope.body {
            Message::Ack => Ok(()),
            Message::StartupFailed { reason } => Err(anyhow!("runtime refused worker: {reason}")),
            other => Err(anyhow!("unexpected reply to hello: '{}'", other.kind())),
        };
    }
    bail!("runtime closed the channel during handshake")
}

async fn serve_control(
    mut inbound: mpsc::UnboundedReceiver<Envelope>,
    link: AgentLink,
    shutdown: CancellationToken,
) {
    while let Some(envelope) = inbound.recv().await {
        if envelope.reply_to.is_some() {
            continue;
        }
        match envelope.body {
            Message::HealthPing { nonce } => {
                link.reply(envelope.seq, Message::HealthPong { nonce });
            }
            Message::ShutdownRequest { grace_ms } => {
                tracing::debug!(grace_ms, "Shutdown requested by runtime");
                link.reply(envelope.seq, Message::Ack);
                shutdown.cancel();
            }
            Message::VersionChanged {
                service_id,
                version,
            } => {
                link.reply(envelope.seq, Message::Ack);
                _ = link.versions.send(VersionNotice {
                    service_id,
                    version,
                });
            }
            other => {
                if other.wants_ack() {
                    link.reply(envelope.seq, Message::Ack);
                }
            }
        }
    }
    // Orphaned worker: the runtime is gone.
    shutdown.cancel();
}

/// Run `app` as a process worker spawned by the local process backend.
///
/// The channel runs over stdin/stdout, so the service must not write to stdout
/// itself; log to stderr instead.
///
/// # Errors
/// Fails when the runtime environment is missing or the agent fails.
pub async fn run_stdio(app: Arc<dyn ServiceApp>) -> Result<()> {
    let service_id = std::env::var(ENV_SERVICE_ID)
        .with_context(|| format!("{ENV_SERVICE_ID} is not set; is this process run by weft?"))?;
    let worker_id = std::env::var(ENV_WORKER_ID).unwrap_or_default();
    let host = std::env::var("HOST").unwrap_or_else(|_| WORKER_HOST.to_owned());
    let port = std::env::var("PORT").unwrap_or_else(|_| "0".to_owned());
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {host}:{port}"))?;

    let (transport, _read, _write) =
        spawn_line_transport(tokio::io::stdin(), tokio::io::stdout(), |line| {
            tracing::debug!(line, "Ignoring non-frame input");
        });

    run_agent(
        app,
        transport,
        AgentConfig {
            service_id,
            worker_id,
            pid: Some(std::process::id()),
            serve: Serve::Listen(addr),
        },
    )
    .await
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use axum::routing::get;

    struct Hello;

    #[async_trait]
    impl ServiceApp for Hello {
        fn subscriptions(&self) -> Vec<Subscription> {
            vec![Subscription::VersionChanged]
        }

        async fn build(&self, _ctx: &WorkerContext) -> Result<ServiceSurface> {
            Ok(ServiceSurface::new(Router::new().route("/", get(|| async { "hello" })))
                .with_mount("/hello"))
        }
    }

    struct Broken;

    #[async_trait]
    impl ServiceApp for Broken {
        async fn build(&self, _ctx: &WorkerContext) -> Result<ServiceSurface> {
            bail!("missing DATABASE_URL")
        }
    }

    fn local_config() -> (AgentConfig, RouterDispatch) {
        let slot = RouterDispatch::new();
        (
            AgentConfig {
                service_id: "hello".into(),
                worker_id: "w1".into(),
                pid: None,
                serve: Serve::Local(slot.clone()),
            },
            slot,
        )
    }

    async fn next(host: &mut Transport) -> Envelope {
        host.inbound.recv().await.unwrap()
    }

    #[tokio::test]
    async fn agent_walks_through_startup_and_shutdown() {
        let (mut host, worker) = Transport::pair();
        let (config, slot) = local_config();
        let agent = tokio::spawn(run_agent(Arc::new(Hello), worker, config));

        let hello = next(&mut host).await;
        assert!(matches!(
            hello.body,
            Message::Hello { ref subscriptions, .. } if subscriptions == &[Subscription::VersionChanged]
        ));
        host.outbound
            .send(Envelope::reply(1, hello.seq, Message::Ack))
            .unwrap();

        let announce = next(&mut host).await;
        assert!(matches!(
            announce.body,
            Message::RoutesAnnounce { mount: Some(ref m), complete: true, .. } if m == "/hello"
        ));
        let ready = next(&mut host).await;
        assert_eq!(ready.body, Message::Ready { listen: None });
        assert!(slot.is_published());

        host.outbound
            .send(Envelope::new(2, Message::HealthPing { nonce: 4 }))
            .unwrap();
        let pong = next(&mut host).await;
        assert_eq!(pong.reply_to, Some(2));
        assert_eq!(pong.body, Message::HealthPong { nonce: 4 });

        host.outbound
            .send(Envelope::new(3, Message::ShutdownRequest { grace_ms: 100 }))
            .unwrap();
        let ack = next(&mut host).await;
        assert_eq!(ack.reply_to, Some(3));
        agent.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn build_failure_is_reported() {
        let (mut host, worker) = Transport::pair();
        let (config, _slot) = local_config();
        let agent = tokio::spawn(run_agent(Arc::new(Broken), worker, config));

        let hello = next(&mut host).await;
        host.outbound
            .send(Envelope::reply(1, hello.seq, Message::Ack))
            .unwrap();

        let failed = next(&mut host).await;
        assert!(matches!(
            failed.body,
            Message::StartupFailed { ref reason } if reason.contains("DATABASE_URL")
        ));
        assert!(agent.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn refused_handshake_stops_agent() {
        let (mut host, worker) = Transport::pair();
        let (config, _slot) = local_config();
        let agent = tokio::spawn(run_agent(Arc::new(Hello), worker, config));

        let hello = next(&mut host).await;
        host.outbound
            .send(Envelope::reply(
                1,
                hello.seq,
                Message::StartupFailed {
                    reason: "unsupported protocol version".into(),
                },
            ))
            .unwrap();
        let err = agent.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("refused"));
    }

    #[tokio::test]
    async fn losing_the_runtime_shuts_the_worker_down() {
        let (mut host, worker) = Transport::pair();
        let (config, _slot) = local_config();
        let agent = tokio::spawn(run_agent(Arc::new(Hello), worker, config));

        let hello = next(&mut host).await;
        host.outbound
            .send(Envelope::reply(1, hello.seq, Message::Ack))
            .unwrap();
        _ = next(&mut host).await;
        _ = next(&mut host).await;
        drop(host);

        agent.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn version_notices_reach_the_service() {
        let (mut host, worker) = Transport::pair();
        let Transport { outbound, inbound } = worker;
        let link = AgentLink::new(outbound);
        let mut versions = link.subscribe_versions();
        tokio::spawn(serve_control(inbound, link, CancellationToken::new()));

        host.outbound
            .send(Envelope::new(
                9,
                Message::VersionChanged {
                    service_id: "api".into(),
                    version: 2,
                },
            ))
            .unwrap();

        let ack = next(&mut host).await;
        assert_eq!(ack.reply_to, Some(9));
        let notice = versions.recv().await.unwrap();
        assert_eq!(
            notice,
            VersionNotice {
                service_id: "api".into(),
                version: 2
            }
        );
    }
}
