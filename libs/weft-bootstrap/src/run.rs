use anyhow::Context;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use weft_runtime::collaborators::CommandBuildRunner;
use weft_runtime::runtime::serve;
use weft_runtime::{LocalProcessBackend, RuntimeContext, management};

use crate::config::ValidatedConfig;
use crate::signals::cancel_on_signal;

/// Run every configured service as a local process until a shutdown signal
/// or a fatal runtime failure.
///
/// # Errors
/// When a service directory is unresolved, a listener cannot be bound, a
/// critical service cannot start, or the runtime ends with a fatal failure.
pub async fn run_server(config: ValidatedConfig) -> anyhow::Result<()> {
    config.ensure_resolved()?;
    if config.store.is_empty() {
        tracing::warn!("No services configured");
    }

    // Root token for the whole process; signals and fatal failures cancel it.
    let cancel = CancellationToken::new();
    let signals = cancel_on_signal(cancel.clone());

    let ingress = TcpListener::bind(config.ingress_addr()?)
        .await
        .context("failed to bind ingress listener")?;
    let management = match config.management_addr()? {
        Some(addr) => Some(
            TcpListener::bind(addr)
                .await
                .context("failed to bind management listener")?,
        ),
        None => None,
    };

    // Children outlive the root token so the runtime can stop them in
    // reverse dependency order; this token only fires once the runtime is done.
    let processes = CancellationToken::new();
    let ctx = RuntimeContext::new(
        config.store.clone(),
        Arc::new(LocalProcessBackend::new(processes.clone())),
        Arc::new(CommandBuildRunner),
        config.runtime_settings(),
        cancel.clone(),
    );

    let mut servers = vec![spawn_server("ingress", ingress, ctx.ingress_router(), &cancel)];
    if let Some(listener) = management {
        servers.push(spawn_server(
            "management",
            listener,
            management::router(ctx.clone()),
            &cancel,
        ));
    }

    let result = ctx.run().await;

    cancel.cancel();
    processes.cancel();
    let mut server_failure = None;
    for server in servers {
        if let Ok(Err(e)) = server.await
            && server_failure.is_none()
        {
            server_failure = Some(e);
        }
    }
    _ = signals.await;

    result.context("runtime stopped with a fatal error")?;
    if let Some(e) = server_failure {
        return Err(e);
    }
    tracing::info!("Runtime stopped");
    Ok(())
}

/// A listener that stops serving on `cancel`; an I/O failure cancels the runtime.
fn spawn_server(
    name: &'static str,
    listener: TcpListener,
    router: axum::Router,
    cancel: &CancellationToken,
) -> JoinHandle<anyhow::Result<()>> {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        let result = serve(listener, router, cancel.clone()).await;
        if let Err(e) = &result {
            tracing::error!(server = name, error = %e, "HTTP server failed");
            cancel.cancel();
        }
        result.with_context(|| format!("{name} server failed"))
    })
}
