// src/server/connection_loop.rs

//! The accept loop and graceful shutdown.

use super::context::ServerContext;
use super::listener::AnyListener;
use super::stream::AnyStream;
use crate::connection;
use crate::core::metrics;
use anyhow::{Result, anyhow};
use std::future::Future;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const ACCEPT_QUEUE: usize = 256;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Runs until SIGINT or SIGTERM. SIGHUP is caught and ignored.
pub async fn run(ctx: ServerContext) -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow!("Failed to register SIGINT handler: {}", e))?;
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow!("Failed to register SIGTERM handler: {}", e))?;
    let mut sighup = signal(SignalKind::hangup())
        .map_err(|e| anyhow!("Failed to register SIGHUP handler: {}", e))?;

    let shutdown = async move {
        loop {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("SIGINT received, initiating graceful shutdown.");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("SIGTERM received, initiating graceful shutdown.");
                    break;
                }
                _ = sighup.recv() => {
                    info!("SIGHUP received and ignored.");
                }
            }
        }
    };

    serve_until(ctx, shutdown).await;
    Ok(())
}

/// Accepts and serves connections until `shutdown` completes, then shuts
/// down gracefully.
pub async fn serve_until<F>(ctx: ServerContext, shutdown: F)
where
    F: Future<Output = ()>,
{
    let local_paths = ctx.local_paths();
    let ServerContext {
        proxy,
        listeners,
        shutdown_tx,
    } = ctx;

    let mut background_tasks = JoinSet::new();
    {
        let proxy = proxy.clone();
        let rx = shutdown_tx.subscribe();
        background_tasks.spawn(async move { proxy.callbacks().run(rx).await });
    }
    {
        let proxy = proxy.clone();
        let rx = shutdown_tx.subscribe();
        background_tasks.spawn(async move { proxy.run_pending_flusher(rx).await });
    }

    let keepalive = proxy.config().listen.keepalive;
    let (accept_tx, mut accept_rx) = mpsc::channel(ACCEPT_QUEUE);
    let mut accept_tasks = JoinSet::new();
    for listener in listeners {
        accept_tasks.spawn(accept_loop(
            listener,
            keepalive,
            accept_tx.clone(),
            shutdown_tx.subscribe(),
        ));
    }
    drop(accept_tx);

    let mut client_tasks = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => break,

            accepted = accept_rx.recv() => {
                let Some((stream, peer)) = accepted else {
                    error!("All listeners have stopped accepting connections.");
                    break;
                };
                info!("Accepted new connection from: {}", peer);
                metrics::CONNECTIONS_RECEIVED_TOTAL.inc();
                let client = connection::spawn(
                    proxy.clone(),
                    stream,
                    peer,
                    shutdown_tx.subscribe(),
                    &mut client_tasks,
                );
                // The accept path's own reference.
                client.put();
            }

            Some(res) = client_tasks.join_next() => {
                if let Err(e) = res
                    && e.is_panic()
                {
                    error!("A client handler panicked: {e:?}");
                }
            }
        }
    }

    info!("Shutting down: no longer accepting connections.");
    accept_tasks.abort_all();
    while accept_tasks.join_next().await.is_some() {}

    let remaining = proxy.flush_pending();
    debug!("{} connections still pending secure output before close", remaining);

    info!("Sending shutdown signal to all tasks.");
    if shutdown_tx.send(()).is_err() {
        warn!("No tasks were listening for the shutdown signal.");
    }

    if tokio::time::timeout(SHUTDOWN_GRACE, async {
        while client_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("Timed out waiting for client connections to close.");
        client_tasks.shutdown().await;
    }
    info!("All client connections closed.");

    if tokio::time::timeout(SHUTDOWN_GRACE, async {
        while background_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("Timed out waiting for background tasks to finish cleanly.");
    }

    proxy.shutdown();
    for path in local_paths {
        match std::fs::remove_file(&path) {
            Ok(()) => debug!("Removed local socket {}", path.display()),
            Err(e) => warn!("Failed to remove local socket {}: {}", path.display(), e),
        }
    }
    info!("Server shutdown complete.");
}

async fn accept_loop(
    listener: AnyListener,
    keepalive: Duration,
    accepted: mpsc::Sender<(AnyStream, String)>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let name = listener.describe();
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            res = listener.accept(keepalive) => match res {
                Ok(conn) => {
                    if accepted.send(conn).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to accept connection on {}: {}", name, e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
    debug!("Listener {} stopped", name);
}
