//! Server host and connection supervisor.
//!
//! Accepts upgraded transports and spawns one worker per connection.
//! Supervision is one-for-one with temporary workers: a worker that exits —
//! cleanly or by crashing — is removed from the child set and never
//! restarted, because its transport is already gone. The listener is the
//! only fixed child.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async_with_config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, error, info, warn};

use crate::audit::AuditLog;
use crate::config::ServerConfig;
use crate::connection::transport::Transport;
use crate::connection::{ConnectionWorker, WorkerMessage};
use crate::rate_limit::RateLimiter;
use crate::registry::ConnectionRegistry;
use crate::ServerContext;

/// Process-wide monotonic counter backing `conn-N` ids.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

struct WorkerHandle {
    inbox: mpsc::UnboundedSender<WorkerMessage>,
    join: JoinHandle<()>,
}

type WorkerSet = Arc<Mutex<HashMap<String, WorkerHandle>>>;

/// Sends the connection id to the reaper when the worker task ends for any
/// reason, including a panic — unwinding still runs this drop.
struct ExitGuard {
    id: String,
    tx: mpsc::UnboundedSender<String>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(std::mem::take(&mut self.id));
    }
}

pub struct Server {
    ctx: Arc<ServerContext>,
    local_addr: SocketAddr,
    workers: WorkerSet,
    accept_handle: JoinHandle<()>,
    reaper_handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl Server {
    /// Bring the shared services up in dependency order, then bind the
    /// listener. A bind failure unwinds everything already started.
    pub async fn start(config: ServerConfig) -> Result<Server> {
        let audit = AuditLog::new(config.audit.clone());
        let rate_limiter = config.rate_limit.map(RateLimiter::new);
        let registry = ConnectionRegistry::new();

        let bind_addr = (config.host.clone(), config.port);
        let ctx = Arc::new(ServerContext {
            config,
            registry,
            audit,
            rate_limiter,
            started_at: std::time::Instant::now(),
        });

        let workers: WorkerSet = Arc::new(Mutex::new(HashMap::new()));
        let (removal_tx, removal_rx) = mpsc::unbounded_channel();
        let reaper_handle = tokio::spawn(reap_exited_workers(
            workers.clone(),
            ctx.clone(),
            removal_rx,
        ));

        let listener = TcpListener::bind((bind_addr.0.as_str(), bind_addr.1))
            .await
            .with_context(|| format!("failed to bind {}:{}", bind_addr.0, bind_addr.1))?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_handle = tokio::spawn(accept_loop(
            listener,
            ctx.clone(),
            workers.clone(),
            removal_tx,
            shutdown_rx,
        ));

        info!(addr = %local_addr, "server listening");
        Ok(Server {
            ctx,
            local_addr,
            workers,
            accept_handle,
            reaper_handle,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared services, exposed for introspection (registry snapshots,
    /// audit queries).
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Graceful stop: close the listener, post `Shutdown` to every live
    /// worker, wait up to the grace window plus the per-worker terminate
    /// bound, then abort whatever is left.
    pub async fn stop(self) -> Result<()> {
        info!("stopping server");
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<(String, WorkerHandle)> =
            self.workers.lock().await.drain().collect();
        for (_, handle) in &handles {
            let _ = handle.inbox.send(WorkerMessage::Shutdown);
        }

        let bound = Duration::from_millis(
            self.ctx.config.grace_period_ms + self.ctx.config.shutdown_timeout_ms,
        );
        let waits = handles.into_iter().map(|(id, handle)| async move {
            let mut join = handle.join;
            if tokio::time::timeout(bound, &mut join).await.is_err() {
                warn!(connection = %id, "worker did not exit in time — aborting");
                join.abort();
            }
        });
        futures_util::future::join_all(waits).await;

        self.accept_handle.await.ok();
        self.reaper_handle.abort();
        info!("server stopped");
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    workers: WorkerSet,
    removal_tx: mpsc::UnboundedSender<String>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => break,

            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        error!(err = %e, "accept error");
                        continue;
                    }
                };
                let id = format!("conn-{}", NEXT_CONNECTION_ID.fetch_add(1, Ordering::SeqCst));
                debug!(peer = %peer, connection = %id, "new connection");

                let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
                let join = tokio::spawn(run_connection(
                    ctx.clone(),
                    id.clone(),
                    stream,
                    peer,
                    inbox_tx.clone(),
                    inbox_rx,
                    removal_tx.clone(),
                ));
                workers.lock().await.insert(id, WorkerHandle { inbox: inbox_tx, join });
            }
        }
    }
}

async fn run_connection(
    ctx: Arc<ServerContext>,
    id: String,
    stream: TcpStream,
    peer: SocketAddr,
    inbox_tx: mpsc::UnboundedSender<WorkerMessage>,
    inbox_rx: mpsc::UnboundedReceiver<WorkerMessage>,
    removal_tx: mpsc::UnboundedSender<String>,
) {
    let _guard = ExitGuard {
        id: id.clone(),
        tx: removal_tx,
    };

    let ws_config = WebSocketConfig {
        max_message_size: Some(16 * 1024 * 1024), // 16 MB
        max_frame_size: Some(4 * 1024 * 1024),    // 4 MB per frame
        ..Default::default()
    };
    let ws = match accept_async_with_config(stream, Some(ws_config)).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(peer = %peer, err = %e, "websocket handshake failed");
            return;
        }
    };

    let (sink, stream) = ws.split();
    let transport = Transport::start(sink);
    let worker = ConnectionWorker::new(ctx, id, peer.to_string(), transport, inbox_tx, inbox_rx);
    worker.run(stream).await;
}

/// Removes exited workers from the child set. A crashed worker skipped its
/// own terminate, so the shared services are cleaned up here too — both
/// calls are idempotent.
async fn reap_exited_workers(
    workers: WorkerSet,
    ctx: Arc<ServerContext>,
    mut removal_rx: mpsc::UnboundedReceiver<String>,
) {
    while let Some(id) = removal_rx.recv().await {
        workers.lock().await.remove(&id);
        ctx.registry.deregister(&id).await;
        if let Some(limiter) = &ctx.rate_limiter {
            limiter.forget(&id);
        }
        debug!(connection = %id, "worker reaped");
    }
}
