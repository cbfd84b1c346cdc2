use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
    select,
    task::{JoinError, JoinSet},
    time::{Instant, timeout_at},
};
use tracing::{debug, info, warn};

use crate::{
    config::RelayConfig,
    handler::{RelayContext, admit},
    registry::{ConnectionId, ConnectionIds, Registry},
    shutdown::{self, Shutdown},
};

pub type TcpRegistry = Registry<OwnedWriteHalf>;

type Context = RelayContext<OwnedWriteHalf>;

/// What shutdown did, returned once by [`RelayServer::run_until`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Connections still registered when shutdown began, all of which were
    /// closed. Handlers leave their entries to shutdown, so this is every
    /// client that had not already disconnected.
    pub closed_connections: usize,
    /// Handler tasks that finished on their own while draining.
    pub joined_handlers: usize,
    /// Handler tasks still running after the drain timeout.
    pub aborted_handlers: usize,
}

pub struct RelayServer {
    listener: TcpListener,
    ctx: Arc<Context>,
    ids: ConnectionIds,
}

impl RelayServer {
    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        Self {
            listener,
            ctx: Arc::new(RelayContext::new(config, Shutdown::new())),
            ids: ConnectionIds::new(),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared handle to the connection registry.
    pub fn registry(&self) -> Arc<TcpRegistry> {
        Arc::clone(&self.ctx.registry)
    }

    /// Triggering the returned handle stops a running server.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.ctx.shutdown.clone()
    }

    /// Accepts connections until `shutdown` resolves or the shutdown handle
    /// is triggered, then closes every admitted connection and waits for the
    /// handler tasks.
    pub async fn run_until<F>(self, shutdown: F) -> Result<ShutdownReport>
    where
        F: Future<Output = ()> + Send,
    {
        let RelayServer { listener, ctx, ids } = self;
        let mut triggered = ctx.shutdown.subscribe();
        let mut handlers = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                _ = triggered.wait() => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &ctx, &ids, &mut handlers);
                }
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    reap_handler(joined);
                }
            }
        }

        drop(listener);
        Ok(shutdown_connections(&ctx, handlers).await)
    }

    /// Signal handlers are installed when this is called, not when the
    /// returned future is first polled.
    pub fn run_until_signal(self) -> impl Future<Output = Result<ShutdownReport>> + Send {
        self.run_until(shutdown::wait_for_signal())
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    ctx: &Arc<Context>,
    ids: &ConnectionIds,
    handlers: &mut JoinSet<()>,
) {
    match result {
        Ok((stream, peer)) => {
            let id = ids.next_id();
            debug!(%id, %peer, "accepted connection");
            handlers.spawn(serve_connection(stream, peer, id, Arc::clone(ctx)));
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, id: ConnectionId, ctx: Arc<Context>) {
    let mut shutdown = ctx.shutdown.subscribe();

    let admitted = select! {
        _ = shutdown.wait() => {
            debug!(%id, %peer, "shutdown before admission");
            return;
        }
        admitted = admit(stream, id, Arc::clone(&ctx)) => admitted,
    };

    match admitted {
        Ok(handler) => {
            info!(%id, %peer, "client admitted");
            handler.run().await;
        }
        Err(err) => warn!(%id, %peer, error = %err, "connection rejected"),
    }
}

fn reap_handler(joined: Result<(), JoinError>) {
    if let Err(err) = joined {
        if err.is_panic() {
            warn!(error = ?err, "connection handler panicked");
        }
    }
}

async fn shutdown_connections(ctx: &Context, mut handlers: JoinSet<()>) -> ShutdownReport {
    ctx.shutdown.trigger();

    // one deadline covers closing the registry and draining the handlers
    let limit = ctx.config.drain_timeout;
    let deadline = Instant::now() + limit;

    let closed_connections = match timeout_at(deadline, ctx.registry.close_all()).await {
        Ok(closed) => closed,
        Err(_) => {
            warn!("registry still locked after {limit:?}, connections left to their handlers");
            0
        }
    };
    info!(closed = closed_connections, "relay shutting down");

    let mut joined_handlers = 0;
    let drained = timeout_at(deadline, async {
        while let Some(joined) = handlers.join_next().await {
            reap_handler(joined);
            joined_handlers += 1;
        }
    })
    .await;

    let mut aborted_handlers = 0;
    if drained.is_err() {
        aborted_handlers = handlers.len();
        warn!(remaining = aborted_handlers, "aborting handlers still running after {limit:?}");
        handlers.shutdown().await;
    }

    ShutdownReport {
        closed_connections,
        joined_handlers,
        aborted_handlers,
    }
}
