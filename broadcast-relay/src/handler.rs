//! Per-connection lifecycle: greeting, admission, relaying, cleanup.
//!
//! ```text
//! Handshaking --> Active --> Closing --> Closed
//!      \______________________________/
//!           (handshake or admission failed)
//! ```

use std::{fmt, io, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    config::RelayConfig,
    dispatcher::{Envelope, dispatch},
    error::{AdmissionError, HandshakeError},
    protocol::receive_greeting,
    registry::{ConnectionId, Registry},
    shutdown::{Shutdown, ShutdownListener},
};

/// Largest chunk relayed from a single read.
pub const MAX_CHUNK_SIZE: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Handshaking,
    Active,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn can_advance_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Handshaking, Active) | (Handshaking, Closed) | (Active, Closing) | (Closing, Closed)
        )
    }
}

/// Why an active connection left.
#[derive(Debug)]
pub enum DisconnectReason {
    /// The peer closed its side of the stream.
    Disconnected,
    ReadFailed(io::Error),
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Disconnected => write!(f, "peer disconnected"),
            DisconnectReason::ReadFailed(err) => write!(f, "read failed: {err}"),
            DisconnectReason::Shutdown => write!(f, "server shutting down"),
        }
    }
}

/// State shared by the listener and every handler task.
pub struct RelayContext<W> {
    pub registry: Arc<Registry<W>>,
    pub config: RelayConfig,
    pub shutdown: Shutdown,
}

impl<W> RelayContext<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(config: RelayConfig, shutdown: Shutdown) -> Self {
        Self {
            registry: Arc::new(Registry::new(config.capacity)),
            config,
            shutdown,
        }
    }
}

/// Runs the greeting on a fresh stream and registers its write half.
///
/// This is the `Handshaking` state: a [`ConnectionHandler`] only exists for
/// a connection that made it to `Active`. Any failure drops the stream,
/// taking the connection straight to `Closed` without ever having been
/// visible to a broadcast.
pub async fn admit(
    mut stream: TcpStream,
    id: ConnectionId,
    ctx: Arc<RelayContext<OwnedWriteHalf>>,
) -> Result<ConnectionHandler<OwnedReadHalf, OwnedWriteHalf>, AdmissionError> {
    let limit = ctx.config.handshake_timeout;
    let greeting = match timeout(limit, receive_greeting(&mut stream)).await {
        Ok(result) => result.map_err(|err| handshake_failed(id, err))?,
        Err(_) => return Err(handshake_failed(id, HandshakeError::TimedOut(limit))),
    };
    debug!(%id, bytes = greeting.len(), "handshake complete");

    let (reader, writer) = stream.into_split();
    if let Err(err) = ctx.registry.add(id, writer).await {
        debug!(%id, state = ?ConnectionState::Closed, error = %err, "admission refused");
        return Err(err.into());
    }

    Ok(ConnectionHandler::new(id, reader, ctx))
}

fn handshake_failed(id: ConnectionId, err: HandshakeError) -> AdmissionError {
    debug!(%id, state = ?ConnectionState::Closed, error = %err, "handshake failed");
    err.into()
}

/// Owns the read half of one admitted connection.
pub struct ConnectionHandler<R, W> {
    id: ConnectionId,
    reader: R,
    state: ConnectionState,
    ctx: Arc<RelayContext<W>>,
    shutdown: ShutdownListener,
}

impl<R, W> ConnectionHandler<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Wraps a connection whose writer is already in `ctx.registry`.
    pub fn new(id: ConnectionId, reader: R, ctx: Arc<RelayContext<W>>) -> Self {
        let shutdown = ctx.shutdown.subscribe();
        Self {
            id,
            reader,
            state: ConnectionState::Active,
            ctx,
            shutdown,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Relays inbound chunks until the connection ends, then deregisters it.
    ///
    /// On shutdown the entry is left for [`Registry::close_all`], which
    /// closes and counts every member in one pass.
    pub async fn run(mut self) -> DisconnectReason {
        let reason = self.relay_until_closed().await;

        self.advance(ConnectionState::Closing);
        if !matches!(reason, DisconnectReason::Shutdown) {
            self.ctx.registry.remove(self.id).await;
        }
        self.advance(ConnectionState::Closed);

        info!(id = %self.id, %reason, "connection closed");
        reason
    }

    async fn relay_until_closed(&mut self) -> DisconnectReason {
        let mut buf = [0u8; MAX_CHUNK_SIZE];

        loop {
            let read = select! {
                _ = self.shutdown.wait() => return DisconnectReason::Shutdown,
                read = self.reader.read(&mut buf) => read,
            };

            let n = match read {
                Ok(0) => return DisconnectReason::Disconnected,
                Ok(n) => n,
                Err(err) => return DisconnectReason::ReadFailed(err),
            };

            // a fan-out stuck on slow peers must not hold up shutdown
            select! {
                _ = self.shutdown.wait() => return DisconnectReason::Shutdown,
                _ = relay_chunk(self.id, &self.ctx, &buf[..n]) => {}
            }
        }
    }

    fn advance(&mut self, next: ConnectionState) {
        if !self.state.can_advance_to(next) {
            warn!(id = %self.id, from = ?self.state, to = ?next, "unexpected state transition");
        }
        self.state = next;
    }
}

async fn relay_chunk<W>(id: ConnectionId, ctx: &RelayContext<W>, chunk: &[u8])
where
    W: AsyncWrite + Unpin + Send,
{
    let envelope = Envelope::from_chunk(id, chunk);
    if envelope.is_empty() {
        return;
    }

    debug!(%id, bytes = envelope.payload().len(), "relaying chunk");
    dispatch(&ctx.registry, &envelope, ctx.config.write_timeout).await;
}
