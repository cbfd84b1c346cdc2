//! Fan-out of one sender's chunk to every other admitted connection.

use std::time::Duration;

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    time::timeout,
};
use tracing::{debug, warn};

use crate::{
    error::DeliveryError,
    registry::{ConnectionId, Registry},
};

/// Rendered broadcasts are cut to this many bytes.
pub const MAX_RENDERED_LEN: usize = 255;

/// One inbound chunk on its way to the other peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    sender: ConnectionId,
    payload: Vec<u8>,
}

impl Envelope {
    pub fn new(sender: ConnectionId, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            sender,
            payload: payload.into(),
        }
    }

    /// Builds an envelope from raw read bytes, dropping one trailing `\n` or
    /// `\r\n`. Nothing else is interpreted: a chunk holding several lines is
    /// relayed as a single message.
    pub fn from_chunk(sender: ConnectionId, chunk: &[u8]) -> Self {
        let payload = chunk
            .strip_suffix(b"\r\n")
            .or_else(|| chunk.strip_suffix(b"\n"))
            .unwrap_or(chunk);
        Self::new(sender, payload)
    }

    pub fn sender(&self) -> ConnectionId {
        self.sender
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// `User(<sender>) -> <payload>`, no terminator.
    pub fn render(&self) -> Vec<u8> {
        let mut rendered = format!("User({}) -> ", self.sender).into_bytes();
        rendered.extend_from_slice(&self.payload);
        rendered.truncate(MAX_RENDERED_LEN);
        rendered
    }
}

#[derive(Debug)]
pub struct DeliveryFailure {
    pub peer: ConnectionId,
    pub error: DeliveryError,
}

/// Outcome of one fan-out, peers in ascending id order.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub delivered: Vec<ConnectionId>,
    pub failed: Vec<DeliveryFailure>,
}

impl DeliveryReport {
    pub fn failed_peers(&self) -> Vec<ConnectionId> {
        self.failed.iter().map(|failure| failure.peer).collect()
    }
}

/// Writes `envelope` to every registered peer except its sender.
///
/// The registry lock is held until the last peer has been tried. A failed or
/// timed-out write is logged and recorded, and the peer stays registered:
/// its own handler removes it once its read side notices.
pub async fn dispatch<W>(
    registry: &Registry<W>,
    envelope: &Envelope,
    write_timeout: Duration,
) -> DeliveryReport
where
    W: AsyncWrite + Unpin + Send,
{
    let message = envelope.render();
    let sender = envelope.sender();
    let mut report = DeliveryReport::default();

    let mut members = registry.lock().await;
    for (&peer, writer) in members.entries.iter_mut() {
        if peer == sender {
            continue;
        }

        match deliver(writer, &message, write_timeout).await {
            Ok(()) => report.delivered.push(peer),
            Err(error) => {
                warn!(%sender, %peer, %error, "failed to deliver message to peer");
                report.failed.push(DeliveryFailure { peer, error });
            }
        }
    }
    drop(members);

    debug!(
        %sender,
        delivered = report.delivered.len(),
        failed = report.failed.len(),
        "broadcast complete"
    );
    report
}

async fn deliver<W>(writer: &mut W, message: &[u8], limit: Duration) -> Result<(), DeliveryError>
where
    W: AsyncWrite + Unpin,
{
    let write = async {
        writer.write_all(message).await?;
        writer.flush().await
    };

    match timeout(limit, write).await {
        Ok(result) => result.map_err(DeliveryError::from),
        Err(_) => Err(DeliveryError::TimedOut(limit)),
    }
}
