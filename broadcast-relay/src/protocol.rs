//! The greeting exchange that gates admission.
//!
//! The client writes a fixed ASCII greeting; the server reads whatever
//! arrived (bounded) and writes those exact bytes back. There is no length
//! prefix and no version negotiation: completing both operations is the
//! whole contract.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::HandshakeError;

pub const GREETING: &[u8] = b"Hola!!";

/// Largest greeting the responder will read in one go.
pub const HANDSHAKE_BUFFER_SIZE: usize = 255;

/// Initiator side: send [`GREETING`] and require a byte-exact echo.
pub async fn send_greeting<S>(stream: &mut S) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(GREETING).await?;
    stream.flush().await?;

    let mut echo = [0u8; GREETING.len()];
    stream
        .read_exact(&mut echo)
        .await
        .map_err(closed_on_eof)?;

    if &echo[..] != GREETING {
        return Err(HandshakeError::EchoMismatch);
    }
    Ok(())
}

/// Responder side: read once and echo back exactly what was received.
///
/// Returns the greeting bytes so callers can log them.
pub async fn receive_greeting<S>(stream: &mut S) -> Result<Vec<u8>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; HANDSHAKE_BUFFER_SIZE];
    let read = stream.read(&mut buf).await?;
    if read == 0 {
        return Err(HandshakeError::Closed);
    }

    let greeting = &buf[..read];
    stream.write_all(greeting).await?;
    stream.flush().await?;
    Ok(greeting.to_vec())
}

fn closed_on_eof(err: io::Error) -> HandshakeError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        HandshakeError::Closed
    } else {
        HandshakeError::Io(err)
    }
}
