//! Typed failures for each stage of a connection's life.
//!
//! Every variant here is contained by the task that owns the connection;
//! none of them ever reaches the listener loop.

use std::{io, time::Duration};

use thiserror::Error;

use crate::registry::ConnectionId;

/// The greeting exchange did not complete; the stream is closed unadmitted.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("connection closed during handshake")]
    Closed,
    #[error("greeting echo did not match what was sent")]
    EchoMismatch,
    #[error("handshake timed out after {0:?}")]
    TimedOut(Duration),
    #[error("handshake i/o error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("registry is full ({capacity} connections)")]
    CapacityExceeded { capacity: usize },
    #[error("connection {0} is already registered")]
    AlreadyRegistered(ConnectionId),
    #[error("registry is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("admission rejected: {0}")]
    Registry(#[from] RegistryError),
}

/// A single peer write during fan-out failed. Delivery to other peers goes on.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("write failed: {0}")]
    Io(#[from] io::Error),
    #[error("write timed out after {0:?}")]
    TimedOut(Duration),
}
