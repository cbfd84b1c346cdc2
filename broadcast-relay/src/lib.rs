//! TCP text relay: every chunk a client sends is rebroadcast to every other
//! connected client as `User(<id>) -> <payload>`.
//!
//! Each module focuses on one responsibility:
//!
//! - [`protocol`] is the greeting exchange a connection must finish before
//!   it is admitted.
//! - [`registry`] holds the write half of every admitted connection behind a
//!   single lock, bounded by a configured capacity.
//! - [`dispatcher`] fans one inbound chunk out to all other members.
//! - [`handler`] drives one connection from greeting to cleanup.
//! - [`server`] accepts connections, supervises handler tasks and performs
//!   shutdown.
//! - [`client`] is the terminal client; [`cli`] parses both modes.
//!
//! There is no message framing: whatever one read returns is relayed as one
//! message, so a chunk may hold part of a line or several lines.

pub mod cli;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod shutdown;
