//! Connection abstraction shared by the pacer, correlator and sampler.
//!
//! A `Connection` is split at establishment time:
//! - `sink`: written only by the pacer
//! - `source`: read only by the correlator
//! - `socket`: polled only by the sampler
//!
//! Handles are never patched in place; a reconnect produces a fresh
//! `Connection` whose parts are handed to each owner.

pub mod websocket;

use crate::socket::SocketHandle;
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub use websocket::{WsConnector, ECHO_PATH};

/// Close status sent and expected on a graceful shutdown.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close status reported when the peer closed without a status code.
pub const CLOSE_NO_STATUS: u16 = 1005;

/// Transport-level errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed with status {0}")]
    Closed(u16),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection attempt timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether this is the agreed graceful closure rather than a failure.
    pub fn is_expected_close(&self) -> bool {
        matches!(self, TransportError::Closed(CLOSE_NORMAL))
    }
}

/// Write half of a connection.
#[async_trait]
pub trait MessageSink: Send {
    /// Write one encoded message.
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Send the graceful close frame.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of a connection.
#[async_trait]
pub trait MessageSource: Send {
    /// Read the next encoded message.
    async fn recv(&mut self) -> Result<Bytes, TransportError>;
}

/// A freshly established connection.
pub struct Connection {
    pub sink: Box<dyn MessageSink>,
    pub source: Box<dyn MessageSource>,
    /// OS socket for statistics, when the transport has one.
    pub socket: Option<SocketHandle>,
}

/// Establishes connections, including any protocol handshake.
///
/// Used both at startup and by the resilience manager.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Connection, TransportError>;
}
