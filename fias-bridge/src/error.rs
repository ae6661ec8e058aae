//! Error types for the bridge server.

use std::net::SocketAddr;

use fias_protocol::ProtocolError;
use thiserror::Error;

/// Errors surfaced by the connection manager, supervisor and link handle.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The listening socket could not be bound.
    #[error("Failed to bind FIAS listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Accepting a connection failed in a way the accept loop cannot recover from.
    #[error("Accept loop failed: {0}")]
    Accept(#[source] std::io::Error),

    /// No PMS session is connected.
    #[error("PMS is not connected")]
    NotConnected,

    /// The session ended before the frame could be queued.
    #[error("Session closed")]
    SessionClosed,

    /// The record could not be encoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl BridgeError {
    /// Returns true if the error is a bind failure, which is never retried.
    pub fn is_bind(&self) -> bool {
        matches!(self, BridgeError::Bind { .. })
    }
}
