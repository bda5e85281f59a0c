//! Transport error taxonomy.
//!
//! Everything here is fatal to the notification channel only. The request/response
//! path of the engine never sees these types.

use std::borrow::Cow;
use std::time::Duration;

use thiserror::Error;

use crate::close::CloseStatus;

/// A malformed frame or an illegal frame sequence.
///
/// Carries the close status the session sends to the peer before dropping the
/// connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (close status {close_status})")]
pub struct ProtocolError {
    pub message: Cow<'static, str>,
    pub close_status: CloseStatus,
}

impl ProtocolError {
    pub fn new(message: impl Into<Cow<'static, str>>, close_status: CloseStatus) -> Self {
        Self {
            message: message.into(),
            close_status,
        }
    }

    /// Shorthand for the generic 1002 protocol violation.
    pub fn violation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(message, CloseStatus::PROTOCOL_ERROR)
    }
}

/// Opening handshake failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("Handshake response is not valid HTTP: {0}")]
    MalformedResponse(&'static str),

    #[error("Handshake rejected with HTTP status {0}, expected 101")]
    UnexpectedStatus(u16),

    #[error("Handshake response is missing the {0} header")]
    MissingHeader(&'static str),

    #[error("Handshake response has Upgrade '{0}', expected 'websocket'")]
    InvalidUpgrade(String),

    #[error("Handshake response has Connection '{0}', expected 'upgrade'")]
    InvalidConnection(String),

    #[error("Sec-WebSocket-Accept does not match the key sent")]
    AcceptMismatch,

    #[error("Handshake response exceeds {limit} bytes")]
    ResponseTooLarge { limit: usize },
}

/// Errors surfaced by the connection driver (logged, then turned into a
/// `Disconnected` state transition).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Invalid notification endpoint '{endpoint}': {reason}")]
    InvalidEndpoint {
        endpoint: String,
        reason: &'static str,
    },

    #[error("Connection closed by peer before the handshake completed")]
    UnexpectedEof,

    #[error("Connection not established within {0:?}")]
    ConnectTimeout(Duration),
}
