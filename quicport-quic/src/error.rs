//! Session error types.

use thiserror::Error;

/// QUIC application error code for a generic protocol violation
/// (H3_GENERAL_PROTOCOL_ERROR, the code sessions close with when no more
/// specific code applies).
pub const GENERAL_PROTOCOL_ERROR: u64 = 0x0101;

/// Internal error code used when the session fails for a local reason.
pub const INTERNAL_ERROR: u64 = 0x0102;

pub type Result<T> = std::result::Result<T, SessionError>;

/// Fatal error surfaced by the opaque QUIC engine.
#[derive(Debug, Clone, Error)]
#[error("transport error 0x{code:x}: {reason}")]
pub struct TransportError {
    pub code: u64,
    pub reason: String,
}

impl TransportError {
    pub fn new(code: u64, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// Errors raised by the session layer.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The engine reported a fatal condition; the session closes with its
    /// code.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level violation detected by the session itself.
    #[error("protocol error 0x{code:x}: {reason}")]
    Protocol { code: u64, reason: String },

    /// Buffer pool or allocation failure; the current iteration fails but
    /// the session stays open.
    #[error("resource error: {0}")]
    Resource(String),

    /// Operation on a session or stream that is already closed.
    #[error("session closed")]
    Closed,
}

impl SessionError {
    pub fn protocol(code: u64, reason: impl Into<String>) -> Self {
        SessionError::Protocol {
            code,
            reason: reason.into(),
        }
    }

    /// The error code this failure closes the connection with.
    pub fn code(&self) -> u64 {
        match self {
            SessionError::Transport(e) => e.code,
            SessionError::Protocol { code, .. } => *code,
            SessionError::Resource(_) | SessionError::Closed => INTERNAL_ERROR,
        }
    }
}
