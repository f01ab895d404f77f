//! QPACK error types and HTTP/3 error code mappings.
//!
//! Two severities exist: stream errors abort a single request stream, session
//! errors are fatal to the whole connection (RFC 9114 Section 8).

use thiserror::Error;

/// H3_GENERAL_PROTOCOL_ERROR (0x0101).
pub const H3_GENERAL_PROTOCOL_ERROR: u64 = 0x0101;

/// QPACK_DECOMPRESSION_FAILED (0x0200).
pub const QPACK_DECOMPRESSION_FAILED: u64 = 0x0200;

/// QPACK_ENCODER_STREAM_ERROR (0x0201).
pub const QPACK_ENCODER_STREAM_ERROR: u64 = 0x0201;

/// QPACK_DECODER_STREAM_ERROR (0x0202).
pub const QPACK_DECODER_STREAM_ERROR: u64 = 0x0202;

pub type Result<T> = std::result::Result<T, QpackError>;

/// Errors raised by the QPACK encoder.
#[derive(Debug, Error)]
pub enum QpackError {
    /// Per-stream failure. The offending stream is aborted with `code`;
    /// the connection survives.
    #[error("stream error 0x{code:04x}: {reason}")]
    Stream { code: u64, reason: String },

    /// Connection-fatal failure. The session must close with `code`.
    #[error("session error 0x{code:04x}: {reason}")]
    Session { code: u64, reason: String },

    /// Malformed prefix-integer encoding.
    #[error("integer overflow in prefix encoding")]
    IntegerOverflow,

    /// Instruction buffer ended mid-instruction.
    #[error("unexpected end of buffer")]
    UnexpectedEof,

    /// Dynamic table state violation (capacity, referenced eviction).
    #[error("dynamic table error: {0}")]
    DynamicTable(String),
}

impl QpackError {
    pub fn stream(code: u64, reason: impl Into<String>) -> Self {
        QpackError::Stream {
            code,
            reason: reason.into(),
        }
    }

    pub fn session(code: u64, reason: impl Into<String>) -> Self {
        QpackError::Session {
            code,
            reason: reason.into(),
        }
    }
}
