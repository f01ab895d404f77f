//! The opaque QUIC engine interface.
//!
//! The session treats the cryptographic QUIC implementation as a black box
//! that turns ciphertext datagrams into per-stream cleartext and back. The
//! engine is NOT thread-safe: the session serializes every call behind its
//! own lock, one task at a time.

use crate::error::TransportError;

/// Which half of a stream to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Read,
    Write,
}

/// Datagram-level QUIC engine driven by one [`QuicSession`].
///
/// `dispose` releases engine-owned memory (typically native) and must be
/// called exactly once; the session guarantees it runs on every close path.
///
/// [`QuicSession`]: crate::session::QuicSession
pub trait Transport: Send {
    /// Feed one received ciphertext datagram.
    fn feed_cipher(&mut self, datagram: &[u8]) -> Result<(), TransportError>;

    /// Drain pending outgoing ciphertext into `buf`, returning the bytes
    /// written; 0 means nothing to send.
    fn drain_cipher(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Queue cleartext for a stream, returning the bytes accepted.
    fn feed_clear(&mut self, stream_id: u64, data: &[u8]) -> Result<usize, TransportError>;

    /// Read cleartext received on a stream, returning the bytes written to
    /// `buf`; 0 means no data available.
    fn drain_clear(&mut self, stream_id: u64, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Mark a stream's send side finished.
    fn feed_fin(&mut self, stream_id: u64) -> Result<(), TransportError>;

    fn shutdown_stream(&mut self, stream_id: u64, side: Shutdown) -> Result<(), TransportError>;

    fn is_established(&self) -> bool;

    fn is_stream_finished(&self, stream_id: u64) -> bool;

    /// Streams with cleartext ready to read.
    fn readable_stream_ids(&self) -> Vec<u64>;

    /// Streams with send capacity available.
    fn writable_stream_ids(&self) -> Vec<u64>;

    /// Milliseconds until the engine needs [`on_timeout`](Self::on_timeout);
    /// negative means no timeout is pending.
    fn next_timeout(&self) -> i64;

    /// The engine's timeout handler; the caller re-iterates egress after.
    fn on_timeout(&mut self);

    fn is_closed(&self) -> bool;

    /// ALPN protocol negotiated during the handshake, once known.
    fn negotiated_protocol(&self) -> Option<String>;

    /// Release engine-owned memory. Called exactly once.
    fn dispose(&mut self);
}
