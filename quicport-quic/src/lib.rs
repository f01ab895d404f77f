//! Per-connection QUIC session multiplexer.
//!
//! Bridges a datagram-level cryptographic QUIC engine (the [`Transport`]
//! trait, not thread-safe by contract) to a stream-oriented event model:
//!
//! - ingress datagrams become per-stream readable/writable tasks on a
//!   session-local FIFO, serviced one at a time;
//! - egress runs through an iterating flusher that drains ciphertext into
//!   pooled buffers and writes them asynchronously;
//! - the flusher owns the single re-armable transport timer;
//! - thin [`StreamEndPoint`]s expose a byte-stream surface per stream id,
//!   created lazily from the ALPN-selected [`ProtocolFactory`].
//!
//! Sessions are independent and run fully in parallel; within a session the
//! task queue serializes all engine access.

pub mod buffer;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod executor;
mod flusher;
pub mod session;
pub mod timer;
pub mod transport;

pub use buffer::{BufferPool, FreelistPool, PoolBuffer, MIN_DATAGRAM_LEN};
pub use config::SessionConfig;
pub use endpoint::{ProtocolFactory, ProtocolRegistry, StreamEndPoint, StreamProtocol};
pub use error::{Result, SessionError, TransportError};
pub use executor::{Executor, SerialExecutor, Task, ThreadPoolExecutor};
pub use session::{ConnectionId, DatagramSink, QuicSession, SessionListener, WriteCallback};
pub use timer::{CyclicTimer, Scheduler, ThreadScheduler, TimerId};
pub use transport::{Shutdown, Transport};
