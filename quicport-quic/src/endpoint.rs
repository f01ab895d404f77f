//! Per-stream endpoints.
//!
//! A [`StreamEndPoint`] is a thin byte-stream adapter over one QUIC stream
//! id. The session owns its endpoints, keyed by stream id; an endpoint holds
//! the session by weak handle only, so the ownership graph stays acyclic.
//! Each endpoint is bound 1:1 to the protocol object its ALPN-selected
//! factory produced.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use tracing::debug;

use crate::error::{Result, SessionError};
use crate::executor::Task;
use crate::session::QuicSession;
use crate::transport::Shutdown;

/// Upper-protocol hooks for one stream.
pub trait StreamProtocol: Send + Sync {
    /// Data is readable; drain it through the endpoint.
    fn on_readable(&self);

    /// The stream regained send capacity.
    fn on_writable(&self);

    /// The stream or its session is going away.
    fn on_close(&self);
}

/// Builds the protocol object for each new stream of a connection.
pub trait ProtocolFactory: Send + Sync {
    fn new_stream(&self, endpoint: &Arc<StreamEndPoint>) -> Arc<dyn StreamProtocol>;
}

/// ALPN protocol name to factory mapping, consulted at endpoint creation.
#[derive(Default)]
pub struct ProtocolRegistry {
    factories: HashMap<String, Arc<dyn ProtocolFactory>>,
    default: Option<Arc<dyn ProtocolFactory>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, alpn: impl Into<String>, factory: Arc<dyn ProtocolFactory>) {
        self.factories.insert(alpn.into(), factory);
    }

    pub fn set_default(&mut self, factory: Arc<dyn ProtocolFactory>) {
        self.default = Some(factory);
    }

    /// The factory for a negotiated protocol, falling back to the default.
    pub fn resolve(&self, alpn: Option<&str>) -> Option<Arc<dyn ProtocolFactory>> {
        alpn.and_then(|p| self.factories.get(p).cloned())
            .or_else(|| self.default.clone())
    }
}

/// Byte-stream surface over one QUIC stream.
pub struct StreamEndPoint {
    stream_id: u64,
    session: Weak<QuicSession>,
    protocol: OnceLock<Arc<dyn StreamProtocol>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for StreamEndPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEndPoint")
            .field("stream_id", &self.stream_id)
            .field("protocol_bound", &self.protocol.get().is_some())
            .field("closed", &self.closed.load(std::sync::atomic::Ordering::Relaxed))
            .finish()
    }
}

impl StreamEndPoint {
    pub(crate) fn new(stream_id: u64, session: Weak<QuicSession>) -> Self {
        Self {
            stream_id,
            session,
            protocol: OnceLock::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn bind_protocol(&self, protocol: Arc<dyn StreamProtocol>) {
        let _ = self.protocol.set(protocol);
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    fn session(&self) -> Result<Arc<QuicSession>> {
        self.session.upgrade().ok_or(SessionError::Closed)
    }

    fn protocol(&self) -> Option<&Arc<dyn StreamProtocol>> {
        self.protocol.get()
    }

    /// Read received cleartext into `buf`, returning the bytes read.
    pub fn fill(&self, buf: &mut [u8]) -> Result<usize> {
        self.session()?.fill(self.stream_id, buf)
    }

    /// Write cleartext and trigger an egress flush, returning the bytes
    /// accepted.
    pub fn flush(&self, data: &[u8]) -> Result<usize> {
        self.session()?.flush_stream(self.stream_id, data)
    }

    /// Finish the send side and flush.
    pub fn flush_finished(&self) -> Result<()> {
        self.session()?.flush_finished(self.stream_id)
    }

    pub fn is_finished(&self) -> bool {
        self.session()
            .map(|s| s.is_finished(self.stream_id))
            .unwrap_or(true)
    }

    pub fn shutdown_input(&self) -> Result<()> {
        self.session()?.shutdown_stream(self.stream_id, Shutdown::Read)
    }

    pub fn shutdown_output(&self) -> Result<()> {
        self.session()?.shutdown_stream(self.stream_id, Shutdown::Write)
    }

    /// The read task for this stream, run by the session's executor.
    pub(crate) fn on_readable(self: Arc<Self>) -> Task {
        Box::new(move || {
            if let Some(protocol) = self.protocol() {
                protocol.on_readable();
            }
        })
    }

    /// Wake any pending write.
    pub(crate) fn on_writable(&self) {
        if let Some(protocol) = self.protocol() {
            protocol.on_writable();
        }
    }

    /// Close both halves and remove this endpoint from the session.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(stream_id = self.stream_id, "closing stream endpoint");
        if let Ok(session) = self.session() {
            let _ = session.shutdown_stream(self.stream_id, Shutdown::Read);
            let _ = session.shutdown_stream(self.stream_id, Shutdown::Write);
        }
        if let Some(protocol) = self.protocol() {
            protocol.on_close();
        }
        if let Ok(session) = self.session() {
            session.on_stream_close(self.stream_id);
        }
    }

    /// Session-driven teardown; the session already dropped its map entry.
    pub(crate) fn on_session_close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(protocol) = self.protocol() {
            protocol.on_close();
        }
    }
}
