//! Per-connection QUIC session.
//!
//! The session bridges the datagram-level engine to a stream-oriented event
//! model: ingress datagrams are fed to the engine, the resulting readable
//! and writable stream ids become tasks on a session-local FIFO, and a
//! single drainer services that queue so the engine (which is not
//! thread-safe) only ever sees one task at a time. Egress runs through the
//! iterating flusher.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use tracing::{debug, error, trace, warn};

use crate::buffer::{BufferPool, PoolBuffer};
use crate::config::SessionConfig;
use crate::endpoint::{ProtocolRegistry, StreamEndPoint};
use crate::error::{Result, SessionError, GENERAL_PROTOCOL_ERROR};
use crate::executor::{Executor, Task};
use crate::flusher::Flusher;
use crate::timer::Scheduler;
use crate::transport::{Shutdown, Transport};

/// QUIC connection id, kept for logging and listener callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(Bytes);

impl ConnectionId {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Owner notifications. Panics out of the listener are caught and logged; a
/// faulty listener must not kill the session.
pub trait SessionListener: Send + Sync {
    fn on_close(&self, connection_id: &ConnectionId, code: u64, reason: &str);
}

/// Completion for an asynchronous datagram write; the buffer rides along so
/// the flusher can return it to the pool.
pub type WriteCallback = Box<dyn FnOnce(io::Result<()>, PoolBuffer) + Send>;

/// Asynchronous UDP egress.
pub trait DatagramSink: Send + Sync {
    fn write(&self, remote: SocketAddr, datagram: PoolBuffer, on_complete: WriteCallback);
}

pub struct QuicSession {
    /// Handle to ourselves for task closures and endpoint back-references;
    /// set once at construction.
    self_ref: Weak<QuicSession>,
    connection_id: ConnectionId,
    local_addr: SocketAddr,
    remote_addr: Mutex<SocketAddr>,
    transport: Mutex<Box<dyn Transport>>,
    endpoints: Mutex<HashMap<u64, Arc<StreamEndPoint>>>,
    registry: ProtocolRegistry,
    listener: Box<dyn SessionListener>,
    executor: Arc<dyn Executor>,
    queue: Mutex<VecDeque<Task>>,
    draining: AtomicBool,
    pub(crate) flusher: Flusher,
    closed: AtomicBool,
    disposed: AtomicBool,
}

impl QuicSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &SessionConfig,
        connection_id: ConnectionId,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        transport: Box<dyn Transport>,
        registry: ProtocolRegistry,
        listener: Box<dyn SessionListener>,
        executor: Arc<dyn Executor>,
        scheduler: Arc<dyn Scheduler>,
        pool: Arc<dyn BufferPool>,
        sink: Arc<dyn DatagramSink>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            connection_id,
            local_addr,
            remote_addr: Mutex::new(remote_addr),
            transport: Mutex::new(transport),
            endpoints: Mutex::new(HashMap::new()),
            registry,
            listener,
            executor,
            queue: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            flusher: Flusher::new(
                weak.clone(),
                config.datagram_buffer_len,
                scheduler,
                pool,
                sink,
            ),
            closed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        *self.remote_addr.lock().unwrap()
    }

    pub fn is_established(&self) -> bool {
        self.transport.lock().unwrap().is_established()
    }

    pub fn negotiated_protocol(&self) -> Option<String> {
        self.transport.lock().unwrap().negotiated_protocol()
    }

    /// Handle one ingress datagram: feed the engine, then turn its readable
    /// and writable stream ids into queued tasks. All writable streams share
    /// one task; each readable stream gets its own. Before the handshake
    /// completes there are no streams, so just flush the handshake reply.
    pub fn process(&self, remote_addr: SocketAddr, datagram: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }
        *self.remote_addr.lock().unwrap() = remote_addr;

        let ids = {
            let mut transport = self.transport.lock().unwrap();
            if let Err(err) = transport.feed_cipher(datagram) {
                drop(transport);
                error!(session = %self.connection_id, error = %err, "engine rejected datagram");
                self.close(err.code, &err.reason);
                return Err(err.into());
            }
            if transport.is_established() {
                Some((transport.writable_stream_ids(), transport.readable_stream_ids()))
            } else {
                None
            }
        };

        match ids {
            Some((writable, readable)) => {
                trace!(session = %self.connection_id, ?writable, ?readable, "stream events");
                let this = self.arc();
                self.dispatch(Box::new(move || {
                    for stream_id in writable {
                        this.on_writable(stream_id);
                    }
                }));
                for stream_id in readable {
                    let this = self.arc();
                    self.dispatch(Box::new(move || this.on_readable(stream_id)));
                }
            }
            None => self.flush(),
        }
        Ok(())
    }

    /// Owned handle to this session; valid for as long as `&self` is.
    fn arc(&self) -> Arc<QuicSession> {
        self.self_ref.upgrade().expect("session still referenced")
    }

    fn on_writable(&self, stream_id: u64) {
        match self.get_or_create_endpoint(stream_id) {
            Ok(endpoint) => {
                trace!(stream_id, "endpoint writable");
                endpoint.on_writable();
            }
            Err(err) => debug!(stream_id, error = %err, "dropping writable event"),
        }
    }

    fn on_readable(&self, stream_id: u64) {
        match self.get_or_create_endpoint(stream_id) {
            Ok(endpoint) => {
                trace!(stream_id, "endpoint readable");
                let task = endpoint.on_readable();
                task();
            }
            Err(err) => debug!(stream_id, error = %err, "dropping readable event"),
        }
    }

    /// Queue a task and make sure a drainer is running. The first dispatch
    /// hands the drain loop to the executor; tasks run strictly FIFO, one at
    /// a time, so the engine never sees concurrent calls from task context.
    fn dispatch(&self, task: Task) {
        self.queue.lock().unwrap().push_back(task);
        self.wakeup();
    }

    fn wakeup(&self) {
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let this = self.arc();
            self.executor.execute(Box::new(move || this.drain_tasks()));
        }
    }

    fn drain_tasks(&self) {
        loop {
            let task = self.queue.lock().unwrap().pop_front();
            match task {
                Some(task) => task(),
                None => {
                    self.draining.store(false, Ordering::SeqCst);
                    // A dispatch may have raced the store; reclaim the
                    // drainer role or leave it to the racer.
                    if self.queue.lock().unwrap().is_empty() {
                        return;
                    }
                    if self
                        .draining
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_err()
                    {
                        return;
                    }
                }
            }
        }
    }

    /// Create the endpoint for `stream_id`, failing duplicates.
    ///
    /// Stream creation has one canonical site, [`get_or_create_endpoint`]
    /// (compute-if-absent under the map lock); this wrapper is for callers
    /// opening local streams that must not already exist.
    ///
    /// [`get_or_create_endpoint`]: Self::get_or_create_endpoint
    pub fn create_stream(&self, stream_id: u64) -> Result<Arc<StreamEndPoint>> {
        if self.endpoints.lock().unwrap().contains_key(&stream_id) {
            return Err(SessionError::protocol(
                GENERAL_PROTOCOL_ERROR,
                format!("stream {stream_id} already exists"),
            ));
        }
        self.get_or_create_endpoint(stream_id)
    }

    /// Atomically get or create the endpoint for `stream_id`.
    ///
    /// Creation consults the ALPN-selected protocol factory; a connection
    /// whose negotiated protocol nobody can handle is closed with a
    /// protocol error.
    pub fn get_or_create_endpoint(&self, stream_id: u64) -> Result<Arc<StreamEndPoint>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }

        let mut endpoints = self.endpoints.lock().unwrap();
        if let Some(endpoint) = endpoints.get(&stream_id) {
            return Ok(endpoint.clone());
        }

        let alpn = self.transport.lock().unwrap().negotiated_protocol();
        let Some(factory) = self.registry.resolve(alpn.as_deref()) else {
            drop(endpoints);
            let reason = format!(
                "no protocol factory for '{}'",
                alpn.as_deref().unwrap_or("<none>")
            );
            error!(session = %self.connection_id, %reason, "cannot create stream endpoint");
            self.close(GENERAL_PROTOCOL_ERROR, &reason);
            return Err(SessionError::protocol(GENERAL_PROTOCOL_ERROR, reason));
        };

        debug!(stream_id, "creating stream endpoint");
        let endpoint = Arc::new(StreamEndPoint::new(stream_id, self.self_ref.clone()));
        endpoint.bind_protocol(factory.new_stream(&endpoint));
        endpoints.insert(stream_id, endpoint.clone());
        Ok(endpoint)
    }

    /// Read received cleartext for a stream.
    pub fn fill(&self, stream_id: u64, buf: &mut [u8]) -> Result<usize> {
        let mut transport = self.transport.lock().unwrap();
        Ok(transport.drain_clear(stream_id, buf)?)
    }

    /// Queue cleartext for a stream and flush egress.
    pub fn flush_stream(&self, stream_id: u64, data: &[u8]) -> Result<usize> {
        let flushed = {
            let mut transport = self.transport.lock().unwrap();
            transport.feed_clear(stream_id, data)?
        };
        self.flush();
        Ok(flushed)
    }

    /// Finish a stream's send side and flush egress.
    pub fn flush_finished(&self, stream_id: u64) -> Result<()> {
        {
            let mut transport = self.transport.lock().unwrap();
            transport.feed_fin(stream_id)?;
        }
        self.flush();
        Ok(())
    }

    pub fn is_finished(&self, stream_id: u64) -> bool {
        self.transport.lock().unwrap().is_stream_finished(stream_id)
    }

    pub fn shutdown_stream(&self, stream_id: u64, side: Shutdown) -> Result<()> {
        let mut transport = self.transport.lock().unwrap();
        Ok(transport.shutdown_stream(stream_id, side)?)
    }

    /// Drop the endpoint for a finalized stream.
    pub fn on_stream_close(&self, stream_id: u64) {
        self.endpoints.lock().unwrap().remove(&stream_id);
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.lock().unwrap().len()
    }

    /// Kick the egress flusher.
    pub fn flush(&self) {
        self.flusher.iterate();
    }

    /// Close the session: tear down endpoints, stop the flusher, notify the
    /// listener, and dispose the engine. Idempotent, and the engine is
    /// disposed exactly once on every path, even when teardown panics.
    pub fn close(&self, code: u64, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(session = %self.connection_id, code, reason, "closing session");

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let endpoints: Vec<_> = {
                let mut map = self.endpoints.lock().unwrap();
                map.drain().map(|(_, endpoint)| endpoint).collect()
            };
            for endpoint in endpoints {
                endpoint.on_session_close();
            }
            self.flusher.close();
            self.listener.on_close(&self.connection_id, code, reason);
        }));
        if outcome.is_err() {
            warn!(session = %self.connection_id, "session teardown panicked");
        }

        // This releases engine-owned native memory, so it runs no matter
        // what happened above.
        self.dispose_transport();
        debug!(session = %self.connection_id, "session closed");
    }

    fn dispose_transport(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.transport.lock().unwrap().dispose();
        }
    }

    pub(crate) fn transport_lock(&self) -> MutexGuard<'_, Box<dyn Transport>> {
        self.transport.lock().unwrap()
    }

    pub(crate) fn transport_on_timeout(&self) {
        self.transport.lock().unwrap().on_timeout();
    }
}

impl Drop for QuicSession {
    fn drop(&mut self) {
        // Last-resort release; close() normally got here first.
        self.dispose_transport();
    }
}
