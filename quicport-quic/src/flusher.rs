//! The iterating egress flusher.
//!
//! A single-writer state machine that drains ciphertext from the engine and
//! writes it to the datagram sink until the engine runs dry: drain, write,
//! repeat. Datagram writes are asynchronous; the flusher parks in `Pending`
//! until the sink completes, then resumes draining. It also owns the one
//! transport timer, re-armed from `next_timeout` on every iteration.
//!
//! Buffer discipline: every acquired cipher buffer is released on every
//! terminal path, whether the write succeeds, fails, or nothing was drained.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::buffer::BufferPool;
use crate::session::{DatagramSink, QuicSession};
use crate::timer::{CyclicTimer, Scheduler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// No ciphertext outstanding; the next event re-iterates.
    Idle,
    /// A thread is inside the drain loop; `again` records iterate requests
    /// that arrived meanwhile.
    Processing { again: bool },
    /// The write issued by the current drain step completed before the step
    /// returned; the loop continues instead of parking.
    Called,
    /// The write issued by the current drain step failed before the step
    /// returned; the loop terminates.
    Failing,
    /// A datagram write is in flight; the completion callback resumes.
    Pending,
    Closed,
}

/// One drain-step outcome.
enum Action {
    Idle,
    Scheduled,
    Close { code: u64, reason: String },
}

pub(crate) struct Flusher {
    session: Weak<QuicSession>,
    state: Mutex<State>,
    timer: CyclicTimer,
    pool: Arc<dyn BufferPool>,
    sink: Arc<dyn DatagramSink>,
    buffer_len: usize,
}

impl Flusher {
    pub(crate) fn new(
        session: Weak<QuicSession>,
        buffer_len: usize,
        scheduler: Arc<dyn Scheduler>,
        pool: Arc<dyn BufferPool>,
        sink: Arc<dyn DatagramSink>,
    ) -> Self {
        let timer_session = session.clone();
        let timer = CyclicTimer::new(
            scheduler,
            Arc::new(move || {
                if let Some(session) = timer_session.upgrade() {
                    trace!("transport timeout expired");
                    session.transport_on_timeout();
                    session.flusher.iterate();
                }
            }),
        );
        Self {
            session,
            state: Mutex::new(State::Idle),
            timer,
            pool,
            sink,
            buffer_len,
        }
    }

    /// Kick the drain loop. While a write is in flight this is a no-op: the
    /// completion callback re-enters the loop and picks up new data.
    pub(crate) fn iterate(&self) {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                State::Idle => *state = State::Processing { again: false },
                State::Processing { ref mut again } => {
                    *again = true;
                    return;
                }
                // An active iteration will drain whatever prompted this.
                State::Called | State::Failing | State::Pending | State::Closed => return,
            }
        }
        self.run();
    }

    /// Stop iterating and kill the timer. Idempotent.
    pub(crate) fn close(&self) {
        *self.state.lock().unwrap() = State::Closed;
        self.timer.destroy();
    }

    /// Write-completion success path.
    fn succeeded(&self) {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                State::Pending => *state = State::Processing { again: false },
                // Completed before the drain step returned.
                State::Processing { .. } => {
                    *state = State::Called;
                    return;
                }
                _ => return,
            }
        }
        self.run();
    }

    /// Write-completion failure path: iteration terminates, the session
    /// stays open for future events.
    fn failed(&self, error: std::io::Error) {
        warn!(%error, "datagram write failed, terminating flush iteration");
        let mut state = self.state.lock().unwrap();
        match *state {
            State::Pending => *state = State::Idle,
            State::Processing { .. } | State::Called => *state = State::Failing,
            _ => {}
        }
    }

    fn run(&self) {
        let Some(session) = self.session.upgrade() else {
            *self.state.lock().unwrap() = State::Closed;
            return;
        };
        loop {
            let action = self.process(&session);
            let mut state = self.state.lock().unwrap();
            match action {
                Action::Idle => {
                    if matches!(*state, State::Processing { again: true }) {
                        *state = State::Processing { again: false };
                        drop(state);
                        continue;
                    }
                    if *state != State::Closed {
                        *state = State::Idle;
                    }
                    return;
                }
                Action::Scheduled => match *state {
                    State::Called => {
                        *state = State::Processing { again: false };
                        drop(state);
                        continue;
                    }
                    State::Failing => {
                        *state = State::Idle;
                        return;
                    }
                    State::Closed => return,
                    _ => {
                        *state = State::Pending;
                        return;
                    }
                },
                Action::Close { code, reason } => {
                    if *state != State::Closed {
                        *state = State::Idle;
                    }
                    drop(state);
                    session.close(code, &reason);
                    return;
                }
            }
        }
    }

    /// One iteration: acquire a cipher buffer, drain, re-arm the timer, and
    /// either hand the buffer to the sink or release it.
    fn process(&self, session: &Arc<QuicSession>) -> Action {
        let mut transport = session.transport_lock();
        let mut buffer = self.pool.acquire(self.buffer_len);

        let drained = match transport.drain_cipher(buffer.as_mut_slice()) {
            Ok(n) => n,
            Err(error) => {
                drop(transport);
                self.pool.release(buffer);
                warn!(%error, "engine failed draining ciphertext");
                return Action::Close {
                    code: error.code,
                    reason: error.reason,
                };
            }
        };

        let next_timeout = transport.next_timeout();
        trace!(drained, next_timeout, "flusher iteration");
        if next_timeout < 0 {
            self.timer.cancel();
        } else {
            self.timer.schedule(Duration::from_millis(next_timeout as u64));
        }

        if drained == 0 {
            let closed = transport.is_closed();
            drop(transport);
            self.pool.release(buffer);
            if closed {
                debug!("engine reports connection closed");
                return Action::Close {
                    code: 0,
                    reason: "connection closed".to_owned(),
                };
            }
            return Action::Idle;
        }

        buffer.set_filled(drained);
        drop(transport);

        let remote = session.remote_addr();
        let weak = self.session.clone();
        let pool = self.pool.clone();
        self.sink.write(
            remote,
            buffer,
            Box::new(move |result, buffer| {
                // The buffer goes back to the pool on both outcomes, and
                // even when the session is already gone.
                pool.release(buffer);
                if let Some(session) = weak.upgrade() {
                    match result {
                        Ok(()) => session.flusher.succeeded(),
                        Err(error) => session.flusher.failed(error),
                    }
                }
            }),
        );
        Action::Scheduled
    }
}
