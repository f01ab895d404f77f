//! One-shot scheduling and the cyclic transport timer.
//!
//! The flusher owns a single re-armable timeout driving the engine's loss
//! and idle timers. Re-arming cancels the previous deadline, so at most one
//! timer is outstanding per session at any time.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::executor::Task;

/// Identifies a scheduled task for cancellation.
pub type TimerId = u64;

/// One-shot cancellable task scheduling with millisecond resolution.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, task: Task) -> TimerId;

    /// Cancel a pending task. Cancelling an already-fired or unknown id is
    /// a no-op.
    fn cancel(&self, id: TimerId);
}

struct ThreadSchedulerState {
    queue: BTreeMap<(Instant, TimerId), Task>,
    shutdown: bool,
}

/// Scheduler backed by one timer thread and a deadline-ordered queue.
pub struct ThreadScheduler {
    state: Arc<(Mutex<ThreadSchedulerState>, Condvar)>,
    next_id: AtomicU64,
    worker: Option<JoinHandle<()>>,
}

impl ThreadScheduler {
    pub fn new() -> Self {
        let state = Arc::new((
            Mutex::new(ThreadSchedulerState {
                queue: BTreeMap::new(),
                shutdown: false,
            }),
            Condvar::new(),
        ));

        let shared = state.clone();
        let worker = thread::Builder::new()
            .name("quic-timer".to_owned())
            .spawn(move || {
                let (lock, condvar) = &*shared;
                let mut state = lock.lock().unwrap();
                loop {
                    if state.shutdown {
                        return;
                    }
                    let now = Instant::now();
                    match state.queue.first_key_value() {
                        Some((&(deadline, _), _)) if deadline <= now => {
                            let ((_, id), task) = state.queue.pop_first().unwrap();
                            trace!(id, "timer fired");
                            drop(state);
                            task();
                            state = lock.lock().unwrap();
                        }
                        Some((&(deadline, _), _)) => {
                            let wait = deadline - now;
                            state = condvar.wait_timeout(state, wait).unwrap().0;
                        }
                        None => {
                            state = condvar.wait(state).unwrap();
                        }
                    }
                }
            })
            .expect("spawning timer thread");

        Self {
            state,
            next_id: AtomicU64::new(1),
            worker: Some(worker),
        }
    }
}

impl Default for ThreadScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> TimerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + delay;
        let (lock, condvar) = &*self.state;
        lock.lock().unwrap().queue.insert((deadline, id), task);
        condvar.notify_one();
        id
    }

    fn cancel(&self, id: TimerId) {
        let (lock, condvar) = &*self.state;
        let mut state = lock.lock().unwrap();
        state.queue.retain(|&(_, queued_id), _| queued_id != id);
        condvar.notify_one();
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        let (lock, condvar) = &*self.state;
        {
            let mut state = lock.lock().unwrap();
            state.shutdown = true;
            state.queue.clear();
        }
        condvar.notify_one();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// A single re-armable timeout.
///
/// `schedule` replaces any armed deadline; `cancel` is idempotent;
/// `destroy` is terminal and silences late re-arms from racing callbacks.
pub struct CyclicTimer {
    scheduler: Arc<dyn Scheduler>,
    callback: Arc<dyn Fn() + Send + Sync>,
    armed: Mutex<Option<TimerId>>,
    destroyed: AtomicBool,
}

impl CyclicTimer {
    pub fn new(scheduler: Arc<dyn Scheduler>, callback: Arc<dyn Fn() + Send + Sync>) -> Self {
        Self {
            scheduler,
            callback,
            armed: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Arm the timer, cancelling any previous deadline.
    pub fn schedule(&self, delay: Duration) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        let callback = self.callback.clone();
        let mut armed = self.armed.lock().unwrap();
        if let Some(previous) = armed.take() {
            self.scheduler.cancel(previous);
        }
        let id = self
            .scheduler
            .schedule(delay, Box::new(move || callback()));
        *armed = Some(id);
    }

    /// Disarm without destroying.
    pub fn cancel(&self) {
        if let Some(id) = self.armed.lock().unwrap().take() {
            self.scheduler.cancel(id);
        }
    }

    /// Cancel and refuse all future arms.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn scheduled_task_fires() {
        let scheduler = ThreadScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let captured = fired.clone();
        scheduler.schedule(
            Duration::from_millis(5),
            Box::new(move || {
                captured.fetch_add(1, Ordering::SeqCst);
            }),
        );
        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_task_does_not_fire() {
        let scheduler = ThreadScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let captured = fired.clone();
        let id = scheduler.schedule(
            Duration::from_millis(30),
            Box::new(move || {
                captured.fetch_add(1, Ordering::SeqCst);
            }),
        );
        scheduler.cancel(id);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn rearm_replaces_previous_deadline() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(ThreadScheduler::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let captured = fired.clone();
        let timer = CyclicTimer::new(
            scheduler,
            Arc::new(move || {
                captured.fetch_add(1, Ordering::SeqCst);
            }),
        );

        timer.schedule(Duration::from_millis(20));
        timer.schedule(Duration::from_millis(20));
        timer.schedule(Duration::from_millis(20));
        thread::sleep(Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::SeqCst), 1, "re-arm must cancel");
    }

    #[test]
    fn destroyed_timer_refuses_arming() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(ThreadScheduler::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let captured = fired.clone();
        let timer = CyclicTimer::new(
            scheduler,
            Arc::new(move || {
                captured.fetch_add(1, Ordering::SeqCst);
            }),
        );
        timer.destroy();
        timer.schedule(Duration::from_millis(5));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
