//! Task execution.
//!
//! Sessions queue their work on a session-local FIFO and drain it through an
//! [`Executor`]; the executor only decides which thread runs the drain loop.
//! Tests install [`SerialExecutor`] to run everything inline.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use tracing::{debug, warn};

pub type Task = Box<dyn FnOnce() + Send>;

pub trait Executor: Send + Sync {
    fn execute(&self, task: Task);
}

/// Runs tasks inline on the calling thread.
#[derive(Debug, Default)]
pub struct SerialExecutor;

impl Executor for SerialExecutor {
    fn execute(&self, task: Task) {
        task();
    }
}

/// Fixed pool of native worker threads fed over a crossbeam channel.
///
/// Dropping the pool disconnects the channel; workers finish their current
/// task and exit.
pub struct ThreadPoolExecutor {
    sender: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPoolExecutor {
    pub fn new(threads: usize) -> Self {
        assert!(threads > 0, "executor needs at least one thread");
        let (sender, receiver) = unbounded::<Task>();

        let workers = (0..threads)
            .map(|id| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("quic-exec-{id}"))
                    .spawn(move || {
                        while let Ok(task) = receiver.recv() {
                            task();
                        }
                        debug!(worker_id = id, "executor worker exiting");
                    })
                    .expect("spawning executor worker")
            })
            .collect();

        Self {
            sender: Some(sender),
            workers,
        }
    }
}

impl Executor for ThreadPoolExecutor {
    fn execute(&self, task: Task) {
        if let Some(sender) = &self.sender {
            if sender.send(task).is_err() {
                warn!("executor channel disconnected, dropping task");
            }
        }
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn pool_runs_all_tasks() {
        let executor = ThreadPoolExecutor::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let counter = counter.clone();
            executor.execute(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        drop(executor); // joins the workers
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn serial_executor_runs_inline() {
        let counter = Arc::new(AtomicUsize::new(0));
        let executor = SerialExecutor;
        let captured = counter.clone();
        executor.execute(Box::new(move || {
            captured.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
