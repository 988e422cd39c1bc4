//! Deferred work queue
//!
//! Producers on any thread enqueue closures; the event loop thread drains
//! them in batches. A batch is swapped out under the lock and run with the
//! lock released, so slow tasks never block producers and tasks queued
//! while a batch runs wait for the next drain.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Unit of work run against the loop's context
pub type Task<C> = Box<dyn FnOnce(&mut C) + Send>;

/// Thread-safe FIFO of tasks for the loop thread
pub struct CommandManager<C> {
    queue: Mutex<VecDeque<Task<C>>>,
    has_data: Condvar,
}

impl<C> Default for CommandManager<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> std::fmt::Debug for CommandManager<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandManager")
            .field("pending", &self.pending())
            .finish()
    }
}

impl<C> CommandManager<C> {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            has_data: Condvar::new(),
        }
    }

    /// Append a task and wake the consumer
    pub fn enqueue<F>(&self, task: F)
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        self.queue.lock().push_back(Box::new(task));
        self.has_data.notify_one();
    }

    /// Number of queued tasks
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Wake a consumer blocked in [`wait_for_work`](Self::wait_for_work)
    pub fn wake(&self) {
        let _guard = self.queue.lock();
        self.has_data.notify_all();
    }

    /// Block until work is queued, `timeout` elapses or `token` is
    /// cancelled. Returns whether work is pending.
    pub fn wait_for_work(&self, timeout: Duration, token: &CancellationToken) -> bool {
        let deadline = Instant::now() + timeout;
        let mut queue = self.queue.lock();
        while queue.is_empty() && !token.is_cancelled() {
            if self.has_data.wait_until(&mut queue, deadline).timed_out() {
                break;
            }
        }
        !queue.is_empty()
    }

    /// Run every task queued right now, in order. Returns how many ran.
    pub fn execute_pending(&self, ctx: &mut C) -> usize {
        let batch = std::mem::take(&mut *self.queue.lock());
        let count = batch.len();
        for task in batch {
            task(ctx);
        }
        if count > 0 {
            trace!("Executed {} queued commands", count);
        }
        count
    }

    /// Wait up to `timeout` for work, then run the batch
    pub fn execute(&self, timeout: Duration, token: &CancellationToken, ctx: &mut C) -> usize {
        self.wait_for_work(timeout, token);
        self.execute_pending(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let manager = CommandManager::<Vec<u32>>::new();
        for i in 0..5 {
            manager.enqueue(move |v: &mut Vec<u32>| v.push(i));
        }
        let mut out = Vec::new();
        assert_eq!(manager.execute_pending(&mut out), 5);
        assert_eq!(out, vec![0, 1, 2, 3, 4]);
        assert_eq!(manager.pending(), 0);
    }

    #[test]
    fn test_tasks_added_during_batch_are_deferred() {
        let manager = Arc::new(CommandManager::<Vec<u32>>::new());
        let inner = manager.clone();
        manager.enqueue(move |v: &mut Vec<u32>| {
            v.push(1);
            inner.enqueue(|v: &mut Vec<u32>| v.push(2));
        });

        let mut out = Vec::new();
        assert_eq!(manager.execute_pending(&mut out), 1);
        assert_eq!(out, vec![1]);
        assert_eq!(manager.pending(), 1);
        assert_eq!(manager.execute_pending(&mut out), 1);
        assert_eq!(out, vec![1, 2]);
    }

    #[test]
    fn test_wait_times_out() {
        let manager = CommandManager::<()>::new();
        let start = Instant::now();
        assert!(!manager.wait_for_work(Duration::from_millis(20), &CancellationToken::new()));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_wait_returns_immediately_with_work() {
        let manager = CommandManager::<()>::new();
        manager.enqueue(|_| {});
        assert!(manager.wait_for_work(Duration::from_secs(10), &CancellationToken::new()));
    }

    #[test]
    fn test_producer_wakes_consumer() {
        let manager = Arc::new(CommandManager::<u32>::new());
        let producer = manager.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.enqueue(|n: &mut u32| *n += 1);
        });

        let mut n = 0;
        let ran = manager.execute(Duration::from_secs(10), &CancellationToken::new(), &mut n);
        handle.join().unwrap();
        // the producer may win the race before the wait starts
        assert!(ran <= 1);
        manager.execute_pending(&mut n);
        assert_eq!(n, 1);
    }

    #[test]
    fn test_cancellation_wakes_wait() {
        let manager = Arc::new(CommandManager::<()>::new());
        let token = CancellationToken::new();
        let waker = manager.clone();
        let cancel = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            cancel.cancel();
            waker.wake();
        });

        let start = Instant::now();
        assert!(!manager.wait_for_work(Duration::from_secs(10), &token));
        assert!(start.elapsed() < Duration::from_secs(10));
        handle.join().unwrap();
    }
}
