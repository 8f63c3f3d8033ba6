//! Blocking primitives used by the socket's synchronous API.
//!
//! - [`Semaphore`]: counting semaphore with optional timeout.
//! - [`completion`]: one-shot hand-off of a request's result from the
//!   socket (which owns the request) to the thread blocked on it.
//!
//! ```text
//!   caller thread                    transport thread
//!   ─────────────                    ────────────────
//!   (tx, rx) = completion()
//!   enqueue Request { waiter: tx } ─▶ queue owns request
//!   rx.wait() ... blocked            request finishes
//!                                    tx.complete(result)
//!   ◀──────── result ───────────────
//! ```
//!
//! A sender dropped without completing (socket torn down, request
//! discarded) wakes the waiter with [`NetError::Cancelled`].

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::error::{NetError, Result};

/// Counting semaphore.
#[derive(Debug, Default)]
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    /// Create a semaphore with `initial` permits.
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    /// Take a permit, blocking until one is available.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }

    /// Take a permit, giving up after `timeout`.
    ///
    /// Returns `false` if no permit became available in time.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count == 0 {
            if self.cond.wait_until(&mut count, deadline).timed_out() && *count == 0 {
                return false;
            }
        }
        *count -= 1;
        true
    }

    /// Release a permit, waking one waiter.
    pub fn signal(&self) {
        *self.count.lock() += 1;
        self.cond.notify_one();
    }
}

#[derive(Debug)]
struct Slot<T> {
    value: Mutex<Option<Result<T>>>,
    ready: Semaphore,
}

/// Producer half of a completion channel. Completes at most once.
#[derive(Debug)]
pub struct CompletionSender<T> {
    slot: Option<Arc<Slot<T>>>,
}

/// Consumer half of a completion channel.
#[derive(Debug)]
pub struct CompletionReceiver<T> {
    slot: Arc<Slot<T>>,
}

/// Create a connected sender/receiver pair.
pub fn completion<T>() -> (CompletionSender<T>, CompletionReceiver<T>) {
    let slot = Arc::new(Slot {
        value: Mutex::new(None),
        ready: Semaphore::new(0),
    });
    (
        CompletionSender {
            slot: Some(Arc::clone(&slot)),
        },
        CompletionReceiver { slot },
    )
}

impl<T> CompletionSender<T> {
    /// Deliver the result and wake the receiver.
    pub fn complete(mut self, result: Result<T>) {
        if let Some(slot) = self.slot.take() {
            *slot.value.lock() = Some(result);
            slot.ready.signal();
        }
    }
}

impl<T> Drop for CompletionSender<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            *slot.value.lock() = Some(Err(NetError::Cancelled));
            slot.ready.signal();
        }
    }
}

impl<T> CompletionReceiver<T> {
    /// Block until the result arrives.
    pub fn wait(self) -> Result<T> {
        self.slot.ready.wait();
        self.take()
    }

    /// Block until the result arrives or `timeout` expires.
    ///
    /// On expiry the receiver is handed back so the caller can cancel the
    /// underlying work and then collect the final outcome.
    pub fn wait_timeout(self, timeout: Duration) -> std::result::Result<Result<T>, Self> {
        if self.slot.ready.wait_timeout(timeout) {
            Ok(self.take())
        } else {
            Err(self)
        }
    }

    fn take(&self) -> Result<T> {
        self.slot
            .value
            .lock()
            .take()
            .unwrap_or(Err(NetError::Cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_semaphore_signal_then_wait() {
        let sem = Semaphore::new(0);
        sem.signal();
        sem.signal();
        sem.wait();
        assert!(sem.wait_timeout(Duration::from_millis(10)));
        assert!(!sem.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_semaphore_wakes_other_thread() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.wait_timeout(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        sem.signal();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_completion_delivers_value() {
        let (tx, rx) = completion::<u32>();
        thread::spawn(move || tx.complete(Ok(7)));
        assert_eq!(rx.wait(), Ok(7));
    }

    #[test]
    fn test_dropped_sender_cancels() {
        let (tx, rx) = completion::<u32>();
        drop(tx);
        assert_eq!(rx.wait(), Err(NetError::Cancelled));
    }

    #[test]
    fn test_wait_timeout_returns_receiver() {
        let (tx, rx) = completion::<u32>();
        let rx = rx.wait_timeout(Duration::from_millis(10)).unwrap_err();
        tx.complete(Err(NetError::Timeout));
        assert_eq!(rx.wait(), Err(NetError::Timeout));
    }
}
