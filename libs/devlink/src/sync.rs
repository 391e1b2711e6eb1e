//! Thread coordination primitives
//!
//! The transports run on plain OS threads. These helpers cover the three
//! patterns they share: a lock acquired with a deadline, a stop flag that
//! can interrupt a sleeping worker, and joining a worker without deadlocking
//! when the join is requested from the worker itself.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::warn;

/// Mutual exclusion with a bounded wait
#[derive(Debug, Default)]
pub struct TimeoutLock {
    inner: Mutex<()>,
}

impl TimeoutLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock, giving up after `timeout`.
    ///
    /// The lock is released when the returned guard is dropped, on every exit path.
    pub fn acquire(&self, timeout: Duration) -> Option<MutexGuard<'_, ()>> {
        self.inner.try_lock_for(timeout)
    }

    /// Acquire the lock without a deadline
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.inner.lock()
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

/// Stop flag with an interruptible wait
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        let mut stopped = self.stopped.lock();
        *stopped = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.stopped.lock() = false;
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleep up to `timeout`; returns `true` if a stop was requested
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            self.cond.wait_while_for(&mut stopped, |stopped| !*stopped, timeout);
        }
        *stopped
    }
}

/// Spawn a named worker thread
pub fn spawn_named<F>(name: impl Into<String>, f: F) -> io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new().name(name.into()).spawn(f)
}

/// Join a worker unless called from that worker
pub fn join_worker(handle: JoinHandle<()>, what: &str) {
    if handle.thread().id() == thread::current().id() {
        return;
    }
    if handle.join().is_err() {
        warn!("{} thread panicked", what);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_timeout_lock_gives_up() {
        let lock = Arc::new(TimeoutLock::new());
        let guard = lock.acquire(Duration::from_millis(10));
        assert!(guard.is_some());

        let other = Arc::clone(&lock);
        let start = Instant::now();
        let handle = thread::spawn(move || other.acquire(Duration::from_millis(50)).is_some());
        assert!(!handle.join().unwrap());
        assert!(start.elapsed() >= Duration::from_millis(50));

        drop(guard);
        assert!(!lock.is_locked());
        assert!(lock.acquire(Duration::from_millis(10)).is_some());
    }

    #[test]
    fn test_stop_signal_interrupts_wait() {
        let signal = Arc::new(StopSignal::new());
        let waiter = Arc::clone(&signal);
        let start = Instant::now();
        let handle = thread::spawn(move || waiter.wait_timeout(Duration::from_secs(10)));

        thread::sleep(Duration::from_millis(20));
        signal.stop();
        assert!(handle.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(5));

        signal.reset();
        assert!(!signal.is_stopped());
        assert!(!signal.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_join_worker_from_itself_returns() {
        let slot: Arc<Mutex<Option<JoinHandle<()>>>> = Arc::new(Mutex::new(None));
        let done = Arc::new(AtomicBool::new(false));

        let inner_slot = Arc::clone(&slot);
        let inner_done = Arc::clone(&done);
        let handle = spawn_named("self-join", move || {
            // wait until the handle is published
            loop {
                if let Some(own) = inner_slot.lock().take() {
                    join_worker(own, "self-join");
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
            inner_done.store(true, Ordering::SeqCst);
        })
        .unwrap();

        let id = handle.thread().id();
        *slot.lock() = Some(handle);
        while !done.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }
        assert_ne!(id, thread::current().id());
    }
}
