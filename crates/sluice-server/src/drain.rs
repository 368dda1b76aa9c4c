//! Drain barrier for graceful shutdown.
//!
//! A [`DrainGroup`] counts in-flight work. It starts with one permanent
//! credit so that waiting on it cannot complete before shutdown begins,
//! even while no connection has arrived yet. Shutdown releases that credit
//! once and then waits for the count to reach zero.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

struct Inner {
    credits: AtomicUsize,
    barrier: AtomicBool,
    notify: Notify,
}

/// Counter of in-flight work, shared between the transports and shutdown.
#[derive(Clone)]
pub struct DrainGroup {
    inner: Arc<Inner>,
}

impl DrainGroup {
    /// Creates a group holding only the permanent credit.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                credits: AtomicUsize::new(1),
                barrier: AtomicBool::new(true),
                notify: Notify::new(),
            }),
        }
    }

    /// Takes a credit for one unit of work.
    ///
    /// The credit is returned when the guard is dropped.
    pub fn acquire(&self) -> DrainCredit {
        self.inner.credits.fetch_add(1, Ordering::AcqRel);
        DrainCredit {
            inner: self.inner.clone(),
        }
    }

    /// Releases the permanent credit.
    ///
    /// Returns false if it was already released.
    pub fn release_barrier(&self) -> bool {
        if self.inner.barrier.swap(false, Ordering::AcqRel) {
            self.inner.release();
            true
        } else {
            false
        }
    }

    /// Returns the number of outstanding credits, the barrier included.
    pub fn in_flight(&self) -> usize {
        self.inner.credits.load(Ordering::Acquire)
    }

    /// Waits until every credit has been returned.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Default for DrainGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn release(&self) {
        if self.credits.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.notify.notify_waiters();
        }
    }
}

/// A credit held for one connection or datagram.
pub struct DrainCredit {
    inner: Arc<Inner>,
}

impl Drop for DrainCredit {
    fn drop(&mut self) {
        self.inner.release();
    }
}
