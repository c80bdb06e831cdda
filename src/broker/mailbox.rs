//! Per-frame-processor request queue with blocking receive.
//!
//! A mailbox couples a FIFO with a single-slot rendezvous: the broker
//! enqueues without blocking, and the long-poll handler either drains an
//! entry immediately or parks until a push or its deadline wakes it.
//! Delivery is pop-under-lock, so a request reaches at most one poll.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::warn;

use crate::protocol::{Req, now_millis};

/// Pending depth at which a queue is reported; an FP that stopped
/// polling grows its queue until the sweeper evicts it.
const QUEUE_DEPTH_WARN: usize = 1024;

#[derive(Debug, Default)]
struct MailboxInner {
    queue: VecDeque<Req>,
    /// True while a poll is parked. A push signals the rendezvous only
    /// when this is set; a pop re-checks the queue under the lock before
    /// waiting, so a push that lands first is never lost.
    listening: bool,
}

#[derive(Debug)]
pub(crate) struct Mailbox {
    inner: Mutex<MailboxInner>,
    notify: Notify,
    /// Millisecond stamp of the last GET or POST by this FP.
    last_touch_ms: AtomicI64,
}

impl Mailbox {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(MailboxInner::default()),
            notify: Notify::new(),
            last_touch_ms: AtomicI64::new(now_millis()),
        }
    }

    /// Records activity by this FP so the sweeper keeps the mailbox.
    pub(crate) fn touch(&self) {
        self.last_touch_ms.store(now_millis(), Ordering::Release);
    }

    /// Time since the last GET or POST by this FP.
    pub(crate) fn idle(&self) -> Duration {
        let idle_ms = now_millis() - self.last_touch_ms.load(Ordering::Acquire);
        Duration::from_millis(idle_ms.max(0) as u64)
    }

    /// Appends a request. Never blocks; wakes a parked poll if present.
    pub(crate) async fn push(&self, req: Req) {
        let mut inner = self.inner.lock().await;
        inner.queue.push_back(req);
        if inner.queue.len() == QUEUE_DEPTH_WARN {
            warn!(depth = QUEUE_DEPTH_WARN, "mailbox queue depth threshold crossed");
        }
        if inner.listening {
            self.notify.notify_one();
        }
    }

    /// Removes and returns the oldest pending request, waiting up to
    /// `wait` for one to arrive. Returns `None` when the deadline passes
    /// with an empty queue.
    pub(crate) async fn pop(&self, wait: Duration) -> Option<Req> {
        let deadline = Instant::now() + wait;

        loop {
            // The rendezvous future must exist before the lock is
            // released, otherwise a push between unlock and await is
            // missed.
            let notified = {
                let mut inner = self.inner.lock().await;
                if let Some(req) = inner.queue.pop_front() {
                    inner.listening = false;
                    return Some(req);
                }
                inner.listening = true;
                self.notify.notified()
            };

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                break;
            }
            // Woken by a push (possibly a stale permit); loop back and
            // re-check the queue under the lock.
        }

        let mut inner = self.inner.lock().await;
        inner.listening = false;
        inner.queue.pop_front()
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }
}
