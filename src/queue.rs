//! Outbound message queue
//!
//! Application messages wait here until the packet assembler drains them.
//! Enqueue reports whether enough data has built up to wake the packet
//! sender early. The queue has its own lock; it never needs the session lock.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::PeerConfig;
use crate::error::PeerError;

/// Per-item framing overhead counted towards the wake threshold
pub const ITEM_OVERHEAD_BYTES: usize = 2;

// ============================================================================
// Callbacks
// ============================================================================

/// Completion notifications for one queued message
///
/// Implementations must not block and must not call back into the session.
pub trait SendCallback: Send + Sync {
    /// Handed to the transport
    fn sent(&self) {}
    /// Peer acknowledged the packet carrying it
    fn acknowledged(&self) {}
    /// Connection went away before acknowledgment
    fn disconnected(&self) {}
    /// The session hit an unrecoverable error
    fn fatal_error(&self) {}
}

// ============================================================================
// Message Item
// ============================================================================

/// One queued message
#[derive(Clone)]
pub struct MessageItem {
    pub data: Vec<u8>,
    pub callbacks: Vec<Arc<dyn SendCallback>>,
    /// Bytes already counted in the traffic totals
    pub already_reported_bytes: bool,
    pub enqueued_at: u64,
}

impl MessageItem {
    pub fn new(data: Vec<u8>, now: u64) -> Self {
        Self {
            data,
            callbacks: Vec::new(),
            already_reported_bytes: false,
            enqueued_at: now,
        }
    }

    pub fn with_callback(mut self, callback: Arc<dyn SendCallback>) -> Self {
        self.callbacks.push(callback);
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn notify_sent(&self) {
        self.callbacks.iter().for_each(|cb| cb.sent());
    }

    pub fn notify_acknowledged(&self) {
        self.callbacks.iter().for_each(|cb| cb.acknowledged());
    }

    pub fn notify_disconnected(&self) {
        self.callbacks.iter().for_each(|cb| cb.disconnected());
    }

    pub fn notify_fatal(&self) {
        self.callbacks.iter().for_each(|cb| cb.fatal_error());
    }
}

impl std::fmt::Debug for MessageItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageItem")
            .field("len", &self.data.len())
            .field("callbacks", &self.callbacks.len())
            .field("enqueued_at", &self.enqueued_at)
            .finish()
    }
}

// ============================================================================
// Queue
// ============================================================================

struct QueueInner {
    items: VecDeque<MessageItem>,
    next_requeue_log: u64,
}

pub struct MessageQueue {
    inner: Mutex<QueueInner>,
    wake_threshold: usize,
    requeue_log_threshold: usize,
    requeue_log_interval: u64,
}

impl MessageQueue {
    pub fn new(config: &PeerConfig) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                next_requeue_log: 0,
            }),
            wake_threshold: config.wake_threshold_bytes,
            requeue_log_threshold: config.requeue_log_threshold,
            requeue_log_interval: config.requeue_log_interval,
        }
    }

    /// Append a message; true if the packet sender should be woken
    pub fn enqueue(&self, item: MessageItem) -> bool {
        let mut inner = self.inner.lock();
        inner.items.push_back(item);
        // Only scan far enough to know we crossed the threshold
        let mut x = 0usize;
        for queued in inner.items.iter() {
            x += queued.len() + ITEM_OVERHEAD_BYTES;
            if x > self.wake_threshold {
                return true;
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Total payload bytes waiting
    pub fn queued_bytes(&self) -> usize {
        self.inner.lock().items.iter().map(MessageItem::len).sum()
    }

    /// Remove and return everything queued
    pub fn drain_all(&self) -> Vec<MessageItem> {
        self.inner.lock().items.drain(..).collect()
    }

    /// Put messages back after a failed transmission
    pub fn requeue(&self, items: Vec<MessageItem>, reason: &str, dont_log: bool, now: u64) {
        if items.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        let count = items.len();
        if !dont_log {
            if count > self.requeue_log_threshold {
                if now >= inner.next_requeue_log {
                    log::info!("Requeueing {} messages: {}", count, reason);
                    inner.next_requeue_log = now + self.requeue_log_interval;
                }
            } else {
                log::debug!("Requeueing {} messages: {}", count, reason);
            }
        }
        inner.items.extend(items);
    }

    /// Remove every item that carries callbacks, keeping the rest queued
    pub fn take_with_callbacks(&self) -> Vec<MessageItem> {
        let mut inner = self.inner.lock();
        let (with_cb, without_cb): (VecDeque<MessageItem>, VecDeque<MessageItem>) = inner
            .items
            .drain(..)
            .partition(|item| !item.callbacks.is_empty());
        inner.items = without_cb;
        with_cb.into_iter().collect()
    }
}

// ============================================================================
// Synchronous Send
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncOutcome {
    Acknowledged,
    Disconnected,
    Fatal,
}

/// Callback that lets a sender block until its message is acknowledged
#[derive(Default)]
pub struct SyncSendWaiter {
    outcome: Mutex<Option<SyncOutcome>>,
    cond: Condvar,
}

impl SyncSendWaiter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn finish(&self, outcome: SyncOutcome) {
        let mut guard = self.outcome.lock();
        if guard.is_none() {
            *guard = Some(outcome);
        }
        self.cond.notify_all();
    }

    /// Block until acknowledged, failed or timed out
    pub fn wait(&self, timeout: Duration) -> Result<(), PeerError> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.outcome.lock();
        while guard.is_none() {
            if self.cond.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        match *guard {
            Some(SyncOutcome::Acknowledged) => Ok(()),
            Some(SyncOutcome::Disconnected) => {
                Err(PeerError::Disconnected("peer disconnected before acknowledgment".into()))
            }
            Some(SyncOutcome::Fatal) => Err(PeerError::Disconnected("fatal send error".into())),
            None => Err(PeerError::SendTimeout(timeout.as_millis() as u64)),
        }
    }
}

impl SendCallback for SyncSendWaiter {
    fn acknowledged(&self) {
        self.finish(SyncOutcome::Acknowledged);
    }

    fn disconnected(&self) {
        self.finish(SyncOutcome::Disconnected);
    }

    fn fatal_error(&self) {
        self.finish(SyncOutcome::Fatal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[derive(Default)]
    struct Counting {
        disconnected: AtomicUsize,
    }

    impl SendCallback for Counting {
        fn disconnected(&self) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn queue() -> MessageQueue {
        MessageQueue::new(&PeerConfig::default())
    }

    #[test]
    fn test_wake_threshold() {
        let q = queue();
        assert!(!q.enqueue(MessageItem::new(vec![0; 500], 0)));
        // 502 + 502 = 1004, still under
        assert!(!q.enqueue(MessageItem::new(vec![0; 500], 0)));
        // 1004 + 22 = 1026 > 1024
        assert!(q.enqueue(MessageItem::new(vec![0; 20], 0)));
        assert_eq!(q.queued_bytes(), 1020);
    }

    #[test]
    fn test_drain_all_empties() {
        let q = queue();
        q.enqueue(MessageItem::new(vec![1], 0));
        q.enqueue(MessageItem::new(vec![2], 0));
        let drained = q.drain_all();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].data, vec![1]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_requeue_appends_at_tail() {
        let q = queue();
        q.enqueue(MessageItem::new(vec![1], 0));
        q.requeue(vec![MessageItem::new(vec![9], 0)], "send failed", false, 10);
        let drained = q.drain_all();
        assert_eq!(drained[1].data, vec![9]);
    }

    #[test]
    fn test_requeue_log_rate_limit() {
        let q = queue();
        let many = || (0..20).map(|i| MessageItem::new(vec![i], 0)).collect::<Vec<_>>();
        q.requeue(many(), "storm", false, 100);
        assert_eq!(q.inner.lock().next_requeue_log, 1_100);
        q.requeue(many(), "storm", false, 500);
        assert_eq!(q.inner.lock().next_requeue_log, 1_100);
        q.requeue(many(), "storm", false, 1_100);
        assert_eq!(q.inner.lock().next_requeue_log, 2_100);
        assert_eq!(q.len(), 60);
    }

    #[test]
    fn test_take_with_callbacks() {
        let q = queue();
        let cb = Arc::new(Counting::default());
        q.enqueue(MessageItem::new(vec![1], 0));
        q.enqueue(MessageItem::new(vec![2], 0).with_callback(cb.clone()));
        let taken = q.take_with_callbacks();
        assert_eq!(taken.len(), 1);
        taken.iter().for_each(MessageItem::notify_disconnected);
        assert_eq!(cb.disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_sync_waiter_acknowledged_from_other_thread() {
        let waiter = SyncSendWaiter::new();
        let w = waiter.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            w.acknowledged();
        });
        assert!(waiter.wait(Duration::from_secs(5)).is_ok());
        handle.join().unwrap();
    }

    #[test]
    fn test_sync_waiter_disconnect_and_timeout() {
        let waiter = SyncSendWaiter::new();
        waiter.disconnected();
        assert!(matches!(waiter.wait(Duration::from_millis(10)), Err(PeerError::Disconnected(_))));

        let waiter = SyncSendWaiter::new();
        assert_eq!(
            waiter.wait(Duration::from_millis(10)),
            Err(PeerError::SendTimeout(10))
        );
    }
}
