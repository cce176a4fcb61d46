//! Broadcast variables and rewindable one-shot replies.

use tokio::sync::{oneshot, watch};

/// A value with an attached change signal.
///
/// Writers call [`AsyncVar::set`]; any number of subscribers block on
/// [`AsyncVar::on_change`] until the next write. Intermediate values may be
/// coalesced; consumers that need to detect every publication attach a
/// fresh unique id to the value itself.
#[derive(Debug)]
pub struct AsyncVar<T> {
    tx: watch::Sender<T>,
}

impl<T: Clone + Send + Sync + 'static> AsyncVar<T> {
    /// Creates a variable holding `initial`.
    pub fn new(initial: T) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Returns a clone of the current value.
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Publishes a new value, waking all subscribers.
    pub fn set(&self, value: T) {
        self.tx.send_replace(value);
    }

    /// Returns a receiver positioned at the current value.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        let mut rx = self.tx.subscribe();
        rx.borrow_and_update();
        rx
    }

    /// Resolves after the next write.
    pub async fn on_change(&self) {
        let mut rx = self.subscribe();
        let _ = rx.changed().await;
    }
}

/// A rewindable one-shot reply channel.
///
/// Holds at most one pending reply sender. Arming the slot with a new
/// sender drops the previous one, which cancels the old waiter so it never
/// acts on stale data. [`ReplySlot::send`] resolves exactly one waiter.
#[derive(Debug)]
pub struct ReplySlot<T> {
    tx: Option<oneshot::Sender<T>>,
}

impl<T> ReplySlot<T> {
    /// Creates an empty (already-resolved) slot.
    pub fn empty() -> Self {
        Self { tx: None }
    }

    /// Creates a slot holding `tx`.
    pub fn new(tx: oneshot::Sender<T>) -> Self {
        Self { tx: Some(tx) }
    }

    /// True when the slot has already been resolved or canceled.
    pub fn is_resolved(&self) -> bool {
        self.tx.is_none()
    }

    /// Cancels the pending waiter, if any.
    pub fn cancel(&mut self) {
        self.tx = None;
    }

    /// Cancels the pending waiter and arms the slot with a fresh sender.
    pub fn rearm(&mut self, tx: oneshot::Sender<T>) {
        self.tx = Some(tx);
    }

    /// Resolves the pending waiter. Returns false if the slot was empty or
    /// the waiter is gone.
    pub fn send(&mut self, value: T) -> bool {
        match self.tx.take() {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }
}

impl<T> Default for ReplySlot<T> {
    fn default() -> Self {
        Self::empty()
    }
}
