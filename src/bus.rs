//! Change bus: coalescing one-slot notifications.
//!
//! A notify enqueues only when the slot is empty, so a burst of writes wakes
//! a listener once. Listeners always re-query the store after waking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Non-blocking send into a one-slot channel; a full slot means a wake-up is
/// already pending and the value is dropped.
pub fn notify<T>(tx: &mpsc::Sender<T>, value: T) -> bool {
    tx.try_send(value).is_ok()
}

/// Sending half of a one-slot channel
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<()>,
}

impl Notifier {
    pub fn notify(&self) -> bool {
        notify(&self.tx, ())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of a one-slot channel
pub struct Listener {
    rx: mpsc::Receiver<()>,
    id: u64,
}

impl Listener {
    /// Bus subscription id; 0 for a standalone slot
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next notification. Returns `false` once every notifier is gone.
    pub async fn recv(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }

    /// Discard a pending notification, if any
    pub fn drain(&mut self) {
        while self.rx.try_recv().is_ok() {}
    }
}

/// A fresh one-slot channel
pub fn slot() -> (Notifier, Listener) {
    let (tx, rx) = mpsc::channel(1);
    (Notifier { tx }, Listener { rx, id: 0 })
}

/// Fan-out of schedule changes to every subscribed loop
#[derive(Clone, Default)]
pub struct ChangeBus {
    next_id: Arc<AtomicU64>,
    subscribers: Arc<Mutex<Vec<(u64, Notifier)>>>,
}

impl ChangeBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Listener {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (notifier, mut listener) = slot();
        listener.id = id;
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push((id, notifier));
        }
        listener
    }

    /// Signal that the timeline changed
    pub fn publish(&self) {
        self.publish_from(0);
    }

    /// Signal every subscriber except the one that made the change
    pub fn publish_except(&self, origin: &Listener) {
        self.publish_from(origin.id);
    }

    fn publish_from(&self, origin: u64) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain(|(_, n)| !n.is_closed());
            for (id, n) in subs.iter() {
                if *id != origin {
                    n.notify();
                }
            }
        }
    }
}
