//! Typed event listener registries.
//!
//! Each event kind gets its own registry with its own mutex; the registry
//! mutex is never held while any other core lock is taken, and delivery goes
//! through channel sends so a slow subscriber cannot stall the notifier.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

#[derive(Debug)]
pub struct ListenerRegistry<T: Clone + Send> {
    senders: Mutex<Vec<Sender<T>>>,
}

impl<T: Clone + Send> ListenerRegistry<T> {
    pub fn new() -> ListenerRegistry<T> {
        ListenerRegistry {
            senders: Mutex::new(Vec::new()),
        }
    }

    /// Registers a listener and returns its receiving end. Dropping the
    /// receiver unsubscribes on the next notification.
    pub fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = unbounded();
        self.senders.lock().push(tx);
        rx
    }

    /// Delivers `value` to every live listener, pruning closed ones.
    pub fn notify(&self, value: T) {
        let mut senders = self.senders.lock();
        senders.retain(|tx| tx.send(value.clone()).is_ok());
    }

    pub fn len(&self) -> usize {
        self.senders.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.lock().is_empty()
    }
}

impl<T: Clone + Send> Default for ListenerRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
