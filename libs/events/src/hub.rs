//! Listener registry.

use tokio::sync::mpsc;
use tracing::trace;

/// Ordered set of event listeners.
///
/// `emit` never blocks: each listener is an unbounded channel, and a listener
/// whose receiver has been dropped is pruned on the next emission.
#[derive(Debug)]
pub struct EventHub<E> {
    listeners: Vec<mpsc::UnboundedSender<E>>,
    muted: bool,
}

impl<E: Clone> EventHub<E> {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
            muted: false,
        }
    }

    /// Register a listener and return its receiving end.
    ///
    /// A muted hub hands out a receiver that is already closed.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.muted {
            self.listeners.push(tx);
        }
        rx
    }

    /// Deliver `event` to every live listener in registration order.
    pub fn emit(&mut self, event: E) {
        if self.muted {
            return;
        }

        let before = self.listeners.len();
        self.listeners.retain(|tx| tx.send(event.clone()).is_ok());
        let pruned = before - self.listeners.len();
        if pruned > 0 {
            trace!(pruned, "Dropped closed event listeners");
        }
    }

    /// Suppress all further emission and release every listener.
    pub fn mute(&mut self) {
        self.muted = true;
        self.listeners.clear();
    }

    /// Whether emission has been suppressed.
    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl<E: Clone> Default for EventHub<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_reaches_every_listener_in_order() {
        let mut hub = EventHub::new();
        let mut first = hub.subscribe();
        let mut second = hub.subscribe();

        hub.emit(1u32);
        hub.emit(2u32);

        assert_eq!(first.try_recv().unwrap(), 1);
        assert_eq!(first.try_recv().unwrap(), 2);
        assert_eq!(second.try_recv().unwrap(), 1);
        assert_eq!(second.try_recv().unwrap(), 2);
    }

    #[test]
    fn test_dropped_listener_is_pruned() {
        let mut hub = EventHub::new();
        let kept = hub.subscribe();
        drop(hub.subscribe());
        assert_eq!(hub.listener_count(), 2);

        hub.emit("ping");
        assert_eq!(hub.listener_count(), 1);
        drop(kept);
    }

    #[test]
    fn test_mute_suppresses_and_closes() {
        let mut hub = EventHub::new();
        let mut rx = hub.subscribe();

        hub.mute();
        hub.emit(7u8);

        assert!(hub.is_muted());
        assert_eq!(hub.listener_count(), 0);
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_subscribe_after_mute_is_closed() {
        let mut hub: EventHub<u8> = EventHub::new();
        hub.mute();
        let mut rx = hub.subscribe();
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
