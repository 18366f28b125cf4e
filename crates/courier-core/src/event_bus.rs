//! Typed lifecycle event broadcasting for one messaging client.
//!
//! Each client owns a [`ClientEventBus`] and publishes its lifecycle events on
//! it. The session controller holds one long-lived subscription per session
//! (ready / disconnected / auth failure handling) and opens short-lived ones
//! for the pairing race. Dropping a receiver is what unsubscribes it.
//!
//! # Example
//!
//! ```rust
//! use courier_core::event_bus::ClientEventBus;
//! use courier_core::ClientEvent;
//!
//! let bus = ClientEventBus::new();
//! let mut rx = bus.subscribe();
//!
//! bus.emit(ClientEvent::Qr("2@abc".to_string()));
//!
//! // In async context:
//! // let event = rx.recv().await.unwrap();
//! ```

use tokio::sync::broadcast;

use crate::client::ClientEvent;

/// Default channel capacity for a client's event bus.
/// A subscriber further behind than this misses events (lag).
const DEFAULT_CAPACITY: usize = 64;

/// Broadcast bus carrying [`ClientEvent`]s from one client to its subscribers.
pub struct ClientEventBus {
    sender: broadcast::Sender<ClientEvent>,
}

impl ClientEventBus {
    /// Create a new bus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new bus with the given capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to every current subscriber.
    ///
    /// Returns the number of subscribers that received it. With no
    /// subscribers the event is dropped and 0 is returned.
    pub fn emit(&self, event: ClientEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to future events. Past events are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.sender.subscribe()
    }

    /// Current number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ClientEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_bus_has_no_subscribers() {
        let bus = ClientEventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn dropped_subscriber_is_unsubscribed() {
        let bus = ClientEventBus::new();
        let rx1 = bus.subscribe();
        let _rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(rx1);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn emit_without_subscribers_returns_zero() {
        let bus = ClientEventBus::new();
        assert_eq!(bus.emit(ClientEvent::Ready), 0);
    }

    #[tokio::test]
    async fn every_subscriber_sees_the_event() {
        let bus = ClientEventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.emit(ClientEvent::Qr("code".to_string())), 2);

        assert_eq!(rx1.recv().await.unwrap(), ClientEvent::Qr("code".to_string()));
        assert_eq!(rx2.recv().await.unwrap(), ClientEvent::Qr("code".to_string()));
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_events() {
        let bus = ClientEventBus::new();
        let mut early = bus.subscribe();

        bus.emit(ClientEvent::Qr("first".to_string()));
        let mut late = bus.subscribe();
        bus.emit(ClientEvent::Ready);

        assert_eq!(early.recv().await.unwrap(), ClientEvent::Qr("first".to_string()));
        assert_eq!(early.recv().await.unwrap(), ClientEvent::Ready);
        assert_eq!(late.recv().await.unwrap(), ClientEvent::Ready);
    }

    #[tokio::test]
    async fn slow_subscriber_lags() {
        let bus = ClientEventBus::with_capacity(2);
        let mut rx = bus.subscribe();

        bus.emit(ClientEvent::Qr("1".to_string()));
        bus.emit(ClientEvent::Qr("2".to_string()));
        bus.emit(ClientEvent::Qr("3".to_string()));

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(1))
        ));
        assert_eq!(rx.recv().await.unwrap(), ClientEvent::Qr("2".to_string()));
    }
}
