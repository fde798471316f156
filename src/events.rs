//! The connection event bus.
//!
//! Every delegate fan-out is mirrored as a typed event on a broadcast
//! channel, so observers that are not delegates of a particular connection
//! can still follow lifecycle changes process-wide.

use std::sync::{Arc, OnceLock};

use tokio::sync::broadcast;

use crate::error::TransportError;

const EVENT_CAPACITY: usize = 64;

/// A connection lifecycle event.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Both halves reached the connected state.
    Connected {
        /// Registry identifier of the connection.
        identifier: String,
        /// Origin host.
        host: String,
    },
    /// The connection closed without an error.
    Disconnected {
        /// Registry identifier of the connection.
        identifier: String,
        /// Origin host.
        host: String,
    },
    /// The connection closed because of an error.
    DisconnectedWithError {
        /// Registry identifier of the connection.
        identifier: String,
        /// Origin host.
        host: String,
        /// The error that caused the close.
        error: Arc<TransportError>,
    },
    /// The connection failed without closing.
    Failed {
        /// Registry identifier of the connection.
        identifier: String,
        /// Origin host.
        host: String,
        /// The reported error.
        error: Arc<TransportError>,
    },
}

impl ConnectionEvent {
    /// The identifier of the connection the event concerns.
    pub fn identifier(&self) -> &str {
        match self {
            ConnectionEvent::Connected { identifier, .. }
            | ConnectionEvent::Disconnected { identifier, .. }
            | ConnectionEvent::DisconnectedWithError { identifier, .. }
            | ConnectionEvent::Failed { identifier, .. } => identifier,
        }
    }
}

/// Broadcast channel for [`ConnectionEvent`]s.
///
/// Cloning shares the underlying channel. The process-wide bus is reachable
/// through [`EventBus::global`]; independently constructed buses (as tests
/// use) behave identically.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ConnectionEvent>,
}

impl EventBus {
    /// A fresh, independent bus.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// The process-wide bus, created on first access.
    pub fn global() -> &'static EventBus {
        static GLOBAL: OnceLock<EventBus> = OnceLock::new();
        GLOBAL.get_or_init(EventBus::new)
    }

    /// Subscribe to events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.sender.subscribe()
    }

    /// Publish `event` to current subscribers. Publishing with no
    /// subscribers is not an error.
    pub(crate) fn publish(&self, event: ConnectionEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_published_events() {
        let bus = EventBus::new();
        let mut events = bus.subscribe();

        bus.publish(ConnectionEvent::Connected {
            identifier: "conn".into(),
            host: "origin.example.com".into(),
        });

        match events.recv().await.unwrap() {
            ConnectionEvent::Connected { identifier, host } => {
                assert_eq!(identifier, "conn");
                assert_eq!(host, "origin.example.com");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(ConnectionEvent::Disconnected {
            identifier: "conn".into(),
            host: "origin.example.com".into(),
        });
    }

    #[tokio::test]
    async fn global_bus_is_shared() {
        let mut events = EventBus::global().subscribe();
        EventBus::global().publish(ConnectionEvent::Connected {
            identifier: "conn".into(),
            host: "origin.example.com".into(),
        });
        assert!(matches!(
            events.recv().await,
            Ok(ConnectionEvent::Connected { .. })
        ));
    }
}
