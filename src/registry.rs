//! The identifier → connection registry.
//!
//! On handheld deployments every identifier collapses onto one shared
//! connection: the first lookup creates it under the reserved identifier
//! and later lookups alias their own identifier to it. On desktop
//! deployments each identifier gets a distinct connection. Either way,
//! `get` is idempotent, and a connection removed from the registry keeps
//! working for callers still holding a handle.

use std::collections::HashMap;
use std::sync::OnceLock;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::{ConnectionConfig, Deployment};
use crate::conn::Connection;
use crate::events::EventBus;
use crate::transport::{TcpTransport, Transport};

/// Reserved identifier the handheld shared connection is stored under.
pub const SHARED_CONNECTION_IDENTIFIER: &str = "shared";

/// Maps identifiers to connections, creating them lazily from an ambient
/// configuration snapshot.
#[derive(Debug)]
pub struct ConnectionRegistry<T: Transport + Clone = TcpTransport> {
    deployment: Deployment,
    config: ConnectionConfig,
    transport: T,
    bus: EventBus,
    connections: Mutex<HashMap<String, Connection>>,
}

impl ConnectionRegistry<TcpTransport> {
    /// A registry producing connections over the real TCP transport and
    /// the process-wide event bus.
    pub fn new(deployment: Deployment, config: ConnectionConfig) -> Self {
        Self::with_transport(
            deployment,
            config,
            TcpTransport::default(),
            EventBus::global().clone(),
        )
    }

    /// The process-wide registry, installed on first call. Later calls
    /// return the already-installed instance regardless of arguments.
    pub fn install(deployment: Deployment, config: ConnectionConfig) -> &'static Self {
        static GLOBAL: OnceLock<ConnectionRegistry> = OnceLock::new();
        GLOBAL.get_or_init(|| ConnectionRegistry::new(deployment, config))
    }
}

impl<T: Transport + Clone> ConnectionRegistry<T> {
    /// A registry producing connections over a caller-supplied transport
    /// and event bus.
    pub fn with_transport(
        deployment: Deployment,
        config: ConnectionConfig,
        transport: T,
        bus: EventBus,
    ) -> Self {
        Self {
            deployment,
            config,
            transport,
            bus,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// The connection for `identifier`, created on first lookup.
    pub fn get(&self, identifier: &str) -> Connection {
        let mut connections = self.connections.lock();
        if let Some(connection) = connections.get(identifier) {
            return connection.clone();
        }

        match self.deployment {
            Deployment::Handheld => {
                // One shared connection regardless of the requested name.
                let shared = match connections.get(SHARED_CONNECTION_IDENTIFIER) {
                    Some(shared) => shared.clone(),
                    None => {
                        let connection = self.construct(SHARED_CONNECTION_IDENTIFIER);
                        connections
                            .insert(SHARED_CONNECTION_IDENTIFIER.to_owned(), connection.clone());
                        connection
                    }
                };
                if identifier != SHARED_CONNECTION_IDENTIFIER {
                    connections.insert(identifier.to_owned(), shared.clone());
                }
                shared
            }
            Deployment::Desktop => {
                let connection = self.construct(identifier);
                connections.insert(identifier.to_owned(), connection.clone());
                connection
            }
        }
    }

    /// Remove every identifier mapped to `connection`. Streams are not
    /// closed here; they close when the last handle drops or on an
    /// explicit close.
    pub fn destroy(&self, connection: &Connection) {
        let mut connections = self.connections.lock();
        let before = connections.len();
        connections.retain(|_, held| held != connection);
        trace!(
            identifier = connection.identifier(),
            removed = before - connections.len(),
            "connection destroyed"
        );
    }

    /// Close every registered connection and empty the registry.
    pub fn close_all(&self) {
        // Snapshot, then release the lock before closing, so a close
        // callback touching the registry cannot deadlock it.
        let snapshot: Vec<Connection> = {
            let mut connections = self.connections.lock();
            let mut snapshot: Vec<Connection> = Vec::with_capacity(connections.len());
            for connection in connections.values() {
                if !snapshot.contains(connection) {
                    snapshot.push(connection.clone());
                }
            }
            connections.clear();
            snapshot
        };

        debug!(count = snapshot.len(), "closing all connections");
        for connection in snapshot {
            connection.close();
        }
    }

    fn construct(&self, identifier: &str) -> Connection {
        debug!(identifier, origin = %self.config.origin, "constructing connection");
        Connection::with_transport(
            identifier,
            self.config.clone(),
            self.deployment,
            self.transport.clone(),
            self.bus.clone(),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn registry(deployment: Deployment) -> ConnectionRegistry {
        ConnectionRegistry::with_transport(
            deployment,
            ConnectionConfig::new("origin.example.com"),
            TcpTransport::default(),
            EventBus::new(),
        )
    }

    #[tokio::test]
    async fn handheld_lookups_share_one_connection() {
        let registry = registry(Deployment::Handheld);
        let a = registry.get("a");
        let b = registry.get("b");
        assert_eq!(a, b);
        assert_eq!(a, registry.get(SHARED_CONNECTION_IDENTIFIER));
    }

    #[tokio::test]
    async fn desktop_lookups_are_distinct_but_stable() {
        let registry = registry(Deployment::Desktop);
        let a = registry.get("a");
        let b = registry.get("b");
        assert_ne!(a, b);
        assert_eq!(a, registry.get("a"));
    }

    #[tokio::test]
    async fn destroy_removes_every_alias() {
        let registry = registry(Deployment::Handheld);
        let shared = registry.get("a");
        let _alias = registry.get("b");

        registry.destroy(&shared);

        // The next lookup constructs a fresh shared connection.
        let fresh = registry.get("a");
        assert_ne!(fresh, shared);

        // The destroyed connection still answers through held handles.
        assert!(shared.status().await.is_some());
    }
}
