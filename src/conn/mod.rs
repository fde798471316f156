//! Connections and their lifecycle.
//!
//! A [`Connection`] is a cheap, cloneable handle over an engine task that
//! owns the actual stream pair. Handles enqueue commands; the engine
//! applies them between I/O events, so callers never block on the socket
//! and never observe a half-applied state. All entry points are
//! fire-and-forget: outcomes are reported through the assigned delegates,
//! the data source, and the event bus.

use std::fmt;
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, oneshot};
use tracing::Instrument;

mod engine;
mod state;

pub use engine::ResponseInspection;
pub use state::StreamState;

use self::engine::Engine;
use crate::config::{ConnectionConfig, Deployment};
use crate::delegate::ConnectionDelegate;
use crate::error::TransportError;
use crate::events::EventBus;
use crate::security::{SecurityLevel, SecurityOptions};
use crate::source::RequestSource;
use crate::transport::{TcpTransport, Transport};

pub(crate) enum Command {
    Connect,
    Reconnect,
    Close,
    ScheduleNextRequest,
    UnscheduleRequests,
    AssignDelegate(Weak<dyn ConnectionDelegate>),
    ResignDelegate(Weak<dyn ConnectionDelegate>),
    SetSource(Arc<dyn RequestSource>),
    Status(oneshot::Sender<ConnectionStatus>),
}

/// A point-in-time view of a connection, for inspection and tests.
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    /// State of the read half.
    pub read_state: StreamState,
    /// State of the write half.
    pub write_state: StreamState,
    /// The current security level.
    pub security_level: SecurityLevel,
    /// The current handshake option set; `None` at cleartext or when closed.
    pub security_options: Option<SecurityOptions>,
    /// The port the connection dials at the current level.
    pub port: u16,
    /// Bytes accumulated by the read pipeline.
    pub accumulated: usize,
    /// The most recent response inspection result.
    pub last_inspection: Option<ResponseInspection>,
    /// The most recent stream setup failure, if any.
    pub setup_error: Option<Arc<TransportError>>,
}

impl ConnectionStatus {
    /// Whether both halves are connected.
    pub fn is_connected(&self) -> bool {
        self.read_state == StreamState::Connected && self.write_state == StreamState::Connected
    }

    /// Whether both halves are torn down.
    pub fn is_disconnected(&self) -> bool {
        self.read_state == StreamState::NotConfigured
            && self.write_state == StreamState::NotConfigured
    }
}

#[derive(Debug)]
struct Shared {
    identifier: String,
    config: ConnectionConfig,
}

/// Handle to one long-lived connection toward a single origin.
///
/// Clones share the same engine; two handles are equal exactly when they
/// refer to the same connection. Dropping the last handle tears the engine
/// down, closing any open streams.
pub struct Connection {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Connection {
    /// A connection over the real TCP transport, publishing to the
    /// process-wide event bus. Must be called from within a tokio runtime.
    pub fn new<S>(identifier: S, config: ConnectionConfig, deployment: Deployment) -> Self
    where
        S: Into<String>,
    {
        Self::with_transport(
            identifier,
            config,
            deployment,
            TcpTransport::default(),
            EventBus::global().clone(),
        )
    }

    /// A connection over a caller-supplied transport and event bus.
    pub fn with_transport<S, T>(
        identifier: S,
        config: ConnectionConfig,
        deployment: Deployment,
        transport: T,
        bus: EventBus,
    ) -> Self
    where
        S: Into<String>,
        T: Transport,
    {
        let identifier = identifier.into();
        let (commands, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            identifier: identifier.clone(),
            config: config.clone(),
        });

        let engine = Engine::new(identifier.clone(), config, deployment, transport, bus, receiver);
        let span = tracing::debug_span!("connection", identifier = %identifier);
        tokio::spawn(engine.run().instrument(span));

        Self { shared, commands }
    }

    /// The registry identifier of this connection.
    pub fn identifier(&self) -> &str {
        &self.shared.identifier
    }

    /// The configuration snapshot taken at construction.
    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    /// Register `delegate` for lifecycle callbacks. The engine holds the
    /// delegate weakly; the caller keeps it alive.
    pub fn assign_delegate<D>(&self, delegate: &Arc<D>)
    where
        D: ConnectionDelegate + 'static,
    {
        let weak = Arc::downgrade(delegate) as Weak<dyn ConnectionDelegate>;
        self.send(Command::AssignDelegate(weak));
    }

    /// Remove `delegate` from the fan-out.
    pub fn resign_delegate<D>(&self, delegate: &Arc<D>)
    where
        D: ConnectionDelegate + 'static,
    {
        let weak = Arc::downgrade(delegate) as Weak<dyn ConnectionDelegate>;
        self.send(Command::ResignDelegate(weak));
    }

    /// Assign the producer the write pipeline polls for requests.
    pub fn set_request_source<R>(&self, source: &Arc<R>)
    where
        R: RequestSource + 'static,
    {
        self.send(Command::SetSource(source.clone() as Arc<dyn RequestSource>));
    }

    /// Open both halves toward the origin. Fire-and-forget: failures are
    /// reported through delegates, never returned here.
    pub fn connect(&self) {
        self.send(Command::Connect);
    }

    /// Silently close both halves and connect again at the current
    /// security level.
    pub fn reconnect(&self) {
        self.send(Command::Reconnect);
    }

    /// Close both halves. Idempotent; closing a closed connection fires no
    /// events.
    pub fn close(&self) {
        self.send(Command::Close);
    }

    /// Ask the write pipeline to pull the next request from the data
    /// source when the connection can take it.
    pub fn schedule_next_request(&self) {
        self.send(Command::ScheduleNextRequest);
    }

    /// Cancel future request pulls. The in-flight request, if any, still
    /// completes.
    pub fn unschedule_requests(&self) {
        self.send(Command::UnscheduleRequests);
    }

    /// A snapshot of the connection's current state, or `None` when the
    /// engine has stopped.
    pub async fn status(&self) -> Option<ConnectionStatus> {
        let (reply, answer) = oneshot::channel();
        self.send(Command::Status(reply));
        answer.await.ok()
    }

    /// Whether both halves are currently connected.
    pub async fn is_connected(&self) -> bool {
        self.status()
            .await
            .map(|status| status.is_connected())
            .unwrap_or(false)
    }

    fn send(&self, command: Command) {
        let _ = self.commands.send(command);
    }
}

impl Clone for Connection {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            commands: self.commands.clone(),
        }
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("identifier", &self.shared.identifier)
            .field("origin", &self.shared.config.origin)
            .finish()
    }
}
