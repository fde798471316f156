//! Tether
//!
//! The transport substrate of a real-time publish/subscribe client: one
//! long-lived, full-duplex HTTP(S) connection per origin, multiplexing a
//! stream of outbound request buffers onto a single socket and
//! accumulating response bytes for inspection.
//!
//! The pieces:
//!
//! - [`Connection`]: a handle over the engine task that owns the stream
//!   pair, drives the per-half state machine, ships request buffers with
//!   partial-write accounting, and falls back to weaker security when the
//!   remote refuses the handshake and policy permits.
//! - [`RequestSource`]: the external producer the write pipeline polls for
//!   request buffers, and the receiver of per-request progress.
//! - [`ConnectionDelegate`]: lifecycle callbacks, held weakly and mirrored
//!   as [`ConnectionEvent`]s on an [`EventBus`].
//! - [`ConnectionRegistry`]: identifier → connection, with a single shared
//!   connection on handheld deployments.
//! - [`transport`]: the seams the engine is written against, the real
//!   TCP(+TLS) dialer, and a scripted mock for tests.

pub mod config;
pub mod conn;
pub mod delegate;
pub mod error;
pub mod events;
pub mod registry;
pub mod security;
pub mod source;
pub mod transport;

pub use config::{ConnectionConfig, Deployment, ProxyDescriptor};
pub use conn::{Connection, ConnectionStatus, ResponseInspection, StreamState};
pub use delegate::ConnectionDelegate;
pub use error::{classify, BoxError, ErrorDomain, ErrorKind, TransportError};
pub use events::{ConnectionEvent, EventBus};
pub use registry::{ConnectionRegistry, SHARED_CONNECTION_IDENTIFIER};
pub use security::{SecurityLevel, SecurityOptions};
pub use source::{RequestSource, WriteBuffer};
