//! Transport seams: how the engine obtains and drives a stream pair.
//!
//! The engine is written against two traits. A [`Transport`] dials a
//! [`Target`] and resolves to an opened [`Socket`]; a [`Socket`] surfaces
//! readiness and lifecycle changes as [`StreamEvent`]s and performs
//! non-blocking reads and writes between them. The real implementation
//! lives in [`tcp`]; [`mock`] provides a scripted implementation used by
//! the test suite.

use futures_core::future::BoxFuture;

use crate::error::TransportError;
use crate::security::SecurityOptions;

pub mod mock;
pub mod tcp;

pub use tcp::{TcpConfig, TcpTransport};

/// Which half of the stream pair an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Half {
    /// The inbound half.
    Read,
    /// The outbound half.
    Write,
}

/// Where a transport should dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Host to dial (the origin, or a proxy standing in for it).
    pub host: String,
    /// Port to dial.
    pub port: u16,
    /// Name presented for TLS server-name verification; always the origin,
    /// even when dialing through a proxy.
    pub server_name: String,
}

/// Readiness and lifecycle events delivered by an open socket.
#[derive(Debug)]
pub enum StreamEvent {
    /// The read half has bytes ready.
    BytesAvailable,
    /// The write half can accept more bytes.
    SpaceAvailable,
    /// The remote closed the given half.
    EndEncountered(Half),
    /// The given half failed.
    Failed(Half, TransportError),
}

/// Outcome of a non-blocking read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOutcome {
    /// The given number of bytes were transferred.
    Transferred(usize),
    /// No progress can be made right now; wait for the next event.
    WouldBlock,
    /// The remote closed the stream. Reads only.
    Closed,
}

/// An opened full-duplex stream pair.
///
/// The engine calls [`next_event`][Socket::next_event] from its select loop
/// and performs at most one read or write per event before yielding back.
/// Implementations must make `next_event` cancel-safe.
pub trait Socket: Send {
    /// Await the next readiness or lifecycle event. `write_interest` arms
    /// [`StreamEvent::SpaceAvailable`]; read interest is always armed.
    fn next_event(&mut self, write_interest: bool) -> BoxFuture<'_, StreamEvent>;

    /// Non-blocking read into `buf`.
    fn read(&mut self, buf: &mut [u8]) -> Result<IoOutcome, TransportError>;

    /// Non-blocking write of `buf`.
    fn write(&mut self, buf: &[u8]) -> Result<IoOutcome, TransportError>;
}

/// Dials targets and produces opened sockets.
///
/// A transport performs the TLS handshake itself when an option set is
/// present, so a resolved socket is ready for traffic on both halves.
pub trait Transport: Send + Sync + 'static {
    /// The socket type this transport produces.
    type IO: Socket + 'static;

    /// Establish a stream pair toward `target`. Resolves once both halves
    /// are open, or with the error that prevented it.
    fn connect(
        &self,
        target: Target,
        security: Option<SecurityOptions>,
    ) -> BoxFuture<'static, Result<Self::IO, TransportError>>;
}
