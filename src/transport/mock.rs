//! A scripted transport for testing connection behavior.
//!
//! Tests queue connect outcomes on a [`MockTransport`] and then drive the
//! resulting [`MockSocket`] through its [`MockSocketHandle`]: delivering
//! readiness events, metering how many bytes each write may take, injecting
//! errors with a chosen domain and code, and signalling end-of-stream. The
//! transport records every connect attempt so tests can assert on the
//! dialed target and the security options in effect.

use std::collections::VecDeque;
use std::sync::Arc;

use futures_core::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Half, IoOutcome, Socket, StreamEvent, Target, Transport};
use crate::error::TransportError;
use crate::security::SecurityOptions;

/// One recorded call to [`Transport::connect`].
#[derive(Debug, Clone)]
pub struct ConnectAttempt {
    /// The dialed target.
    pub target: Target,
    /// The security options in effect for the attempt.
    pub security: Option<SecurityOptions>,
}

#[derive(Debug, Default)]
struct MockTransportInner {
    outcomes: Mutex<VecDeque<Result<MockSocket, TransportError>>>,
    attempts: Mutex<Vec<ConnectAttempt>>,
}

/// A transport whose connect outcomes are scripted in advance.
///
/// Clones share the same script and attempt log.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    inner: Arc<MockTransportInner>,
}

impl MockTransport {
    /// A transport with an empty script. An unscripted connect attempt
    /// fails with a stream error.
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next connect attempt to succeed, returning the handle
    /// that drives the resulting socket.
    pub fn script_open(&self) -> MockSocketHandle {
        let (socket, handle) = MockSocket::new();
        self.inner.outcomes.lock().push_back(Ok(socket));
        handle
    }

    /// Script the next connect attempt to fail with `error`.
    pub fn script_refusal(&self, error: TransportError) {
        self.inner.outcomes.lock().push_back(Err(error));
    }

    /// Every connect attempt recorded so far, in order.
    pub fn attempts(&self) -> Vec<ConnectAttempt> {
        self.inner.attempts.lock().clone()
    }
}

impl Transport for MockTransport {
    type IO = MockSocket;

    fn connect(
        &self,
        target: Target,
        security: Option<SecurityOptions>,
    ) -> BoxFuture<'static, Result<Self::IO, TransportError>> {
        self.inner.attempts.lock().push(ConnectAttempt {
            target,
            security: security.clone(),
        });
        let outcome = self
            .inner
            .outcomes
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::stream("no scripted connect outcome")));
        Box::pin(std::future::ready(outcome))
    }
}

#[derive(Debug)]
struct MockSocketState {
    events: mpsc::UnboundedSender<StreamEvent>,
    read_data: Mutex<VecDeque<u8>>,
    write_quota: Mutex<VecDeque<usize>>,
    next_write_error: Mutex<Option<TransportError>>,
    written: Mutex<Vec<u8>>,
}

/// The scripted socket a [`MockTransport`] resolves to.
#[derive(Debug)]
pub struct MockSocket {
    events: mpsc::UnboundedReceiver<StreamEvent>,
    state: Arc<MockSocketState>,
}

impl MockSocket {
    fn new() -> (Self, MockSocketHandle) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let state = Arc::new(MockSocketState {
            events: sender,
            read_data: Mutex::new(VecDeque::new()),
            write_quota: Mutex::new(VecDeque::new()),
            next_write_error: Mutex::new(None),
            written: Mutex::new(Vec::new()),
        });
        (
            Self {
                events: receiver,
                state: state.clone(),
            },
            MockSocketHandle { state },
        )
    }
}

impl Socket for MockSocket {
    fn next_event(&mut self, _write_interest: bool) -> BoxFuture<'_, StreamEvent> {
        Box::pin(async move {
            match self.events.recv().await {
                Some(event) => event,
                // Script exhausted and the handle dropped; stay quiet.
                None => std::future::pending().await,
            }
        })
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<IoOutcome, TransportError> {
        let mut data = self.state.read_data.lock();
        if data.is_empty() {
            return Ok(IoOutcome::WouldBlock);
        }
        let take = buf.len().min(data.len());
        for slot in buf.iter_mut().take(take) {
            *slot = data.pop_front().unwrap_or_default();
        }
        if !data.is_empty() {
            // More remains buffered; behave level-triggered like a real
            // socket and re-arm readiness.
            let _ = self.state.events.send(StreamEvent::BytesAvailable);
        }
        Ok(IoOutcome::Transferred(take))
    }

    fn write(&mut self, buf: &[u8]) -> Result<IoOutcome, TransportError> {
        if let Some(error) = self.state.next_write_error.lock().take() {
            return Err(error);
        }
        let Some(quota) = self.state.write_quota.lock().pop_front() else {
            return Ok(IoOutcome::WouldBlock);
        };
        let take = quota.min(buf.len());
        self.state.written.lock().extend_from_slice(&buf[..take]);
        Ok(IoOutcome::Transferred(take))
    }
}

/// Test-side controller for a [`MockSocket`].
#[derive(Debug, Clone)]
pub struct MockSocketHandle {
    state: Arc<MockSocketState>,
}

impl MockSocketHandle {
    /// Announce that the write half can accept bytes.
    pub fn space_available(&self) {
        let _ = self.state.events.send(StreamEvent::SpaceAvailable);
    }

    /// Queue `data` for reading and announce readable bytes.
    pub fn deliver(&self, data: &[u8]) {
        self.state.read_data.lock().extend(data.iter().copied());
        let _ = self.state.events.send(StreamEvent::BytesAvailable);
    }

    /// Announce end-of-stream on the read half.
    pub fn end(&self) {
        let _ = self.state.events.send(StreamEvent::EndEncountered(Half::Read));
    }

    /// Deliver a failure event for `half`.
    pub fn fail(&self, half: Half, error: TransportError) {
        let _ = self.state.events.send(StreamEvent::Failed(half, error));
    }

    /// Let the next write call take up to `bytes` bytes. Each write call
    /// consumes one allowance; with none queued, writes report
    /// [`IoOutcome::WouldBlock`].
    pub fn allow_write(&self, bytes: usize) {
        self.state.write_quota.lock().push_back(bytes);
    }

    /// Make the next write call fail with `error`.
    pub fn fail_next_write(&self, error: TransportError) {
        *self.state.next_write_error.lock() = Some(error);
    }

    /// Everything written to the socket so far.
    pub fn written(&self) -> Vec<u8> {
        self.state.written.lock().clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::security::SecurityLevel;

    fn target() -> Target {
        Target {
            host: "origin.example.com".into(),
            port: 443,
            server_name: "origin.example.com".into(),
        }
    }

    #[tokio::test]
    async fn scripted_open_resolves_and_records_the_attempt() {
        let transport = MockTransport::new();
        let _handle = transport.script_open();

        let security = SecurityOptions::for_level(SecurityLevel::Strict);
        let socket = transport.connect(target(), security.clone()).await;
        assert!(socket.is_ok());

        let attempts = transport.attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].target.port, 443);
        assert_eq!(attempts[0].security, security);
    }

    #[tokio::test]
    async fn unscripted_connect_fails() {
        let transport = MockTransport::new();
        assert!(transport.connect(target(), None).await.is_err());
    }

    #[tokio::test]
    async fn writes_respect_the_quota() {
        let transport = MockTransport::new();
        let handle = transport.script_open();
        let mut socket = transport.connect(target(), None).await.unwrap();

        assert_eq!(socket.write(b"hello").unwrap(), IoOutcome::WouldBlock);

        handle.allow_write(3);
        assert_eq!(socket.write(b"hello").unwrap(), IoOutcome::Transferred(3));
        assert_eq!(handle.written(), b"hel");
    }

    #[tokio::test]
    async fn delivered_data_reads_in_chunks() {
        let transport = MockTransport::new();
        let handle = transport.script_open();
        let mut socket = transport.connect(target(), None).await.unwrap();

        handle.deliver(b"abcdef");
        match socket.next_event(false).await {
            StreamEvent::BytesAvailable => {}
            other => panic!("unexpected event: {other:?}"),
        }

        let mut buf = [0u8; 4];
        assert_eq!(socket.read(&mut buf).unwrap(), IoOutcome::Transferred(4));
        assert_eq!(&buf, b"abcd");

        // The remainder re-arms readiness by itself.
        match socket.next_event(false).await {
            StreamEvent::BytesAvailable => {}
            other => panic!("unexpected event: {other:?}"),
        }
        let mut buf = [0u8; 4];
        assert_eq!(socket.read(&mut buf).unwrap(), IoOutcome::Transferred(2));
        assert_eq!(&buf[..2], b"ef");
    }
}
