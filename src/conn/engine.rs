//! The connection engine.
//!
//! One task owns everything mutable about a connection: the stream pair,
//! the per-half states, the read accumulator, and the in-flight write
//! buffer. Commands from handles and readiness events from the socket
//! interleave on a single select loop, so every handler below runs
//! serialized on the task that owns the connection.

use std::sync::Arc;

use bytes::BytesMut;
use futures_core::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::config::{ConnectionConfig, Deployment};
use crate::delegate::DelegateSet;
use crate::error::{classify, ErrorKind, TransportError};
use crate::events::{ConnectionEvent, EventBus};
use crate::security::{SecurityLevel, SecurityOptions};
use crate::source::{RequestSource, WriteBuffer};
use crate::transport::{Half, IoOutcome, Socket, StreamEvent, Target, Transport};

use super::state::{PairState, StreamState};
use super::{Command, ConnectionStatus};

/// Upper bound on a single read from the socket.
pub(crate) const READ_CHUNK: usize = 32 * 1024;

/// What a scan of the accumulated response bytes turned up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseInspection {
    /// The HTTP status code from the status line.
    pub status: u16,
    /// The advertised body length; only extracted for 200 responses.
    pub content_length: Option<u64>,
}

/// Why the connection is closing.
enum CloseCause {
    /// A caller asked for the close.
    Explicit,
    /// The remote closed a half of the stream pair.
    Remote,
    /// An error is forcing the close.
    Errored(Arc<TransportError>),
    /// Internal close with no fan-out (security fallback, teardown).
    Silent,
}

pub(crate) struct Engine<T: Transport> {
    identifier: String,
    config: ConnectionConfig,
    transport: T,
    bus: EventBus,
    commands: mpsc::UnboundedReceiver<Command>,

    delegates: DelegateSet,
    source: Option<Arc<dyn RequestSource>>,

    level: SecurityLevel,
    security: Option<SecurityOptions>,
    state: PairState,
    target: Option<Target>,
    connecting: Option<BoxFuture<'static, Result<T::IO, TransportError>>>,
    io: Option<T::IO>,

    accumulator: BytesMut,
    last_inspection: Option<ResponseInspection>,

    write_buffer: Option<WriteBuffer>,
    write_can_accept: bool,
    process_next: bool,

    setup_error: Option<Arc<TransportError>>,
}

impl<T: Transport> Engine<T> {
    pub(crate) fn new(
        identifier: String,
        config: ConnectionConfig,
        deployment: Deployment,
        transport: T,
        bus: EventBus,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let level = config.initial_security_level();
        Self {
            identifier,
            config,
            transport,
            bus,
            commands,
            delegates: DelegateSet::new(deployment),
            source: None,
            level,
            security: None,
            state: PairState::default(),
            target: None,
            connecting: None,
            io: None,
            accumulator: BytesMut::new(),
            last_inspection: None,
            write_buffer: None,
            write_can_accept: false,
            process_next: false,
            setup_error: None,
        }
    }

    pub(crate) async fn run(mut self) {
        trace!("connection task started");

        enum Step<IO> {
            Command(Option<Command>),
            Opened(Result<IO, TransportError>),
            Event(StreamEvent),
        }

        loop {
            let want_write = self
                .write_buffer
                .as_ref()
                .map(WriteBuffer::has_data)
                .unwrap_or(false)
                && !self.write_can_accept;

            let step = {
                let Self {
                    commands,
                    connecting,
                    io,
                    ..
                } = &mut self;

                tokio::select! {
                    biased;
                    command = commands.recv() => Step::Command(command),
                    result = async {
                        match connecting.as_mut() {
                            Some(open) => open.await,
                            None => std::future::pending().await,
                        }
                    }, if connecting.is_some() => Step::Opened(result),
                    event = async {
                        match io.as_mut() {
                            Some(io) => io.next_event(want_write).await,
                            None => std::future::pending().await,
                        }
                    }, if io.is_some() => Step::Event(event),
                }
            };

            match step {
                Step::Command(Some(command)) => self.handle_command(command),
                Step::Command(None) => {
                    // Every handle dropped; tear down and stop.
                    self.close_connection(CloseCause::Silent);
                    break;
                }
                Step::Opened(result) => self.on_open_result(result),
                Step::Event(event) => self.on_stream_event(event),
            }
        }

        trace!("connection task finished");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect(),
            Command::Reconnect => {
                self.close_connection(CloseCause::Silent);
                self.connect();
            }
            Command::Close => self.close_connection(CloseCause::Explicit),
            Command::ScheduleNextRequest => self.schedule_next_request(),
            Command::UnscheduleRequests => self.unschedule_requests(),
            Command::AssignDelegate(delegate) => self.delegates.assign(delegate),
            Command::ResignDelegate(delegate) => self.delegates.resign(&delegate),
            Command::SetSource(source) => self.source = Some(source),
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            read_state: self.state.read,
            write_state: self.state.write,
            security_level: self.level,
            security_options: self.security.clone(),
            port: self
                .target
                .as_ref()
                .map(|target| target.port)
                .unwrap_or_else(|| self.level.port()),
            accumulated: self.accumulator.len(),
            last_inspection: self.last_inspection.clone(),
            setup_error: self.setup_error.clone(),
        }
    }

    /// Configure the stream pair toward the origin at the current security
    /// level. No-op when the pair is already configured or further along.
    fn prepare(&mut self) -> Result<(), TransportError> {
        if self.state.is_ready() || self.state.is_connecting() || self.state.is_connected() {
            return Ok(());
        }
        self.teardown();

        if self.config.origin.is_empty() {
            return Err(TransportError::stream("no origin host configured"));
        }

        self.security = SecurityOptions::for_level(self.level);
        let (host, port) = match &self.config.proxy {
            Some(proxy) => (proxy.host.clone(), proxy.port),
            None => (self.config.origin.clone(), self.level.port()),
        };
        self.target = Some(Target {
            host,
            port,
            server_name: self.config.origin.clone(),
        });
        self.state.set_both(StreamState::Ready);
        trace!(level = ?self.level, port, "stream pair prepared");
        Ok(())
    }

    fn connect(&mut self) {
        if self.state.is_connected() {
            trace!("connect requested while connected");
            return;
        }
        if self.connecting.is_some() {
            trace!("connect requested while opening");
            return;
        }
        if !self.state.is_ready() {
            if let Err(error) = self.prepare() {
                warn!(%error, kind = %ErrorKind::SetupFailed, "stream pair setup failed");
                let error = Arc::new(error);
                self.setup_error = Some(error.clone());
                self.fan_out_failed(error);
                return;
            }
        }
        if self.state.is_ready() {
            self.open();
        }
    }

    fn open(&mut self) {
        let Some(target) = self.target.clone() else {
            return;
        };
        debug!(
            host = %target.host,
            port = target.port,
            secure = self.security.is_some(),
            "opening stream pair"
        );
        self.connecting = Some(self.transport.connect(target, self.security.clone()));
        self.state.set_both(StreamState::Connecting);
    }

    fn on_open_result(&mut self, result: Result<T::IO, TransportError>) {
        self.connecting = None;
        match result {
            Ok(io) => {
                self.io = Some(io);
                // The halves complete individually; fan-out waits for both.
                self.state.read = StreamState::Connected;
                self.state.write = StreamState::Connected;
                self.write_can_accept = false;
                self.on_connected();
            }
            Err(error) => self.handle_stream_error(Half::Read, error),
        }
    }

    fn on_connected(&mut self) {
        debug!(host = %self.config.origin, level = ?self.level, "connected");
        self.setup_error = None;
        self.fan_out_connected();
        self.schedule_next_request();
    }

    fn on_stream_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::BytesAvailable => self.on_bytes_available(),
            StreamEvent::SpaceAvailable => {
                self.write_can_accept = true;
                self.write_step();
            }
            StreamEvent::EndEncountered(half) => self.on_end(half),
            StreamEvent::Failed(half, error) => self.handle_stream_error(half, error),
        }
    }

    // Read pipeline.

    fn on_bytes_available(&mut self) {
        let Some(io) = self.io.as_mut() else {
            return;
        };
        let mut chunk = [0u8; READ_CHUNK];
        match io.read(&mut chunk) {
            Ok(IoOutcome::Transferred(read)) => {
                self.accumulator.extend_from_slice(&chunk[..read]);
                trace!(bytes = read, total = self.accumulator.len(), "read chunk");
                self.process_response();
            }
            Ok(IoOutcome::WouldBlock) => {}
            Ok(IoOutcome::Closed) => self.on_end(Half::Read),
            Err(error) => self.handle_stream_error(Half::Read, error),
        }
    }

    /// Minimal response inspection: the status line, and for 200 responses
    /// the advertised body length. Framing and draining the accumulator is
    /// a collaborator's job.
    fn process_response(&mut self) {
        if let Some(inspection) = inspect_response(&self.accumulator) {
            trace!(
                status = inspection.status,
                content_length = ?inspection.content_length,
                "response inspected"
            );
            self.last_inspection = Some(inspection);
        }
    }

    fn on_end(&mut self, half: Half) {
        debug!(?half, kind = %ErrorKind::RemoteClosed, "remote closed the stream, treating as timeout");
        self.close_connection(CloseCause::Remote);
    }

    // Write pipeline.

    fn schedule_next_request(&mut self) {
        if self.write_buffer.is_none() {
            self.process_next = true;
        }
        self.pull_next_request();
        if self.write_can_accept {
            self.write_step();
        }
    }

    fn unschedule_requests(&mut self) {
        self.process_next = false;
    }

    fn pull_next_request(&mut self) {
        if !self.process_next || self.write_buffer.is_some() || !self.state.is_connected() {
            return;
        }
        let Some(source) = self.source.clone() else {
            return;
        };
        if !source.has_data() {
            return;
        }
        let Some(identifier) = source.next_request_identifier() else {
            return;
        };
        let Some(buffer) = source.request_data(&identifier) else {
            trace!(request = %identifier, "source produced no buffer");
            return;
        };
        trace!(request = %identifier, bytes = buffer.len(), "request taken in flight");
        self.write_buffer = Some(buffer);
    }

    fn write_step(&mut self) {
        while self.write_can_accept {
            if self.io.is_none() {
                break;
            }
            if self.write_buffer.is_none() {
                self.pull_next_request();
            }
            let Some(buffer) = self.write_buffer.as_mut() else {
                break;
            };

            let started = buffer.offset() == 0 && buffer.mark_started();
            let identifier = buffer.identifier().to_owned();
            let source = self.source.clone();
            if started {
                if let Some(source) = &source {
                    source.processing_started(&identifier);
                }
            }

            let Some(io) = self.io.as_mut() else {
                break;
            };
            match io.write(buffer.remaining()) {
                Err(error) => {
                    self.handle_write_error(error);
                    break;
                }
                Ok(IoOutcome::WouldBlock) => {
                    self.write_can_accept = false;
                    break;
                }
                Ok(IoOutcome::Closed) => {
                    self.handle_write_error(TransportError::stream("write half closed"));
                    break;
                }
                Ok(IoOutcome::Transferred(sent)) => {
                    buffer.advance(sent);
                    if buffer.has_data() {
                        // Partial write; wait for the next space event.
                        trace!(request = %identifier, sent, offset = buffer.offset(), "partial write");
                        self.write_can_accept = false;
                        break;
                    }
                    trace!(request = %identifier, "request fully sent");
                    self.write_buffer = None;
                    if let Some(source) = &source {
                        source.did_send_request(&identifier);
                    }
                    // Loop back around to pull the next request.
                }
            }
        }
    }

    fn handle_write_error(&mut self, error: TransportError) {
        let partially_sent = self
            .write_buffer
            .as_ref()
            .map(WriteBuffer::is_partially_sent)
            .unwrap_or(false);

        if partially_sent {
            if let Some(buffer) = self.write_buffer.take() {
                warn!(
                    request = buffer.identifier(),
                    %error,
                    kind = %ErrorKind::RequestWriteFailed,
                    "request abandoned mid-write"
                );
                if let Some(source) = self.source.clone() {
                    source.did_fail_to_process_request(buffer.identifier());
                }
            }
            // The per-request failure stands in for the generic broadcast;
            // the close below reports the disconnect itself.
            self.close_connection(CloseCause::Errored(Arc::new(error)));
        } else {
            self.handle_stream_error(Half::Write, error);
        }
    }

    // Error classification and the security fallback.

    fn handle_stream_error(&mut self, half: Half, error: TransportError) {
        let kind = classify(&error);
        debug!(?half, %error, %kind, "stream error");

        if kind == ErrorKind::TlsRejected {
            let next = match self.level {
                SecurityLevel::Strict if self.config.allow_reduced_security => {
                    Some(SecurityLevel::Lenient)
                }
                SecurityLevel::Lenient if self.config.allow_cleartext_fallback => {
                    Some(SecurityLevel::Cleartext)
                }
                _ => None,
            };
            if let Some(level) = next {
                self.reduce_security(level);
                return;
            }
        }

        if self.state.is_connected() {
            self.close_connection(CloseCause::Errored(Arc::new(error)));
        } else {
            // Nothing usable is open; report the failure and leave the
            // halves in the error state for a later connect to reset.
            self.connecting = None;
            self.state.set_both(StreamState::Error);
            self.fan_out_failed(Arc::new(error));
        }
    }

    /// The remote refused the handshake at the current level and the
    /// configuration permits less: rebuild at `level` and reconnect without
    /// telling the delegates anything went wrong.
    fn reduce_security(&mut self, level: SecurityLevel) {
        debug!(from = ?self.level, to = ?level, "remote refused handshake, reducing security");
        self.level = level;
        self.close_connection(CloseCause::Silent);
        self.connect();
    }

    // Teardown.

    fn close_connection(&mut self, cause: CloseCause) {
        let open =
            self.io.is_some() || self.connecting.is_some() || !self.state.is_disconnected();
        if !open {
            trace!("close of a closed connection is a no-op");
            return;
        }
        let was_connected = self.state.is_connected();

        // A request abandoned mid-write is always reported to its producer.
        if let Some(buffer) = self.write_buffer.take() {
            if buffer.is_partially_sent() {
                if let Some(source) = self.source.clone() {
                    source.did_fail_to_process_request(buffer.identifier());
                }
            }
        }

        if was_connected {
            if let CloseCause::Errored(error) = &cause {
                self.fan_out_will_disconnect(error.clone());
            }
        }

        self.teardown();

        if was_connected {
            match cause {
                CloseCause::Explicit | CloseCause::Remote => self.fan_out_disconnected(),
                CloseCause::Errored(_) | CloseCause::Silent => {}
            }
        }
    }

    fn teardown(&mut self) {
        self.io = None;
        self.connecting = None;
        self.security = None;
        self.target = None;
        self.accumulator.clear();
        self.last_inspection = None;
        self.write_buffer = None;
        self.write_can_accept = false;
        self.state.set_both(StreamState::NotConfigured);
    }

    // Fan-out. Each lifecycle event reaches the delegates and is mirrored
    // on the event bus.

    fn fan_out_connected(&mut self) {
        let host = self.config.origin.clone();
        self.delegates.broadcast(|delegate| delegate.did_connect(&host));
        self.bus.publish(ConnectionEvent::Connected {
            identifier: self.identifier.clone(),
            host,
        });
    }

    fn fan_out_disconnected(&mut self) {
        let host = self.config.origin.clone();
        self.delegates
            .broadcast(|delegate| delegate.did_disconnect(&host));
        self.bus.publish(ConnectionEvent::Disconnected {
            identifier: self.identifier.clone(),
            host,
        });
    }

    fn fan_out_will_disconnect(&mut self, error: Arc<TransportError>) {
        let host = self.config.origin.clone();
        self.delegates
            .broadcast(|delegate| delegate.will_disconnect(&host, &error));
        self.bus.publish(ConnectionEvent::DisconnectedWithError {
            identifier: self.identifier.clone(),
            host,
            error,
        });
    }

    fn fan_out_failed(&mut self, error: Arc<TransportError>) {
        let host = self.config.origin.clone();
        self.delegates
            .broadcast(|delegate| delegate.did_fail(&host, &error));
        self.bus.publish(ConnectionEvent::Failed {
            identifier: self.identifier.clone(),
            host,
            error,
        });
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

fn inspect_response(bytes: &[u8]) -> Option<ResponseInspection> {
    const STATUS_PREFIX: &[u8] = b"HTTP/1.1 ";

    let start = find(bytes, STATUS_PREFIX)? + STATUS_PREFIX.len();
    let digits = bytes.get(start..start + 3)?;
    let status = std::str::from_utf8(digits).ok()?.parse::<u16>().ok()?;

    let content_length = if status == 200 {
        find_content_length(bytes)
    } else {
        None
    };

    Some(ResponseInspection {
        status,
        content_length,
    })
}

fn find_content_length(bytes: &[u8]) -> Option<u64> {
    const HEADER: &[u8] = b"content-length:";

    let mut at = 0;
    while at + HEADER.len() <= bytes.len() {
        if bytes[at..at + HEADER.len()].eq_ignore_ascii_case(HEADER) {
            let value = bytes[at + HEADER.len()..]
                .split(|&byte| byte == b'\r' || byte == b'\n')
                .next()?;
            let value = std::str::from_utf8(value).ok()?.trim();
            return value.parse().ok();
        }
        at += 1;
    }
    None
}
