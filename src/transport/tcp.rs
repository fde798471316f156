//! The real TCP(+TLS) transport.
//!
//! Dials the target with tokio, applies socket options, and performs the
//! rustls handshake when an option set is present. Readiness on the
//! underlying socket is surfaced to the engine as [`StreamEvent`]s; reads
//! and writes are non-blocking and yield [`IoOutcome::WouldBlock`] when the
//! half cannot make progress.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_core::future::BoxFuture;
use futures_util::task::noop_waker_ref;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite, Interest, ReadBuf};
use tokio::net::TcpStream;
use tracing::{trace, warn, Instrument};

use super::{Half, IoOutcome, Socket, StreamEvent, Target, Transport};
use crate::error::{tls_code, TransportError};
use crate::security::SecurityOptions;

/// Configuration for TCP connections.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// The timeout for connecting to the remote address.
    pub connect_timeout: Option<Duration>,

    /// The timeout for keep-alive probes.
    pub keep_alive_timeout: Option<Duration>,

    /// Whether to disable Nagle's algorithm.
    pub nodelay: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(10)),
            keep_alive_timeout: Some(Duration::from_secs(90)),
            nodelay: true,
        }
    }
}

/// Transport that dials plain TCP and upgrades to TLS per the option set.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: Arc<TcpConfig>,
}

impl TcpTransport {
    /// A transport with the given configuration.
    pub fn new(config: TcpConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Access the TCP configuration.
    pub fn config(&self) -> &TcpConfig {
        &self.config
    }
}

impl Transport for TcpTransport {
    type IO = TcpStreamPair;

    fn connect(
        &self,
        target: Target,
        security: Option<SecurityOptions>,
    ) -> BoxFuture<'static, Result<Self::IO, TransportError>> {
        let config = self.config.clone();
        let span = tracing::trace_span!("tcp", host = %target.host, port = target.port);
        Box::pin(
            async move {
                let stream = dial(&target, &config).await?;

                if let Ok(peer_addr) = stream.peer_addr() {
                    trace!(peer.addr = %peer_addr, "tcp connected");
                }

                match security {
                    None => Ok(TcpStreamPair::plain(stream)),
                    Some(options) => handshake(stream, &target, &options).await,
                }
            }
            .instrument(span),
        )
    }
}

async fn dial(target: &Target, config: &TcpConfig) -> Result<TcpStream, TransportError> {
    let addrs: Vec<_> = tokio::net::lookup_host((target.host.as_str(), target.port))
        .await
        .map_err(|error| TransportError::from_io("dns resolution", error))?
        .collect();

    if addrs.is_empty() {
        return Err(TransportError::stream(format!(
            "no addresses for {}",
            target.host
        )));
    }

    let mut last_error = None;
    for addr in addrs {
        let attempt = TcpStream::connect(addr);
        let connected = match config.connect_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, attempt).await {
                Ok(result) => result,
                Err(_) => {
                    trace!(remote.addr = %addr, "connect timed out");
                    last_error = Some(TransportError::stream("tcp connect timed out"));
                    continue;
                }
            },
            None => attempt.await,
        };
        match connected {
            Ok(stream) => {
                configure(&stream, config);
                return Ok(stream);
            }
            Err(error) => {
                trace!(remote.addr = %addr, %error, "connect attempt failed");
                last_error = Some(TransportError::from_io("tcp connect", error));
            }
        }
    }

    Err(last_error.unwrap_or_else(|| TransportError::stream("exhausted connection candidates")))
}

fn configure(stream: &TcpStream, config: &TcpConfig) {
    if config.nodelay {
        if let Err(error) = stream.set_nodelay(true) {
            warn!(%error, "tcp set_nodelay failed");
        }
    }
    if let Some(timeout) = config.keep_alive_timeout {
        let keepalive = TcpKeepalive::new().with_time(timeout);
        if let Err(error) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
            warn!(%error, "tcp set_keepalive failed");
        }
    }
}

async fn handshake(
    stream: TcpStream,
    target: &Target,
    options: &SecurityOptions,
) -> Result<TcpStreamPair, TransportError> {
    let tls_config = client_config(options)?;

    let name = options
        .peer_name
        .clone()
        .unwrap_or_else(|| target.server_name.clone());
    let server_name = ServerName::try_from(name)
        .map_err(|error| TransportError::stream("invalid server name").with_source(error))?;

    let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));
    let span = tracing::trace_span!("handshake", server = %target.server_name);
    let tls = connector
        .connect(server_name, stream)
        .instrument(span)
        .await
        .map_err(handshake_error)?;

    Ok(TcpStreamPair::tls(tls))
}

/// Map a handshake failure into the security domain, so the fallback
/// machinery can recognize a refusal by its code.
fn handshake_error(error: std::io::Error) -> TransportError {
    let code = match error
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
    {
        Some(rustls::Error::InvalidCertificate(_)) => tls_code::CERT_CHAIN_INVALID,
        Some(_) => tls_code::PROTOCOL,
        None => tls_code::PROTOCOL,
    };
    TransportError::tls(code, "tls handshake failed").with_source(error)
}

fn client_config(options: &SecurityOptions) -> Result<rustls::ClientConfig, TransportError> {
    let config = if options.validates_certificate_chain {
        let mut roots = rustls::RootCertStore::empty();
        let certs = rustls_native_certs::load_native_certs()
            .map_err(|error| TransportError::stream("could not load platform certs").with_source(error))?;
        let (_added, _ignored) = roots.add_parsable_certificates(certs);
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    } else {
        // Lenient mode: the option set turns chain validation off, which in
        // rustls terms is a verifier that accepts whatever is presented.
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PermissiveVerifier))
            .with_no_client_auth()
    };
    Ok(config)
}

/// Certificate verifier for the lenient security level: accepts any chain,
/// any root, and expired material.
#[derive(Debug)]
struct PermissiveVerifier;

impl ServerCertVerifier for PermissiveVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

enum Stream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

/// An opened stream pair over one TCP socket, with or without TLS.
pub struct TcpStreamPair {
    stream: Stream,
    /// The last read filled the caller's buffer, so the TLS layer may hold
    /// more plaintext than socket readiness reflects.
    buffered_read_hint: bool,
}

impl TcpStreamPair {
    fn plain(stream: TcpStream) -> Self {
        Self {
            stream: Stream::Plain(stream),
            buffered_read_hint: false,
        }
    }

    fn tls(stream: tokio_rustls::client::TlsStream<TcpStream>) -> Self {
        Self {
            stream: Stream::Tls(Box::new(stream)),
            buffered_read_hint: false,
        }
    }

    fn tcp(&self) -> &TcpStream {
        match &self.stream {
            Stream::Plain(stream) => stream,
            Stream::Tls(stream) => stream.get_ref().0,
        }
    }
}

impl std::fmt::Debug for TcpStreamPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.stream {
            Stream::Plain(_) => "plain",
            Stream::Tls(_) => "tls",
        };
        f.debug_struct("TcpStreamPair").field("kind", &kind).finish()
    }
}

impl Socket for TcpStreamPair {
    fn next_event(&mut self, write_interest: bool) -> BoxFuture<'_, StreamEvent> {
        Box::pin(async move {
            if self.buffered_read_hint {
                self.buffered_read_hint = false;
                return StreamEvent::BytesAvailable;
            }

            let interest = if write_interest {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };

            match self.tcp().ready(interest).await {
                Ok(ready) if ready.is_read_closed() && !ready.is_readable() => {
                    StreamEvent::EndEncountered(Half::Read)
                }
                Ok(ready) if ready.is_readable() => StreamEvent::BytesAvailable,
                Ok(ready) if ready.is_writable() => StreamEvent::SpaceAvailable,
                Ok(_) => StreamEvent::BytesAvailable,
                Err(error) => {
                    StreamEvent::Failed(Half::Read, TransportError::from_io("stream wait", error))
                }
            }
        })
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<IoOutcome, TransportError> {
        let outcome = match &mut self.stream {
            Stream::Plain(stream) => match stream.try_read(buf) {
                Ok(0) => Ok(IoOutcome::Closed),
                Ok(n) => Ok(IoOutcome::Transferred(n)),
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                    Ok(IoOutcome::WouldBlock)
                }
                Err(error) => Err(TransportError::from_io("read", error)),
            },
            Stream::Tls(stream) => {
                let mut cx = Context::from_waker(noop_waker_ref());
                let mut read_buf = ReadBuf::new(buf);
                match Pin::new(stream.as_mut()).poll_read(&mut cx, &mut read_buf) {
                    Poll::Ready(Ok(())) => match read_buf.filled().len() {
                        0 => Ok(IoOutcome::Closed),
                        n => Ok(IoOutcome::Transferred(n)),
                    },
                    Poll::Ready(Err(error)) => Err(TransportError::from_io("read", error)),
                    Poll::Pending => Ok(IoOutcome::WouldBlock),
                }
            }
        };

        if let Ok(IoOutcome::Transferred(n)) = outcome {
            self.buffered_read_hint = n == buf.len();
        }
        outcome
    }

    fn write(&mut self, buf: &[u8]) -> Result<IoOutcome, TransportError> {
        match &mut self.stream {
            Stream::Plain(stream) => match stream.try_write(buf) {
                Ok(n) => Ok(IoOutcome::Transferred(n)),
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                    Ok(IoOutcome::WouldBlock)
                }
                Err(error) => Err(TransportError::from_io("write", error)),
            },
            Stream::Tls(stream) => {
                let mut cx = Context::from_waker(noop_waker_ref());
                match Pin::new(stream.as_mut()).poll_write(&mut cx, buf) {
                    Poll::Ready(Ok(n)) => {
                        // Push handshake/record bytes toward the socket.
                        let _ = Pin::new(stream.as_mut()).poll_flush(&mut cx);
                        Ok(IoOutcome::Transferred(n))
                    }
                    Poll::Ready(Err(error)) => Err(TransportError::from_io("write", error)),
                    Poll::Pending => Ok(IoOutcome::WouldBlock),
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn target(port: u16) -> Target {
        Target {
            host: "127.0.0.1".into(),
            port,
            server_name: "127.0.0.1".into(),
        }
    }

    #[tokio::test]
    async fn plain_connect_and_write() {
        let _ = tracing_subscriber::fmt::try_init();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let transport = TcpTransport::default();
        let (pair, (mut accepted, _)) = tokio::join!(
            async { transport.connect(target(port), None).await.unwrap() },
            async { listener.accept().await.unwrap() }
        );
        let mut pair = pair;

        // The freshly connected socket reports space before bytes.
        match pair.next_event(true).await {
            StreamEvent::SpaceAvailable => {}
            other => panic!("unexpected event: {other:?}"),
        }

        assert_eq!(
            pair.write(b"ping").unwrap(),
            IoOutcome::Transferred(4)
        );

        let mut received = [0u8; 4];
        accepted.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"ping");
    }

    #[tokio::test]
    async fn read_surfaces_remote_bytes_then_eof() {
        let _ = tracing_subscriber::fmt::try_init();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let transport = TcpTransport::default();
        let (pair, accepted) = tokio::join!(
            async { transport.connect(target(port), None).await.unwrap() },
            async { listener.accept().await.unwrap().0 }
        );
        let mut pair = pair;

        use tokio::io::AsyncWriteExt;
        let mut accepted = accepted;
        accepted.write_all(b"pong").await.unwrap();
        accepted.shutdown().await.unwrap();
        drop(accepted);

        let mut collected = Vec::new();
        loop {
            match pair.next_event(false).await {
                StreamEvent::BytesAvailable => {
                    let mut buf = [0u8; 16];
                    match pair.read(&mut buf).unwrap() {
                        IoOutcome::Transferred(n) => collected.extend_from_slice(&buf[..n]),
                        IoOutcome::WouldBlock => {}
                        IoOutcome::Closed => break,
                    }
                }
                StreamEvent::EndEncountered(_) => break,
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(collected, b"pong");
    }

    #[tokio::test]
    async fn refused_connection_reports_an_error() {
        let _ = tracing_subscriber::fmt::try_init();

        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = TcpTransport::default();
        let result = transport.connect(target(port), None).await;
        assert!(result.is_err());
    }
}
