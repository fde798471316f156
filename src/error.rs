//! Transport error model.
//!
//! Errors surfaced by a stream half keep the originating domain and numeric
//! code so that callers (and the security fallback) can react to the exact
//! condition the platform reported, not a lossy rewording of it.

use std::fmt;
use std::io;
use std::ops::RangeInclusive;

use thiserror::Error;

/// Type-erased error, used for source chains.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Range of handshake rejection codes in the [`ErrorDomain::Tls`] domain.
///
/// Errors in this range mean the remote refused the current security mode
/// and are candidates for a security-level fallback.
pub const TLS_HANDSHAKE_CODES: RangeInclusive<i32> = -9818..=-9800;

/// Well-known codes in the [`ErrorDomain::Tls`] domain.
pub mod tls_code {
    /// Generic handshake protocol failure.
    pub const PROTOCOL: i32 = -9800;
    /// The presented certificate chain did not validate.
    pub const CERT_CHAIN_INVALID: i32 = -9807;
    /// The handshake was closed gracefully by the peer.
    pub const CLOSED_GRACEFUL: i32 = -9805;
}

/// The subsystem an error originated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorDomain {
    /// Operating system level errors; the code is an errno value.
    Posix,
    /// Security layer errors; the code is a handshake status code.
    Tls,
    /// Errors raised by the stream machinery itself.
    Stream,
}

impl fmt::Display for ErrorDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorDomain::Posix => f.write_str("posix"),
            ErrorDomain::Tls => f.write_str("tls"),
            ErrorDomain::Stream => f.write_str("stream"),
        }
    }
}

/// An error reported by one half of the stream pair.
///
/// The original domain and code are always retained; `source` carries the
/// underlying error when one exists.
#[derive(Debug, Error)]
pub struct TransportError {
    domain: ErrorDomain,
    code: i32,
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl TransportError {
    /// Create an error in the given domain.
    pub fn new<S>(domain: ErrorDomain, code: i32, message: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            domain,
            code,
            message: message.into(),
            source: None,
        }
    }

    /// An operating-system error with an errno-style code.
    pub fn posix<S>(code: i32, message: S) -> Self
    where
        S: Into<String>,
    {
        Self::new(ErrorDomain::Posix, code, message)
    }

    /// A security-layer error with a handshake status code.
    pub fn tls<S>(code: i32, message: S) -> Self
    where
        S: Into<String>,
    {
        Self::new(ErrorDomain::Tls, code, message)
    }

    /// An error raised by the stream machinery itself.
    pub fn stream<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self::new(ErrorDomain::Stream, 0, message)
    }

    /// Attach the underlying error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        self.source = Some(source.into());
        self
    }

    /// Wrap an I/O error, keeping the raw OS code when one exists.
    pub fn from_io<S>(message: S, error: io::Error) -> Self
    where
        S: Into<String>,
    {
        let (domain, code) = match error.raw_os_error() {
            Some(code) => (ErrorDomain::Posix, code),
            None => (ErrorDomain::Stream, 0),
        };
        Self::new(domain, code, message).with_source(error)
    }

    /// The domain this error originated in.
    pub fn domain(&self) -> ErrorDomain {
        self.domain
    }

    /// The domain-specific numeric code.
    pub fn code(&self) -> i32 {
        self.code
    }

    /// Whether the remote refused the handshake at the current security
    /// mode, making this error a fallback candidate.
    pub fn is_tls_handshake_failure(&self) -> bool {
        self.domain == ErrorDomain::Tls && TLS_HANDSHAKE_CODES.contains(&self.code)
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error {}: {}", self.domain, self.code, self.message)?;
        if let Some(source) = &self.source {
            write!(f, " ({source})")?;
        }
        Ok(())
    }
}

/// Classification of an error observed by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The stream pair could not be created or configured.
    SetupFailed,
    /// The handshake was refused at the current security mode.
    TlsRejected,
    /// A generic read or write failure.
    Transport,
    /// The remote closed a half of the stream pair.
    RemoteClosed,
    /// A write failure correlated with a partially-sent request buffer.
    RequestWriteFailed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::SetupFailed => f.write_str("setup failed"),
            ErrorKind::TlsRejected => f.write_str("tls rejected"),
            ErrorKind::Transport => f.write_str("transport error"),
            ErrorKind::RemoteClosed => f.write_str("remote closed"),
            ErrorKind::RequestWriteFailed => f.write_str("request write failed"),
        }
    }
}

/// Classify a raw stream error.
///
/// Context-dependent kinds ([`ErrorKind::SetupFailed`],
/// [`ErrorKind::RemoteClosed`], [`ErrorKind::RequestWriteFailed`]) are
/// assigned by the engine at the point the condition is observed; this
/// function only distinguishes handshake refusals from generic failures.
pub fn classify(error: &TransportError) -> ErrorKind {
    if error.is_tls_handshake_failure() {
        ErrorKind::TlsRejected
    } else {
        ErrorKind::Transport
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tls_range_boundaries() {
        assert!(TransportError::tls(-9818, "low edge").is_tls_handshake_failure());
        assert!(TransportError::tls(-9800, "high edge").is_tls_handshake_failure());
        assert!(!TransportError::tls(-9819, "below").is_tls_handshake_failure());
        assert!(!TransportError::tls(-9799, "above").is_tls_handshake_failure());
        assert!(!TransportError::posix(-9807, "wrong domain").is_tls_handshake_failure());
    }

    #[test]
    fn classify_kinds() {
        assert_eq!(
            classify(&TransportError::tls(tls_code::CERT_CHAIN_INVALID, "refused")),
            ErrorKind::TlsRejected
        );
        assert_eq!(
            classify(&TransportError::posix(54, "reset by peer")),
            ErrorKind::Transport
        );
        assert_eq!(classify(&TransportError::stream("oops")), ErrorKind::Transport);
    }

    #[test]
    fn io_errors_keep_the_os_code() {
        let err = io::Error::from_raw_os_error(32);
        let wrapped = TransportError::from_io("write", err);
        assert_eq!(wrapped.domain(), ErrorDomain::Posix);
        assert_eq!(wrapped.code(), 32);
        assert!(std::error::Error::source(&wrapped).is_some());
    }

    #[test]
    fn display_includes_domain_and_code() {
        let err = TransportError::tls(tls_code::PROTOCOL, "handshake refused");
        assert_eq!(err.to_string(), "tls error -9800: handshake refused");
    }
}
