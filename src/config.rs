//! Connection configuration.
//!
//! A connection takes a snapshot of this configuration at construction;
//! changing the source of the snapshot afterwards never reconfigures an
//! already-open connection.

use crate::security::SecurityLevel;

/// Deployment mode for delegate fan-out and the connection registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deployment {
    /// Constrained deployments: one process-wide shared connection, many
    /// delegates per connection.
    Handheld,
    /// Desktop-class deployments: one connection per identifier, a single
    /// delegate per connection.
    Desktop,
}

/// A proxy the transport should dial instead of the origin.
///
/// The engine only consumes the descriptor; discovering it is someone
/// else's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyDescriptor {
    /// Proxy host.
    pub host: String,
    /// Proxy port.
    pub port: u16,
}

/// Configuration snapshot for a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// The remote origin host.
    pub origin: String,
    /// Start at the strict security level rather than cleartext.
    pub secure_origin: bool,
    /// Permit falling back from strict to lenient validation when the
    /// remote refuses the handshake.
    pub allow_reduced_security: bool,
    /// Permit falling back from lenient validation to cleartext.
    pub allow_cleartext_fallback: bool,
    /// Optional proxy to dial through.
    pub proxy: Option<ProxyDescriptor>,
}

impl ConnectionConfig {
    /// Configuration for `origin` with secure defaults and no fallbacks.
    pub fn new<S>(origin: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            origin: origin.into(),
            secure_origin: true,
            allow_reduced_security: false,
            allow_cleartext_fallback: false,
            proxy: None,
        }
    }

    /// Start a builder for `origin`.
    pub fn builder<S>(origin: S) -> ConnectionConfigBuilder
    where
        S: Into<String>,
    {
        ConnectionConfigBuilder {
            config: Self::new(origin),
        }
    }

    /// The security level a fresh connection starts at.
    pub fn initial_security_level(&self) -> SecurityLevel {
        if self.secure_origin {
            SecurityLevel::Strict
        } else {
            SecurityLevel::Cleartext
        }
    }
}

/// Builder for [`ConnectionConfig`].
#[derive(Debug)]
pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
}

impl ConnectionConfigBuilder {
    /// Prefer cleartext from the start.
    pub fn with_insecure(mut self) -> Self {
        self.config.secure_origin = false;
        self
    }

    /// Permit the strict → lenient fallback.
    pub fn with_reduced_security(mut self, allow: bool) -> Self {
        self.config.allow_reduced_security = allow;
        self
    }

    /// Permit the lenient → cleartext fallback.
    pub fn with_cleartext_fallback(mut self, allow: bool) -> Self {
        self.config.allow_cleartext_fallback = allow;
        self
    }

    /// Dial through `proxy` instead of the origin.
    pub fn with_proxy(mut self, proxy: ProxyDescriptor) -> Self {
        self.config.proxy = Some(proxy);
        self
    }

    /// Finish the builder.
    pub fn build(self) -> ConnectionConfig {
        self.config
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn secure_origin_starts_strict() {
        let config = ConnectionConfig::new("origin.example.com");
        assert_eq!(config.initial_security_level(), SecurityLevel::Strict);
    }

    #[test]
    fn insecure_origin_starts_cleartext() {
        let config = ConnectionConfig::builder("origin.example.com")
            .with_insecure()
            .build();
        assert_eq!(config.initial_security_level(), SecurityLevel::Cleartext);
    }

    #[test]
    fn builder_round_trip() {
        let config = ConnectionConfig::builder("origin.example.com")
            .with_reduced_security(true)
            .with_cleartext_fallback(true)
            .with_proxy(ProxyDescriptor {
                host: "proxy.example.com".into(),
                port: 3128,
            })
            .build();
        assert!(config.allow_reduced_security);
        assert!(config.allow_cleartext_fallback);
        assert_eq!(config.proxy.as_ref().unwrap().port, 3128);
    }
}
