//! Security levels and the per-level handshake option set.
//!
//! The engine never re-derives security inside a handshake: whenever the
//! level changes, the option set is rebuilt wholesale from the level and the
//! connection configuration. Cleartext has no option set at all.

/// How much security the connection currently insists on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityLevel {
    /// Full TLS with certificate-chain validation.
    Strict,
    /// TLS handshake with validation relaxed.
    Lenient,
    /// No TLS; plain TCP on the cleartext port.
    Cleartext,
}

impl SecurityLevel {
    /// The remote port implied by this level.
    pub fn port(self) -> u16 {
        match self {
            SecurityLevel::Strict | SecurityLevel::Lenient => 443,
            SecurityLevel::Cleartext => 80,
        }
    }

    /// Whether a TLS handshake happens at this level.
    pub fn is_secure(self) -> bool {
        !matches!(self, SecurityLevel::Cleartext)
    }

    /// The next level down, if any.
    ///
    /// Whether a fallback is actually permitted is a configuration decision;
    /// this only orders the levels.
    pub fn reduced(self) -> Option<SecurityLevel> {
        match self {
            SecurityLevel::Strict => Some(SecurityLevel::Lenient),
            SecurityLevel::Lenient => Some(SecurityLevel::Cleartext),
            SecurityLevel::Cleartext => None,
        }
    }
}

/// The handshake option set for a secure level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityOptions {
    /// Offer legacy-compatible version negotiation.
    pub legacy_version_negotiation: bool,
    /// Validate the presented certificate chain against trusted roots.
    pub validates_certificate_chain: bool,
    /// Accept certificates past their expiry date.
    pub allows_expired_certificates: bool,
    /// Accept roots past their expiry date.
    pub allows_expired_roots: bool,
    /// Accept chains anchored at any root, trusted or not.
    pub allows_any_root: bool,
    /// Expected peer name, when pinned. The engine never pins.
    pub peer_name: Option<String>,
}

impl SecurityOptions {
    /// Build the option set for `level`; `None` when the level is cleartext.
    pub fn for_level(level: SecurityLevel) -> Option<Self> {
        match level {
            SecurityLevel::Strict => Some(Self {
                legacy_version_negotiation: true,
                validates_certificate_chain: true,
                allows_expired_certificates: false,
                allows_expired_roots: false,
                allows_any_root: false,
                peer_name: None,
            }),
            SecurityLevel::Lenient => Some(Self {
                legacy_version_negotiation: true,
                validates_certificate_chain: false,
                allows_expired_certificates: true,
                allows_expired_roots: true,
                allows_any_root: true,
                peer_name: None,
            }),
            SecurityLevel::Cleartext => None,
        }
    }
}
