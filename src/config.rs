//! Server configuration
//!
//! The engines require only: the list of (port, class, engine) bindings,
//! the allow-posting and allow-starttls flags, the path-host string, and
//! an optional TLS certificate. Config-file loading and CLI parsing live
//! outside this crate.

use std::path::PathBuf;

/// How a listening port handles TLS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PortClass {
    /// Plain TCP, no TLS available
    ClearText,
    /// TLS handshake performed before any protocol bytes
    ImplicitTls,
    /// Plain TCP with STARTTLS upgrade available
    ExplicitTls,
}

/// Which protocol engine serves a listening port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EngineKind {
    /// NNTP (RFC 3977) reader engine
    Nntp,
    /// IMAP4rev1 (RFC 3501) engine
    Imap,
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineKind::Nntp => write!(f, "NNTP"),
            EngineKind::Imap => write!(f, "IMAP"),
        }
    }
}

/// A single listening port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PortBinding {
    /// TCP port to bind
    pub port: u16,
    /// TLS behavior of the port
    pub class: PortClass,
    /// Engine handed the accepted connections
    pub engine: EngineKind,
}

impl PortBinding {
    /// Create a binding
    pub fn new(port: u16, class: PortClass, engine: EngineKind) -> Self {
        Self {
            port,
            class,
            engine,
        }
    }
}

/// Paths to the server TLS identity (PEM encoded)
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TlsSettings {
    /// Certificate chain file, leaf first
    pub certificate_chain: PathBuf,
    /// PKCS#8 or RSA private key file
    pub private_key: PathBuf,
}

/// Server configuration
///
/// # Example
///
/// ```
/// use newsgate::{EngineKind, PortClass, ServerConfig};
///
/// let config = ServerConfig::new("news.example.com")
///     .with_port(119, PortClass::ExplicitTls, EngineKind::Nntp)
///     .with_port(143, PortClass::ClearText, EngineKind::Imap);
/// assert!(config.allow_posting);
/// ```
#[must_use]
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServerConfig {
    /// Listening ports
    pub bindings: Vec<PortBinding>,

    /// Whether POST is accepted at all (also selects the 200/201 greeting)
    #[cfg_attr(feature = "serde", serde(default = "default_true"))]
    pub allow_posting: bool,

    /// Whether STARTTLS may be negotiated on `ExplicitTls` ports
    #[cfg_attr(feature = "serde", serde(default))]
    pub allow_starttls: bool,

    /// Hostname used in generated Message-IDs and greetings
    pub path_host: String,

    /// TLS identity, required for `ImplicitTls` ports and STARTTLS
    #[cfg_attr(feature = "serde", serde(default))]
    pub tls: Option<TlsSettings>,
}

#[cfg(feature = "serde")]
fn default_true() -> bool {
    true
}

impl ServerConfig {
    /// Create a configuration with no ports bound yet
    ///
    /// Posting is allowed by default; STARTTLS is off until a TLS identity
    /// is configured.
    pub fn new(path_host: impl Into<String>) -> Self {
        Self {
            bindings: Vec::new(),
            allow_posting: true,
            allow_starttls: false,
            path_host: path_host.into(),
            tls: None,
        }
    }

    /// Add a listening port
    pub fn with_port(mut self, port: u16, class: PortClass, engine: EngineKind) -> Self {
        self.bindings.push(PortBinding::new(port, class, engine));
        self
    }

    /// Disable posting (greeting becomes 201, POST replies 440)
    pub fn read_only(mut self) -> Self {
        self.allow_posting = false;
        self
    }

    /// Configure the TLS identity and permit STARTTLS
    pub fn with_tls(mut self, certificate_chain: PathBuf, private_key: PathBuf) -> Self {
        self.tls = Some(TlsSettings {
            certificate_chain,
            private_key,
        });
        self.allow_starttls = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_defaults() {
        let config = ServerConfig::new("news.example.com");
        assert!(config.bindings.is_empty());
        assert!(config.allow_posting);
        assert!(!config.allow_starttls);
        assert!(config.tls.is_none());
        assert_eq!(config.path_host, "news.example.com");
    }

    #[test]
    fn test_with_port() {
        let config = ServerConfig::new("h")
            .with_port(119, PortClass::ClearText, EngineKind::Nntp)
            .with_port(993, PortClass::ImplicitTls, EngineKind::Imap);
        assert_eq!(config.bindings.len(), 2);
        assert_eq!(config.bindings[0].port, 119);
        assert_eq!(config.bindings[1].class, PortClass::ImplicitTls);
        assert_eq!(config.bindings[1].engine, EngineKind::Imap);
    }

    #[test]
    fn test_read_only() {
        let config = ServerConfig::new("h").read_only();
        assert!(!config.allow_posting);
    }

    #[test]
    fn test_with_tls_enables_starttls() {
        let config = ServerConfig::new("h").with_tls("cert.pem".into(), "key.pem".into());
        assert!(config.allow_starttls);
        assert!(config.tls.is_some());
    }

    #[test]
    fn test_engine_kind_display() {
        assert_eq!(EngineKind::Nntp.to_string(), "NNTP");
        assert_eq!(EngineKind::Imap.to_string(), "IMAP");
    }
}
