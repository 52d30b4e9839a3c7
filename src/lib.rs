#![doc = include_str!("../README.md")]

/// Credential verification (salted SHA-512 verifier)
pub mod auth;
mod config;
mod error;
/// RFC 5322 header block parsing
pub mod headers;
/// IMAP4rev1 protocol engine
pub mod imap;
/// NNTP protocol engine
pub mod nntp;
/// Overview (OVER/XOVER) line construction
pub mod overview;
/// NNTP article range parsing
pub mod range;
mod server;
/// Unified message-store contract and in-memory reference store
pub mod store;
/// Line framing over a TLS-optional byte stream
pub mod stream;
/// Wildmat and IMAP mailbox glob matching
pub mod wildmat;

pub use config::{EngineKind, PortBinding, PortClass, ServerConfig, TlsSettings};
pub use error::{Result, ServerError};
pub use headers::{HeaderBlock, HeaderEntry};
pub use imap::ImapSession;
pub use nntp::NntpSession;
pub use range::ArticleRange;
pub use server::{ConnectionInfo, Connections, Server, load_tls_acceptor};
pub use store::{
    Catalog, DetailFlag, Identity, IdentityFlags, MemoryStore, Message, MessageDetail,
    MetagroupKind, Store,
};
pub use stream::{Framed, Transport};
pub use wildmat::{matches_mailbox_glob, matches_wildmat};
