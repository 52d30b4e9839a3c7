//! Listener and connection lifecycle
//!
//! Each configured port binds a listener of one of three classes:
//! cleartext, implicit TLS (handshake before any protocol bytes) or
//! explicit TLS (STARTTLS upgrade). Accepted connections are tuned,
//! registered in the server-wide connection set and handed to the right
//! engine. Server stop cancels the accept loops first, then asks every
//! live connection to shut down with a best-effort grace period.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig as TlsServerConfig;
use tracing::{debug, error, info, warn};

use crate::config::{EngineKind, PortBinding, PortClass, ServerConfig, TlsSettings};
use crate::error::{Result, ServerError};
use crate::imap::ImapSession;
use crate::nntp::NntpSession;
use crate::store::Store;
use crate::stream::Framed;

/// TCP keepalive probe time for accepted connections
const KEEPALIVE_TIME: Duration = Duration::from_secs(120);

/// How long shutdown waits for live connections to drain
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Metadata snapshot of one live connection
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Server-unique connection id
    pub id: u64,
    /// Peer address
    pub remote: SocketAddr,
    /// Local port the connection arrived on
    pub port: u16,
    /// Engine serving the connection
    pub engine: EngineKind,
    /// Authenticated username, once known
    pub username: Option<String>,
}

/// Concurrent set of live connections
#[derive(Default)]
pub struct Connections {
    next_id: AtomicU64,
    inner: Mutex<HashMap<u64, ConnectionInfo>>,
}

impl Connections {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, remote: SocketAddr, port: u16, engine: EngineKind) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let info = ConnectionInfo {
            id,
            remote,
            port,
            engine,
            username: None,
        };
        self.lock().insert(id, info);
        id
    }

    pub(crate) fn deregister(&self, id: u64) {
        self.lock().remove(&id);
    }

    pub(crate) fn set_username(&self, id: u64, username: &str) {
        if let Some(info) = self.lock().get_mut(&id) {
            info.username = Some(username.to_string());
        }
    }

    /// Snapshot of every live connection
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, ConnectionInfo>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Build a TLS acceptor from PEM files
///
/// # Errors
///
/// [`ServerError::Tls`] when the files hold no certificate or key, or the
/// pair is rejected by rustls.
pub fn load_tls_acceptor(settings: &TlsSettings) -> Result<TlsAcceptor> {
    use tokio_rustls::rustls::crypto::{CryptoProvider, ring};
    let _ = CryptoProvider::install_default(ring::default_provider());

    let mut cert_reader = BufReader::new(File::open(&settings.certificate_chain)?);
    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<std::io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(ServerError::Tls("no certificates found".to_string()));
    }

    let mut key_reader = BufReader::new(File::open(&settings.private_key)?);
    let key = rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| ServerError::Tls("no private key found".to_string()))?;

    let config = TlsServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls(e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// The dual-protocol server
pub struct Server {
    config: Arc<ServerConfig>,
    store: Arc<dyn Store>,
    connections: Arc<Connections>,
    acceptor: Option<TlsAcceptor>,
    shutdown_tx: watch::Sender<bool>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    /// Create a server; loads the TLS identity if one is configured
    ///
    /// # Errors
    ///
    /// [`ServerError::Config`] when an implicit-TLS port is bound without
    /// a TLS identity; [`ServerError::Tls`] when certificate loading fails.
    pub fn new(config: ServerConfig, store: Arc<dyn Store>) -> Result<Self> {
        let acceptor = config.tls.as_ref().map(load_tls_acceptor).transpose()?;
        if acceptor.is_none()
            && config
                .bindings
                .iter()
                .any(|b| b.class == PortClass::ImplicitTls)
        {
            return Err(ServerError::Config(
                "implicit-TLS port configured without a TLS identity".to_string(),
            ));
        }
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            config: Arc::new(config),
            store,
            connections: Arc::new(Connections::new()),
            acceptor,
            shutdown_tx,
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// Bind every configured port and start accepting
    ///
    /// Returns the bound local addresses, in binding order (useful with
    /// port 0).
    pub async fn start(&self) -> Result<Vec<SocketAddr>> {
        let mut bound = Vec::with_capacity(self.config.bindings.len());
        for binding in self.config.bindings.clone() {
            let listener = TcpListener::bind(("0.0.0.0", binding.port)).await?;
            let local = listener.local_addr()?;
            info!(%local, engine = %binding.engine, class = ?binding.class, "listening");
            bound.push(local);

            let config = self.config.clone();
            let store = self.store.clone();
            let connections = self.connections.clone();
            let acceptor = self.acceptor.clone();
            let shutdown = self.shutdown_tx.subscribe();
            let handle = tokio::spawn(accept_loop(
                listener,
                binding,
                config,
                store,
                connections,
                acceptor,
                shutdown,
            ));
            self.listeners
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(handle);
        }
        Ok(bound)
    }

    /// Metadata snapshots of the live connections
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.connections.snapshot()
    }

    /// Stop accepting, ask live connections to shut down, wait briefly
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            handle.abort();
        }
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while !self.connections.snapshot().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        info!("server stopped");
    }
}

/// Set nodelay and keepalive on an accepted socket
fn tune_socket(stream: &TcpStream) -> std::io::Result<()> {
    let sock = SockRef::from(stream);
    sock.set_nodelay(true)?;
    sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_TIME))?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    listener: TcpListener,
    binding: PortBinding,
    config: Arc<ServerConfig>,
    store: Arc<dyn Store>,
    connections: Arc<Connections>,
    acceptor: Option<TlsAcceptor>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, remote)) => {
                debug!(%remote, port = binding.port, "accepted connection");
                let config = config.clone();
                let store = store.clone();
                let connections = connections.clone();
                let acceptor = acceptor.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    handle_connection(
                        stream,
                        remote,
                        binding,
                        config,
                        store,
                        connections,
                        acceptor,
                        shutdown,
                    )
                    .await;
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_connection(
    stream: TcpStream,
    remote: SocketAddr,
    binding: PortBinding,
    config: Arc<ServerConfig>,
    store: Arc<dyn Store>,
    connections: Arc<Connections>,
    acceptor: Option<TlsAcceptor>,
    shutdown: watch::Receiver<bool>,
) {
    if let Err(e) = tune_socket(&stream) {
        warn!(%remote, error = %e, "socket tuning failed");
    }

    // implicit TLS handshakes before the connection is registered
    let (framed, tls_active) = match binding.class {
        PortClass::ImplicitTls => {
            let Some(acceptor) = acceptor.clone() else {
                error!(%remote, "implicit-TLS port has no acceptor");
                return;
            };
            match acceptor.accept(stream).await {
                Ok(tls) => (Framed::from_io(tls), true),
                Err(e) => {
                    warn!(%remote, error = %e, "TLS handshake failed");
                    return;
                }
            }
        }
        _ => (Framed::from_io(stream), false),
    };

    let conn_id = connections.register(remote, binding.port, binding.engine);
    let result = match binding.engine {
        EngineKind::Nntp => {
            let starttls_acceptor = if binding.class == PortClass::ExplicitTls {
                acceptor
            } else {
                None
            };
            NntpSession::attached(
                framed,
                config,
                store,
                starttls_acceptor,
                remote,
                connections,
                conn_id,
                shutdown,
                tls_active,
            )
            .run()
            .await
        }
        EngineKind::Imap => ImapSession::attached(
            framed, config, store, remote, connections, conn_id, shutdown,
        )
        .run()
        .await,
    };
    if let Err(e) = result {
        debug!(%remote, error = %e, "connection ended with error");
    }
}
