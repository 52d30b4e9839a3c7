//! NNTP protocol engine (RFC 3977/5536)
//!
//! One [`NntpSession`] per accepted connection, driven serially: read a
//! line, dispatch on the verb, write the reply. POST switches the loop
//! into a continuation that accumulates dot-stuffed frames until the
//! `.` terminator.

mod commands;
mod control;
mod post;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::server::Connections;
use crate::store::{Catalog, Identity, Store};
use crate::stream::Framed;

/// What the dispatcher tells the session loop to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Quit,
}

/// Whether an error means the connection is beyond saving
pub(crate) fn is_fatal(error: &ServerError) -> bool {
    matches!(
        error,
        ServerError::Io(_)
            | ServerError::ConnectionClosed
            | ServerError::Tls(_)
            | ServerError::LineTooLong(_)
    )
}

/// Per-connection NNTP state machine
pub struct NntpSession {
    framed: Framed,
    config: Arc<ServerConfig>,
    store: Arc<dyn Store>,
    acceptor: Option<TlsAcceptor>,
    peer: SocketAddr,
    connections: Arc<Connections>,
    conn_id: u64,
    shutdown: watch::Receiver<bool>,
    /// Keeps a detached session's shutdown channel alive
    _shutdown_tx: Option<watch::Sender<bool>>,

    pending_username: Option<String>,
    identity: Option<Identity>,
    current_catalog: Option<Catalog>,
    current_article: Option<u64>,
    compress: bool,
    tls_active: bool,
}

impl NntpSession {
    /// Create a detached session (tests, embedding) over any transport
    ///
    /// The peer defaults to loopback; there is no TLS acceptor and no
    /// external shutdown signal.
    pub fn new(framed: Framed, config: Arc<ServerConfig>, store: Arc<dyn Store>) -> Self {
        let (tx, rx) = watch::channel(false);
        let connections = Arc::new(Connections::new());
        let conn_id = connections.register(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            0,
            crate::config::EngineKind::Nntp,
        );
        Self {
            framed,
            config,
            store,
            acceptor: None,
            peer: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            connections,
            conn_id,
            shutdown: rx,
            _shutdown_tx: Some(tx),
            pending_username: None,
            identity: None,
            current_catalog: None,
            current_article: None,
            compress: false,
            tls_active: false,
        }
    }

    /// Session wired to a running server
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn attached(
        framed: Framed,
        config: Arc<ServerConfig>,
        store: Arc<dyn Store>,
        acceptor: Option<TlsAcceptor>,
        peer: SocketAddr,
        connections: Arc<Connections>,
        conn_id: u64,
        shutdown: watch::Receiver<bool>,
        tls_active: bool,
    ) -> Self {
        Self {
            framed,
            config,
            store,
            acceptor,
            peer,
            connections,
            conn_id,
            shutdown,
            _shutdown_tx: None,
            pending_username: None,
            identity: None,
            current_catalog: None,
            current_article: None,
            compress: false,
            tls_active,
        }
    }

    /// Override the peer address (detached sessions)
    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = peer;
        self
    }

    /// Provide a TLS acceptor so STARTTLS can complete (detached sessions)
    pub fn with_acceptor(mut self, acceptor: TlsAcceptor) -> Self {
        self.acceptor = Some(acceptor);
        self
    }

    /// Run the session until QUIT, shutdown or a fatal error
    pub async fn run(mut self) -> Result<()> {
        let result = self.serve().await;
        self.framed.shutdown().await.ok();
        self.connections.deregister(self.conn_id);
        match result {
            Err(e) if is_fatal(&e) => {
                debug!(peer = %self.peer, error = %e, "NNTP connection dropped");
                Err(e)
            }
            other => other,
        }
    }

    async fn serve(&mut self) -> Result<()> {
        let greeting = if self.config.allow_posting {
            format!(
                "200 {} Service available, posting allowed",
                self.config.path_host
            )
        } else {
            format!(
                "201 {} Service available, posting prohibited",
                self.config.path_host
            )
        };
        self.framed.write_line(&greeting).await?;

        loop {
            let line = tokio::select! {
                _ = self.shutdown.changed() => {
                    debug!(peer = %self.peer, "NNTP session asked to shut down");
                    return Ok(());
                }
                line = self.framed.read_line() => match line {
                    Ok(line) => line,
                    Err(ServerError::ConnectionClosed) => return Ok(()),
                    Err(e) => return Err(e),
                },
            };

            match self.dispatch(&line).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Quit) => return Ok(()),
                Err(e) if is_fatal(&e) => return Err(e),
                Err(ServerError::StoreUnavailable) => {
                    self.framed
                        .write_line("403 Archive server temporarily offline")
                        .await?;
                }
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "command failed");
                    self.framed.write_line("501 Command syntax error").await?;
                }
            }
        }
    }

    /// Dispatch one command line
    ///
    /// Verbs are case-insensitive; arguments are space-separated after the
    /// verb. Unknown verbs get `500`.
    async fn dispatch(&mut self, line: &str) -> Result<Flow> {
        let trimmed = line.trim_end();
        let (verb, args) = match trimmed.split_once(' ') {
            Some((v, rest)) => (v, rest.trim()),
            None => (trimmed, ""),
        };

        match verb.to_ascii_uppercase().as_str() {
            "CAPABILITIES" => self.cmd_capabilities().await,
            "DATE" => self.cmd_date().await,
            "MODE" => self.cmd_mode(args).await,
            "HELP" => self.cmd_help().await,
            "QUIT" => {
                self.framed.write_line("205 Closing connection").await?;
                Ok(Flow::Quit)
            }
            "AUTHINFO" => self.cmd_authinfo(args).await,
            "GROUP" => self.cmd_group(args).await,
            "LISTGROUP" => self.cmd_listgroup(args).await,
            "LAST" => self.cmd_last_next(false).await,
            "NEXT" => self.cmd_last_next(true).await,
            "STAT" => self.cmd_article(args, commands::ArticlePart::Stat).await,
            "HEAD" => self.cmd_article(args, commands::ArticlePart::Head).await,
            "BODY" => self.cmd_article(args, commands::ArticlePart::Body).await,
            "ARTICLE" => self.cmd_article(args, commands::ArticlePart::Full).await,
            "LIST" => self.cmd_list(args).await,
            "NEWGROUPS" => self.cmd_newgroups(args).await,
            "POST" => self.cmd_post().await,
            "OVER" | "XOVER" => self.cmd_over(args).await,
            "XHDR" => self.cmd_hdr(args, 221).await,
            "HDR" => self.cmd_hdr(args, 225).await,
            "XPAT" => self.cmd_xpat(args).await,
            "XFEATURE" => self.cmd_xfeature(args).await,
            "STARTTLS" => self.cmd_starttls().await,
            _ => {
                self.framed.write_line("500 Command not recognized").await?;
                Ok(Flow::Continue)
            }
        }
    }

    /// Current UTC time, formatted for DATE
    fn date_now() -> String {
        format!("111 {}", Utc::now().format("%Y%m%d%H%M%S"))
    }

    async fn cmd_capabilities(&mut self) -> Result<Flow> {
        let mut caps = vec!["VERSION 2".to_string(), "READER".to_string()];
        if self.config.allow_posting {
            caps.push("POST".to_string());
        }
        caps.push("AUTHINFO USER".to_string());
        caps.push("HDR".to_string());
        caps.push("OVER".to_string());
        caps.push("LIST ACTIVE NEWSGROUPS".to_string());
        caps.push("XFEATURE-COMPRESS GZIP".to_string());
        if self.config.allow_starttls && self.acceptor.is_some() && !self.tls_active {
            caps.push("STARTTLS".to_string());
        }
        caps.push("IMPLEMENTATION newsgate".to_string());
        self.framed.write_line("101 Capability list follows").await?;
        self.framed.write_multiline(&caps, false).await?;
        Ok(Flow::Continue)
    }

    async fn cmd_date(&mut self) -> Result<Flow> {
        self.framed.write_line(&Self::date_now()).await?;
        Ok(Flow::Continue)
    }

    async fn cmd_mode(&mut self, args: &str) -> Result<Flow> {
        if args.eq_ignore_ascii_case("READER") {
            let reply = if self.config.allow_posting {
                "200 Posting allowed"
            } else {
                "201 Posting prohibited"
            };
            self.framed.write_line(reply).await?;
        } else {
            self.framed.write_line("501 Command syntax error").await?;
        }
        Ok(Flow::Continue)
    }

    async fn cmd_help(&mut self) -> Result<Flow> {
        self.framed.write_line("100 Help text follows").await?;
        let lines = [
            "ARTICLE BODY HEAD STAT LAST NEXT",
            "GROUP LISTGROUP LIST NEWGROUPS",
            "OVER XOVER HDR XHDR XPAT",
            "POST AUTHINFO STARTTLS XFEATURE",
            "CAPABILITIES DATE MODE HELP QUIT",
        ];
        self.framed.write_multiline(lines, false).await?;
        Ok(Flow::Continue)
    }

    async fn cmd_authinfo(&mut self, args: &str) -> Result<Flow> {
        let (sub, value) = match args.split_once(' ') {
            Some((s, v)) => (s, v.trim()),
            None => (args, ""),
        };
        if self.identity.is_some() {
            self.framed
                .write_line("482 Authentication commands issued out of sequence")
                .await?;
            return Ok(Flow::Continue);
        }
        match sub.to_ascii_uppercase().as_str() {
            "USER" if !value.is_empty() => {
                self.pending_username = Some(value.to_string());
                self.framed.write_line("381 Password required").await?;
            }
            "PASS" => {
                let Some(username) = self.pending_username.take() else {
                    self.framed
                        .write_line("482 Authentication commands issued out of sequence")
                        .await?;
                    return Ok(Flow::Continue);
                };
                match self.store.get_identity_by_clear_auth(&username, value)? {
                    Some(identity)
                        if identity.flags.local_only && !self.peer.ip().is_loopback() =>
                    {
                        warn!(username, peer = %self.peer, "local-only identity from remote address");
                        self.framed.write_line("481 Authentication failed").await?;
                    }
                    Some(identity) => {
                        self.store.record_login(identity.id)?;
                        self.store.ensure(&identity)?;
                        self.connections
                            .set_username(self.conn_id, &identity.username);
                        debug!(username = identity.username, "NNTP login");
                        self.identity = Some(identity);
                        self.framed.write_line("281 Authentication accepted").await?;
                    }
                    None => {
                        self.framed.write_line("481 Authentication failed").await?;
                    }
                }
            }
            _ => {
                self.framed.write_line("501 Command syntax error").await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn cmd_xfeature(&mut self, args: &str) -> Result<Flow> {
        let upper = args.to_ascii_uppercase();
        if upper == "COMPRESS GZIP" || upper == "COMPRESS GZIP TERMINATOR" {
            self.compress = true;
            debug!(peer = %self.peer, "XFEATURE COMPRESS GZIP enabled");
            self.framed.write_line("290 feature enabled").await?;
        } else {
            self.framed.write_line("501 Command syntax error").await?;
        }
        Ok(Flow::Continue)
    }

    async fn cmd_starttls(&mut self) -> Result<Flow> {
        if self.tls_active || !self.config.allow_starttls {
            self.framed
                .write_line("580 Can not initiate TLS negotiation")
                .await?;
            return Ok(Flow::Continue);
        }
        let Some(acceptor) = self.acceptor.clone() else {
            self.framed
                .write_line("580 Can not initiate TLS negotiation")
                .await?;
            return Ok(Flow::Continue);
        };
        self.framed
            .write_line("382 Continue with TLS negotiation")
            .await?;
        self.framed.starttls(&acceptor).await?;
        self.tls_active = true;
        debug!(peer = %self.peer, "TLS established via STARTTLS");
        Ok(Flow::Continue)
    }
}
