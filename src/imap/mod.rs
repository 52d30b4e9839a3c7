//! IMAP4rev1 protocol engine (RFC 3501)
//!
//! Tagged commands, untagged `*` responses, and a per-connection state
//! machine NotAuthenticated → Authenticated → Selected. The engine is
//! strictly serial per connection; untagged responses produced by a
//! command always precede its tagged terminator.

mod commands;
mod fetch;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::nntp::is_fatal;
use crate::server::Connections;
use crate::store::{Catalog, Identity, Store};
use crate::stream::Framed;

/// Split a command line into tag/verb/argument tokens
///
/// Quoted strings collapse to their contents (with `\"` and `\\` escapes);
/// parenthesized and bracketed groups stay intact as single tokens, which
/// keeps `BODY[HEADER.FIELDS (A B)]` and `(UID FLAGS)` together.
pub(crate) fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut was_quoted = false;
    let mut in_quotes = false;
    let mut escaped = false;
    let mut depth = 0u32;

    for c in input.chars() {
        if in_quotes {
            if escaped {
                current.push(c);
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_quotes = false;
            } else {
                current.push(c);
            }
            continue;
        }
        match c {
            '"' if depth == 0 => {
                in_quotes = true;
                was_quoted = true;
            }
            '(' | '[' => {
                depth += 1;
                current.push(c);
            }
            ')' | ']' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ' ' if depth == 0 => {
                if !current.is_empty() || was_quoted {
                    tokens.push(std::mem::take(&mut current));
                }
                was_quoted = false;
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() || was_quoted {
        tokens.push(current);
    }
    tokens
}

/// The selected-mailbox state
#[derive(Debug, Clone)]
pub(crate) struct Selected {
    pub(crate) catalog: Catalog,
    pub(crate) read_only: bool,
}

/// Per-connection IMAP state machine
pub struct ImapSession {
    framed: Framed,
    config: Arc<ServerConfig>,
    store: Arc<dyn Store>,
    peer: SocketAddr,
    connections: Arc<Connections>,
    conn_id: u64,
    shutdown: watch::Receiver<bool>,
    /// Keeps a detached session's shutdown channel alive
    _shutdown_tx: Option<watch::Sender<bool>>,

    identity: Option<Identity>,
    selected: Option<Selected>,
}

impl ImapSession {
    /// Create a detached session (tests, embedding) over any transport
    pub fn new(framed: Framed, config: Arc<ServerConfig>, store: Arc<dyn Store>) -> Self {
        let (tx, rx) = watch::channel(false);
        let connections = Arc::new(Connections::new());
        let conn_id = connections.register(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            0,
            crate::config::EngineKind::Imap,
        );
        Self {
            framed,
            config,
            store,
            peer: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            connections,
            conn_id,
            shutdown: rx,
            _shutdown_tx: Some(tx),
            identity: None,
            selected: None,
        }
    }

    /// Session wired to a running server
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn attached(
        framed: Framed,
        config: Arc<ServerConfig>,
        store: Arc<dyn Store>,
        peer: SocketAddr,
        connections: Arc<Connections>,
        conn_id: u64,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            framed,
            config,
            store,
            peer,
            connections,
            conn_id,
            shutdown,
            _shutdown_tx: None,
            identity: None,
            selected: None,
        }
    }

    /// Override the peer address (detached sessions)
    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = peer;
        self
    }

    /// Run the session until LOGOUT, shutdown or a fatal error
    pub async fn run(mut self) -> Result<()> {
        let result = self.serve().await;
        self.framed.shutdown().await.ok();
        self.connections.deregister(self.conn_id);
        match result {
            Err(e) if is_fatal(&e) => {
                debug!(peer = %self.peer, error = %e, "IMAP connection dropped");
                Err(e)
            }
            other => other,
        }
    }

    async fn serve(&mut self) -> Result<()> {
        self.framed
            .write_line("* OK IMAP4rev1 Service Ready")
            .await?;

        loop {
            let line = tokio::select! {
                _ = self.shutdown.changed() => {
                    debug!(peer = %self.peer, "IMAP session asked to shut down");
                    return Ok(());
                }
                line = self.framed.read_line() => match line {
                    Ok(line) => line,
                    Err(ServerError::ConnectionClosed) => return Ok(()),
                    Err(e) => return Err(e),
                },
            };

            let tokens = tokenize(&line);
            if tokens.is_empty() {
                continue;
            }
            if tokens.len() < 2 {
                self.framed
                    .write_line(&format!("{} BAD Missing command", tokens[0]))
                    .await?;
                continue;
            }
            let tag = tokens[0].clone();

            match self.dispatch(&tag, &tokens[1..]).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) if is_fatal(&e) => return Err(e),
                Err(ServerError::StoreUnavailable) => {
                    self.framed
                        .write_line(&format!("{tag} BAD Archive server temporarily offline"))
                        .await?;
                }
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "command failed");
                    self.framed
                        .write_line(&format!("{tag} BAD Invalid command arguments"))
                        .await?;
                }
            }
        }
    }

    /// Dispatch one tagged command; `Ok(true)` ends the session
    async fn dispatch(&mut self, tag: &str, command: &[String]) -> Result<bool> {
        let verb = command[0].to_ascii_uppercase();
        let args = &command[1..];

        match verb.as_str() {
            "CAPABILITY" => {
                self.framed.write_line("* CAPABILITY IMAP4rev1").await?;
                self.framed
                    .write_line(&format!("{tag} OK CAPABILITY completed"))
                    .await?;
            }
            "NOOP" | "CHECK" => self.cmd_noop(tag, &verb).await?,
            "LOGIN" => self.cmd_login(tag, args).await?,
            "LOGOUT" => {
                self.framed
                    .write_line("* BYE IMAP4rev1 Server logging out")
                    .await?;
                self.framed
                    .write_line(&format!("{tag} OK LOGOUT completed"))
                    .await?;
                return Ok(true);
            }
            "SELECT" => self.cmd_select(tag, args, false).await?,
            "EXAMINE" => self.cmd_select(tag, args, true).await?,
            "CREATE" => self.cmd_create(tag, args).await?,
            "DELETE" => self.cmd_delete(tag, args).await?,
            "SUBSCRIBE" => self.cmd_subscribe(tag, args, true).await?,
            "UNSUBSCRIBE" => self.cmd_subscribe(tag, args, false).await?,
            "LSUB" => self.cmd_lsub(tag, args).await?,
            "LIST" => self.cmd_list(tag, args).await?,
            "STATUS" => self.cmd_status(tag, args).await?,
            "UID" => {
                let sub = args.first().map(|s| s.to_ascii_uppercase());
                if sub.as_deref() == Some("FETCH") {
                    self.cmd_uid_fetch(tag, &args[1..]).await?;
                } else {
                    self.framed
                        .write_line(&format!("{tag} BAD Command not recognized"))
                        .await?;
                }
            }
            _ => {
                self.framed
                    .write_line(&format!("{tag} BAD Command not recognized"))
                    .await?;
            }
        }
        Ok(false)
    }

    /// The authenticated identity, or `None` after writing the NO reply
    async fn require_identity(&mut self, tag: &str) -> Result<Option<Identity>> {
        if let Some(identity) = self.identity.clone() {
            Ok(Some(identity))
        } else {
            self.framed
                .write_line(&format!("{tag} NO Not authenticated"))
                .await?;
            Ok(None)
        }
    }

    async fn cmd_noop(&mut self, tag: &str, verb: &str) -> Result<()> {
        if let Some(selected) = self.selected.clone() {
            // refresh the count so new deliveries become visible
            let exists = self
                .store
                .get_catalog_by_name(self.identity.as_ref(), &selected.catalog.name)?
                .map_or(selected.catalog.message_count, |c| c.message_count);
            self.framed
                .write_line(&format!("* {exists} EXISTS"))
                .await?;
        }
        self.framed
            .write_line(&format!("{tag} OK {verb} completed"))
            .await?;
        Ok(())
    }

    async fn cmd_login(&mut self, tag: &str, args: &[String]) -> Result<()> {
        if self.identity.is_some() {
            self.framed
                .write_line(&format!("{tag} NO LOGIN not allowed now"))
                .await?;
            return Ok(());
        }
        let [username, password] = args else {
            self.framed
                .write_line(&format!("{tag} BAD LOGIN expects a username and a password"))
                .await?;
            return Ok(());
        };
        match self.store.get_identity_by_clear_auth(username, password)? {
            Some(identity) if identity.flags.local_only && !self.peer.ip().is_loopback() => {
                warn!(username, peer = %self.peer, "local-only identity from remote address");
                self.framed
                    .write_line(&format!("{tag} NO LOGIN failed"))
                    .await?;
            }
            Some(identity) => {
                self.store.record_login(identity.id)?;
                self.store.ensure(&identity)?;
                self.connections
                    .set_username(self.conn_id, &identity.username);
                debug!(username = identity.username, "IMAP login");
                self.identity = Some(identity);
                self.framed
                    .write_line(&format!("{tag} OK LOGIN completed"))
                    .await?;
            }
            None => {
                self.framed
                    .write_line(&format!("{tag} NO LOGIN failed"))
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_atoms_and_quotes() {
        assert_eq!(
            tokenize("a001 LOGIN \"alice\" \"pass word\""),
            vec!["a001", "LOGIN", "alice", "pass word"]
        );
    }

    #[test]
    fn test_tokenize_empty_quoted_string() {
        assert_eq!(tokenize("a LIST \"\" \"*\""), vec!["a", "LIST", "", "*"]);
    }

    #[test]
    fn test_tokenize_escapes() {
        assert_eq!(
            tokenize(r#"a LOGIN "al\"ice" "p\\w""#),
            vec!["a", "LOGIN", "al\"ice", "p\\w"]
        );
    }

    #[test]
    fn test_tokenize_parenthesized_group() {
        assert_eq!(
            tokenize("a003 UID FETCH 1:2 (UID FLAGS RFC822.SIZE)"),
            vec!["a003", "UID", "FETCH", "1:2", "(UID FLAGS RFC822.SIZE)"]
        );
    }

    #[test]
    fn test_tokenize_body_section_with_spaces() {
        assert_eq!(
            tokenize("a UID FETCH 1 (BODY[HEADER.FIELDS (Subject From)])"),
            vec![
                "a",
                "UID",
                "FETCH",
                "1",
                "(BODY[HEADER.FIELDS (Subject From)])"
            ]
        );
    }

    #[test]
    fn test_tokenize_collapses_runs_of_spaces() {
        assert_eq!(tokenize("a  NOOP"), vec!["a", "NOOP"]);
    }
}
