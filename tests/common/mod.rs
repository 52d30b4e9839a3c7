//! Shared harness for driving protocol sessions over in-memory pipes

#![allow(dead_code)]

use std::sync::Arc;

use newsgate::{Framed, ImapSession, MemoryStore, NntpSession, ServerConfig, Store};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

/// Client half of a session running in a background task
pub struct TestClient {
    pub reader: BufReader<ReadHalf<DuplexStream>>,
    pub writer: WriteHalf<DuplexStream>,
    pub handle: JoinHandle<()>,
}

impl TestClient {
    /// Read one line, CRLF stripped
    pub async fn line(&mut self) -> String {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .await
            .expect("read from session");
        assert!(n > 0, "session closed unexpectedly");
        line.trim_end_matches(['\r', '\n']).to_string()
    }

    /// Send one line, CRLF appended
    pub async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .expect("write to session");
    }

    /// Read one line and assert its prefix
    pub async fn expect(&mut self, prefix: &str) -> String {
        let line = self.line().await;
        assert!(
            line.starts_with(prefix),
            "expected a line starting with {prefix:?}, got {line:?}"
        );
        line
    }

    /// Read multi-line payload lines until the `.` terminator
    pub async fn read_until_dot(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let line = self.line().await;
            if line == "." {
                return lines;
            }
            lines.push(line);
        }
    }
}

/// Default config used by the session tests
pub fn test_config() -> ServerConfig {
    ServerConfig::new("test.example.com")
}

/// Spawn a detached NNTP session over a duplex pipe
pub fn spawn_nntp_with(store: Arc<MemoryStore>, config: ServerConfig) -> TestClient {
    let (server_io, client_io) = tokio::io::duplex(64 * 1024);
    let store: Arc<dyn Store> = store;
    let session = NntpSession::new(Framed::from_io(server_io), Arc::new(config), store);
    let handle = tokio::spawn(async move {
        let _ = session.run().await;
    });
    let (reader, writer) = tokio::io::split(client_io);
    TestClient {
        reader: BufReader::new(reader),
        writer,
        handle,
    }
}

/// Spawn a detached NNTP session with the default config
pub fn spawn_nntp(store: Arc<MemoryStore>) -> TestClient {
    spawn_nntp_with(store, test_config())
}

/// Spawn a detached IMAP session over a duplex pipe
pub fn spawn_imap(store: Arc<MemoryStore>) -> TestClient {
    let (server_io, client_io) = tokio::io::duplex(64 * 1024);
    let store: Arc<dyn Store> = store;
    let session = ImapSession::new(Framed::from_io(server_io), Arc::new(test_config()), store);
    let handle = tokio::spawn(async move {
        let _ = session.run().await;
    });
    let (reader, writer) = tokio::io::split(client_io);
    TestClient {
        reader: BufReader::new(reader),
        writer,
        handle,
    }
}
