//! End-to-end NNTP session tests
//!
//! Each test drives a detached session over an in-memory duplex pipe,
//! speaking the literal wire protocol and asserting the literal replies.

mod common;

use std::sync::Arc;

use common::{TestClient, spawn_nntp, spawn_nntp_with, test_config};
use newsgate::{IdentityFlags, MemoryStore, Store};

async fn login(client: &mut TestClient, username: &str, password: &str) {
    client.send(&format!("AUTHINFO USER {username}")).await;
    client.expect("381 ").await;
    client.send(&format!("AUTHINFO PASS {password}")).await;
    client.expect("281 ").await;
}

fn store_with_user() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.add_identity("alice", "pw", IdentityFlags::default());
    store
}

// Greeting and basic commands

#[tokio::test]
async fn test_greeting_posting_allowed() {
    let mut client = spawn_nntp(Arc::new(MemoryStore::new()));
    let greeting = client.expect("200 ").await;
    assert!(greeting.contains("posting allowed"));
}

#[tokio::test]
async fn test_greeting_posting_prohibited() {
    let mut client = spawn_nntp_with(Arc::new(MemoryStore::new()), test_config().read_only());
    client.expect("201 ").await;
}

#[tokio::test]
async fn test_quit() {
    let mut client = spawn_nntp(Arc::new(MemoryStore::new()));
    client.expect("200 ").await;
    client.send("QUIT").await;
    client.expect("205 ").await;
}

#[tokio::test]
async fn test_unknown_command() {
    let mut client = spawn_nntp(Arc::new(MemoryStore::new()));
    client.expect("200 ").await;
    client.send("FROBNICATE").await;
    client.expect("500 ").await;
}

#[tokio::test]
async fn test_capabilities_and_date() {
    let mut client = spawn_nntp(Arc::new(MemoryStore::new()));
    client.expect("200 ").await;

    client.send("CAPABILITIES").await;
    client.expect("101 ").await;
    let caps = client.read_until_dot().await;
    assert!(caps.iter().any(|c| c == "VERSION 2"));
    assert!(caps.iter().any(|c| c == "READER"));
    assert!(caps.iter().any(|c| c == "XFEATURE-COMPRESS GZIP"));

    client.send("DATE").await;
    let date = client.expect("111 ").await;
    assert_eq!(date.len(), "111 ".len() + 14);
}

// Authentication

#[tokio::test]
async fn test_authinfo_flow() {
    let store = store_with_user();
    let mut client = spawn_nntp(store);
    client.expect("200 ").await;

    client.send("AUTHINFO USER alice").await;
    client.expect("381 Password required").await;
    client.send("AUTHINFO PASS wrong").await;
    client.expect("481 ").await;

    client.send("AUTHINFO USER alice").await;
    client.expect("381 ").await;
    client.send("AUTHINFO PASS pw").await;
    client.expect("281 Authentication accepted").await;
}

#[tokio::test]
async fn test_authinfo_pass_before_user() {
    let store = store_with_user();
    let mut client = spawn_nntp(store);
    client.expect("200 ").await;
    client.send("AUTHINFO PASS pw").await;
    client.expect("482 ").await;
}

// Group selection and listings (spec scenario: LIST after GROUP)

#[tokio::test]
async fn test_group_then_list_active() {
    let store = Arc::new(MemoryStore::new());
    store.add_catalog("freenews.config", false, true, None);
    let mut client = spawn_nntp(store);
    client.expect("200 ").await;

    client.send("GROUP freenews.config").await;
    let reply = client.line().await;
    assert_eq!(reply, "211 0 0 0 freenews.config");

    client.send("LIST ACTIVE").await;
    client.expect("215 list of newsgroups follows").await;
    let lines = client.read_until_dot().await;
    assert_eq!(lines, vec!["freenews.config 0 0 n"]);
}

#[tokio::test]
async fn test_group_unknown() {
    let mut client = spawn_nntp(Arc::new(MemoryStore::new()));
    client.expect("200 ").await;
    client.send("GROUP nowhere").await;
    client.expect("411 ").await;
}

#[tokio::test]
async fn test_list_active_wildmat() {
    let store = Arc::new(MemoryStore::new());
    store.add_catalog("comp.lang.rust", false, false, None);
    store.add_catalog("alt.test", false, false, None);
    let mut client = spawn_nntp(store);
    client.expect("200 ").await;

    client.send("LIST ACTIVE comp.*").await;
    client.expect("215 ").await;
    let lines = client.read_until_dot().await;
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("comp.lang.rust "));
}

#[tokio::test]
async fn test_list_newsgroups_descriptions() {
    let store = Arc::new(MemoryStore::new());
    store.add_catalog("local.general", false, false, Some("General discussion"));
    let mut client = spawn_nntp(store);
    client.expect("200 ").await;

    client.send("LIST NEWSGROUPS").await;
    client.expect("215 ").await;
    let lines = client.read_until_dot().await;
    assert_eq!(lines, vec!["local.general\tGeneral discussion"]);
}

// Posting (spec scenario: POST happy path)

#[tokio::test]
async fn test_post_article() {
    let store = store_with_user();
    store.add_catalog("g", false, false, None);
    let mut client = spawn_nntp(store.clone());
    client.expect("200 ").await;
    login(&mut client, "alice", "pw").await;

    client.send("POST").await;
    client.expect("340 Send article to be posted").await;
    client.send("From: a@b").await;
    client.send("Newsgroups: g").await;
    client.send("Subject: s").await;
    client.send("").await;
    client.send("hello").await;
    client.send(".").await;
    client.expect("240 Article received OK").await;

    client.send("GROUP g").await;
    client.expect("211 1 1 1 g").await;
    client.send("ARTICLE 1").await;
    client.expect("220 1 <").await;
    let lines = client.read_until_dot().await;
    assert!(lines.iter().any(|l| l == "From: a@b"));
    assert!(lines.iter().any(|l| l.starts_with("Injection-Date: ")));
    assert!(lines.iter().any(|l| l == "hello"));
}

#[tokio::test]
async fn test_post_requires_authentication() {
    let mut client = spawn_nntp(Arc::new(MemoryStore::new()));
    client.expect("200 ").await;
    client.send("POST").await;
    client.expect("480 ").await;
}

#[tokio::test]
async fn test_post_denied_when_read_only() {
    let mut client = spawn_nntp_with(store_with_user(), test_config().read_only());
    client.expect("201 ").await;
    client.send("POST").await;
    client.expect("440 Posting not permitted").await;
}

#[tokio::test]
async fn test_post_malformed_article() {
    let store = store_with_user();
    let mut client = spawn_nntp(store);
    client.expect("200 ").await;
    login(&mut client, "alice", "pw").await;

    client.send("POST").await;
    client.expect("340 ").await;
    client.send("this is not a header").await;
    client.send("").await;
    client.send("body").await;
    client.send(".").await;
    client.expect("441 Posting failed").await;
}

#[tokio::test]
async fn test_post_dot_stuffed_body() {
    let store = store_with_user();
    store.add_catalog("g", false, false, None);
    let mut client = spawn_nntp(store.clone());
    client.expect("200 ").await;
    login(&mut client, "alice", "pw").await;

    client.send("POST").await;
    client.expect("340 ").await;
    client.send("From: a@b").await;
    client.send("Newsgroups: g").await;
    client.send("Subject: s").await;
    client.send("Message-ID: <stuffed@x>").await;
    client.send("").await;
    client.send("..leading dot line").await;
    client.send(".").await;
    client.expect("240 ").await;

    let identity = store.get_identity_by_clear_auth("alice", "pw").unwrap().unwrap();
    let messages = store
        .get_messages(Some(&identity), "g", 1, None)
        .unwrap()
        .unwrap();
    assert_eq!(messages[0].body, ".leading dot line");
}

// Control messages (spec scenario: unauthorized cancel)

#[tokio::test]
async fn test_cancel_denied_without_permission() {
    let store = store_with_user();
    store.add_catalog("g", false, false, None);
    let mut client = spawn_nntp(store);
    client.expect("200 ").await;
    login(&mut client, "alice", "pw").await;

    client.send("POST").await;
    client.expect("340 ").await;
    client.send("From: a@b").await;
    client.send("Newsgroups: g").await;
    client.send("Subject: cancel request").await;
    client.send("Control: cancel <victim@x>").await;
    client.send("").await;
    client.send("cancel").await;
    client.send(".").await;
    client
        .expect("480 Permission to issue control message denied")
        .await;
}

#[tokio::test]
async fn test_cancel_by_authorized_user() {
    let store = Arc::new(MemoryStore::new());
    store.add_identity(
        "killer",
        "pw",
        IdentityFlags {
            can_cancel: true,
            ..Default::default()
        },
    );
    store.add_catalog("g", false, false, None);
    let mut client = spawn_nntp(store.clone());
    client.expect("200 ").await;
    login(&mut client, "killer", "pw").await;

    // post the target article first
    client.send("POST").await;
    client.expect("340 ").await;
    client.send("From: a@b").await;
    client.send("Newsgroups: g").await;
    client.send("Subject: target").await;
    client.send("Message-ID: <target@x>").await;
    client.send("").await;
    client.send("body").await;
    client.send(".").await;
    client.expect("240 ").await;

    // then cancel it
    client.send("POST").await;
    client.expect("340 ").await;
    client.send("From: a@b").await;
    client.send("Newsgroups: g").await;
    client.send("Subject: cmsg cancel <target@x>").await;
    client.send("Control: cancel <target@x>").await;
    client.send("").await;
    client.send("cancel").await;
    client.send(".").await;
    client.expect("240 ").await;

    // target and the cancel message itself are both hidden now
    client.send("GROUP g").await;
    client.expect("211 0 0 2 g").await;

    // but visible through the deleted metagroup
    client.send("GROUP g.deleted").await;
    client.expect("211 2 ").await;
}

#[tokio::test]
async fn test_metagroup_denied_without_permission() {
    let store = store_with_user();
    store.add_catalog("g", false, false, None);
    let mut client = spawn_nntp(store);
    client.expect("200 ").await;
    login(&mut client, "alice", "pw").await;
    client.send("GROUP g.deleted").await;
    client.expect("411 ").await;
}

// Moderation approval flow

#[tokio::test]
async fn test_moderated_post_and_approval() {
    let store = Arc::new(MemoryStore::new());
    store.add_identity("alice", "pw", IdentityFlags::default());
    store.add_identity("mod", "pw", IdentityFlags::default());
    store.add_moderator("mod", "m.group");
    store.add_catalog("m.group", true, false, None);

    // plain user's post lands pending
    let mut alice = spawn_nntp(store.clone());
    alice.expect("200 ").await;
    login(&mut alice, "alice", "pw").await;
    alice.send("POST").await;
    alice.expect("340 ").await;
    alice.send("From: a@b").await;
    alice.send("Newsgroups: m.group").await;
    alice.send("Subject: needs approval").await;
    alice.send("Message-ID: <pend@x>").await;
    alice.send("").await;
    alice.send("body").await;
    alice.send(".").await;
    alice.expect("240 ").await;
    alice.send("GROUP m.group").await;
    alice.expect("211 0 ").await;

    // the moderator releases it with an APPROVED reply
    let mut moderator = spawn_nntp(store.clone());
    moderator.expect("200 ").await;
    login(&mut moderator, "mod", "pw").await;
    moderator.send("POST").await;
    moderator.expect("340 ").await;
    moderator.send("From: mod@test.example.com").await;
    moderator.send("Newsgroups: m.group").await;
    moderator.send("Subject: approval").await;
    moderator.send("References: <pend@x>").await;
    moderator.send("").await;
    moderator.send("APPROVED").await;
    moderator.send(".").await;
    moderator.expect("240 ").await;

    alice.send("GROUP m.group").await;
    alice.expect("211 1 ").await;
}

// Article navigation and retrieval

async fn seed_two_articles(store: &Arc<MemoryStore>) {
    let identity = store.add_identity("seeder", "pw", IdentityFlags::default());
    store.add_catalog("nav", false, false, None);
    for (id, subject) in [("<n1@x>", "first"), ("<n2@x>", "second")] {
        let headers = newsgate::HeaderBlock::parse(&format!(
            "From: s@x\r\nNewsgroups: nav\r\nSubject: {subject}\r\nMessage-ID: {id}\r\nDate: Thu, 01 Jan 2026 00:00:00 +0000"
        ))
        .unwrap();
        store
            .save_message(&identity, &["nav".to_string()], &headers, "payload")
            .unwrap();
    }
}

#[tokio::test]
async fn test_next_and_last() {
    let store = Arc::new(MemoryStore::new());
    seed_two_articles(&store).await;
    let mut client = spawn_nntp(store);
    client.expect("200 ").await;

    client.send("GROUP nav").await;
    client.expect("211 2 1 2 nav").await;

    client.send("NEXT").await;
    client.expect("223 2 <n2@x>").await;
    client.send("NEXT").await;
    client.expect("421 ").await;
    client.send("LAST").await;
    client.expect("223 1 <n1@x>").await;
    client.send("LAST").await;
    client.expect("422 ").await;
}

#[tokio::test]
async fn test_stat_head_body_by_number_and_id() {
    let store = Arc::new(MemoryStore::new());
    seed_two_articles(&store).await;
    let mut client = spawn_nntp(store);
    client.expect("200 ").await;
    client.send("GROUP nav").await;
    client.expect("211 ").await;

    client.send("STAT 1").await;
    client.expect("223 1 <n1@x>").await;

    client.send("HEAD 2").await;
    client.expect("221 2 <n2@x>").await;
    let head = client.read_until_dot().await;
    assert!(head.iter().any(|l| l == "Subject: second"));

    client.send("BODY 1").await;
    client.expect("222 1 <n1@x>").await;
    assert_eq!(client.read_until_dot().await, vec!["payload"]);

    client.send("ARTICLE <n2@x>").await;
    client.expect("220 0 <n2@x>").await;
    client.read_until_dot().await;

    client.send("STAT 99").await;
    client.expect("423 ").await;
    client.send("ARTICLE <ghost@x>").await;
    client.expect("430 ").await;
}

#[tokio::test]
async fn test_article_requires_group() {
    let mut client = spawn_nntp(Arc::new(MemoryStore::new()));
    client.expect("200 ").await;
    client.send("ARTICLE 1").await;
    client.expect("412 ").await;
}

// Overview and header extraction

#[tokio::test]
async fn test_xover_range() {
    let store = Arc::new(MemoryStore::new());
    seed_two_articles(&store).await;
    let mut client = spawn_nntp(store);
    client.expect("200 ").await;
    client.send("GROUP nav").await;
    client.expect("211 ").await;

    client.send("XOVER 1-2").await;
    client.expect("224 Overview information follows").await;
    let lines = client.read_until_dot().await;
    assert_eq!(lines.len(), 2);
    let fields: Vec<&str> = lines[0].split('\t').collect();
    assert_eq!(fields.len(), 8);
    assert_eq!(fields[0], "1");
    assert_eq!(fields[1], "first");
    assert_eq!(fields[4], "<n1@x>");

    client.send("XOVER 5-9").await;
    client.expect("423 ").await;

    client.send("XOVER bogus").await;
    client.expect("501 ").await;
}

#[tokio::test]
async fn test_xhdr_and_xpat() {
    let store = Arc::new(MemoryStore::new());
    seed_two_articles(&store).await;
    let mut client = spawn_nntp(store);
    client.expect("200 ").await;
    client.send("GROUP nav").await;
    client.expect("211 ").await;

    client.send("XHDR Subject 1-2").await;
    client.expect("221 ").await;
    assert_eq!(
        client.read_until_dot().await,
        vec!["1 first", "2 second"]
    );

    client.send("XPAT Subject 1-2 sec*").await;
    client.expect("221 ").await;
    assert_eq!(client.read_until_dot().await, vec!["2 second"]);
}

// Compression

#[tokio::test]
async fn test_xfeature_compressed_xover() {
    use flate2::read::ZlibDecoder;
    use std::io::Read as _;
    use tokio::io::AsyncReadExt as _;

    let store = Arc::new(MemoryStore::new());
    seed_two_articles(&store).await;
    let mut client = spawn_nntp(store);
    client.expect("200 ").await;
    client.send("GROUP nav").await;
    client.expect("211 ").await;

    client.send("XFEATURE COMPRESS GZIP TERMINATOR").await;
    client.expect("290 ").await;

    client.send("XOVER 1-2").await;
    client.expect("224 ").await;

    // the payload including its terminator arrives as one zlib block
    let mut collected = Vec::new();
    let mut plain = String::new();
    loop {
        let mut buf = [0u8; 4096];
        let n = client.reader.read(&mut buf).await.unwrap();
        assert!(n > 0, "stream closed before the compressed block completed");
        collected.extend_from_slice(&buf[..n]);
        let mut decoder = ZlibDecoder::new(&collected[..]);
        plain.clear();
        if decoder.read_to_string(&mut plain).is_ok() && plain.ends_with(".\r\n") {
            break;
        }
    }
    assert!(plain.contains("1\tfirst"));
    assert!(plain.contains("2\tsecond"));
}

// Store outage

#[tokio::test]
async fn test_store_offline_keeps_connection() {
    let store = Arc::new(MemoryStore::new());
    store.add_catalog("g", false, false, None);
    let mut client = spawn_nntp(store.clone());
    client.expect("200 ").await;

    store.set_available(false);
    client.send("GROUP g").await;
    client.expect("403 Archive server temporarily offline").await;

    store.set_available(true);
    client.send("GROUP g").await;
    client.expect("211 ").await;
}

// STARTTLS (spec scenario: mid-session upgrade)

#[tokio::test]
async fn test_starttls_refused_when_not_allowed() {
    let mut client = spawn_nntp(Arc::new(MemoryStore::new()));
    client.expect("200 ").await;
    client.send("STARTTLS").await;
    client.expect("580 ").await;
}

#[tokio::test]
async fn test_starttls_upgrade() {
    use newsgate::{Framed, NntpSession, TlsSettings, load_tls_acceptor};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio_rustls::TlsConnector;
    use tokio_rustls::rustls::pki_types::ServerName;
    use tokio_rustls::rustls::{ClientConfig, RootCertStore};

    // self-signed identity written to disk, loaded the way the server does
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let dir = std::env::temp_dir();
    let cert_path = dir.join(format!("newsgate-test-{}-cert.pem", std::process::id()));
    let key_path = dir.join(format!("newsgate-test-{}-key.pem", std::process::id()));
    std::fs::write(&cert_path, certified.cert.pem()).unwrap();
    std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();
    let acceptor = load_tls_acceptor(&TlsSettings {
        certificate_chain: cert_path.clone(),
        private_key: key_path.clone(),
    })
    .unwrap();

    let mut config = test_config();
    config.allow_starttls = true;
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let (server_io, client_io) = tokio::io::duplex(64 * 1024);
    let session = NntpSession::new(Framed::from_io(server_io), Arc::new(config), store)
        .with_acceptor(acceptor);
    let server_task = tokio::spawn(async move {
        let _ = session.run().await;
    });

    let mut reader = BufReader::new(client_io);
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    assert!(line.starts_with("200 "));

    reader.write_all(b"STARTTLS\r\n").await.unwrap();
    line.clear();
    reader.read_line(&mut line).await.unwrap();
    assert!(line.starts_with("382 "), "got {line:?}");

    // client-side handshake trusting the self-signed certificate
    let mut roots = RootCertStore::empty();
    roots.add(certified.cert.der().clone()).unwrap();
    let client_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(client_config));
    let tls = connector
        .connect(
            ServerName::try_from("localhost").unwrap(),
            reader.into_inner(),
        )
        .await
        .unwrap();

    // further commands run over the encrypted stream
    let mut reader = BufReader::new(tls);
    reader.write_all(b"DATE\r\n").await.unwrap();
    line.clear();
    reader.read_line(&mut line).await.unwrap();
    assert!(line.starts_with("111 "), "got {line:?}");

    reader.write_all(b"QUIT\r\n").await.unwrap();
    line.clear();
    reader.read_line(&mut line).await.unwrap();
    assert!(line.starts_with("205 "));

    server_task.await.unwrap();
    std::fs::remove_file(cert_path).ok();
    std::fs::remove_file(key_path).ok();
}
