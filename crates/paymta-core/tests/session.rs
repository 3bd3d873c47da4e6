mod support;

use paymta_common::Config;
use paymta_core::dkim::{DkimSigner, DkimSigningConfig, SigningKey, StaticSignerSource};
use paymta_core::{ListenerSet, Policy, Router, SessionContext, SmtpAuthenticator};
use paymta_storage::{
    CredentialStore, FileMailboxStore, MailboxInfo, MemoryCredentialStore, MemoryQuarantineStore,
};
use std::net::SocketAddr;
use std::sync::Arc;
use support::RecordingRelay;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

struct Server {
    _dir: TempDir,
    addr: SocketAddr,
    running: paymta_core::RunningListeners,
    relay: Arc<RecordingRelay>,
    mailboxes: Arc<FileMailboxStore>,
    quarantine: Arc<MemoryQuarantineStore>,
}

async fn start(extra: &str) -> Server {
    launch("plain", extra, None).await
}

/// TLS configuration whose handshake never completes; enough for a client
/// that never sends a ClientHello
#[derive(Debug)]
struct NoCertificate;

impl rustls::server::ResolvesServerCert for NoCertificate {
    fn resolve(
        &self,
        _client_hello: rustls::server::ClientHello,
    ) -> Option<Arc<rustls::sign::CertifiedKey>> {
        None
    }
}

fn certless_acceptor() -> TlsAcceptor {
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(NoCertificate));
    TlsAcceptor::from(Arc::new(config))
}

async fn launch(mode: &str, extra: &str, tls_acceptor: Option<TlsAcceptor>) -> Server {
    let config = Arc::new(
        Config::from_toml(&format!(
            r#"
[server]
hostname = "mx.example.com"
domain = "example.com"

[database]
backend = "memory"

[smtp]
listeners = [{{ address = "127.0.0.1:0", mode = "{mode}" }}]
max_recipients = 3
max_message_size = 2048
{extra}

[tls]
cert_path = "/nonexistent/cert.pem"
key_path = "/nonexistent/key.pem"
"#
        ))
        .unwrap(),
    );

    let dir = TempDir::new().unwrap();
    let credentials = Arc::new(MemoryCredentialStore::new());
    credentials
        .add_credential("alice@example.com", "hunter2")
        .await
        .unwrap();
    let mailboxes = Arc::new(FileMailboxStore::new(dir.path()).unwrap());
    let quarantine = Arc::new(MemoryQuarantineStore::new());
    let relay = Arc::new(RecordingRelay::default());
    let signer = Arc::new(StaticSignerSource::new(DkimSigner::new(
        DkimSigningConfig::new("example.com", "default"),
        SigningKey::ed25519(ed25519_dalek::SigningKey::from_bytes(&[5u8; 32])),
    )));

    let router = Router::new(
        config.clone(),
        credentials.clone(),
        mailboxes.clone(),
        quarantine.clone(),
        relay.clone(),
        signer,
    );
    let ctx = Arc::new(SessionContext {
        policy: Policy::from_config(&config.smtp).unwrap(),
        router: Arc::new(router),
        authenticator: SmtpAuthenticator::new(credentials),
        config: config.clone(),
    });

    let listeners = ListenerSet::bind(ctx, &config.smtp.listeners, tls_acceptor)
        .await
        .unwrap();
    let addr = listeners.local_addrs()[0].0;

    Server {
        _dir: dir,
        addr,
        running: listeners.start(),
        relay,
        mailboxes,
        quarantine,
    }
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let (reader, writer) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut client = Self {
            reader: BufReader::new(reader),
            writer,
        };
        let greeting = client.reply().await;
        assert!(greeting.starts_with("220 mx.example.com"), "{greeting}");
        client
    }

    /// Full reply, continuation lines included
    async fn reply(&mut self) -> String {
        let mut reply = String::new();
        loop {
            let mut line = String::new();
            self.reader.read_line(&mut line).await.unwrap();
            reply.push_str(&line);
            if line.len() < 4 || line.as_bytes()[3] != b'-' {
                return reply;
            }
        }
    }

    async fn send(&mut self, line: &str) -> String {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
        self.reply().await
    }
}

#[tokio::test]
async fn test_inbound_message_is_quarantined() {
    let server = start("").await;
    let mut client = Client::connect(server.addr).await;

    let ehlo = client.send("EHLO client.remote.org").await;
    assert!(ehlo.contains("250-SIZE 2048"));
    assert!(!ehlo.contains("AUTH"));
    assert!(!ehlo.contains("STARTTLS"));

    assert!(client.send("MAIL FROM:<sender@remote.org>").await.starts_with("250"));
    assert!(client.send("RCPT TO:<alice@example.com>").await.starts_with("250"));
    assert!(client.send("DATA").await.starts_with("354"));
    let reply = client
        .send("Subject: Offer\r\n\r\n..dotted line\r\nbuy now\r\n.")
        .await;
    assert!(reply.starts_with("250"), "{reply}");
    assert!(client.send("QUIT").await.starts_with("221"));

    assert_eq!(server.quarantine.len().await, 1);
    let holding = MailboxInfo::new("alice@example.com", "UNPAID");
    let stored = server.mailboxes.read_message(&holding, 1).await.unwrap();
    let stored = String::from_utf8(stored).unwrap();
    assert!(stored.starts_with("Received: from client.remote.org ([127.0.0.1]) by mx.example.com with ESMTP;"));
    assert!(stored.ends_with("Subject: Offer\r\n\r\n.dotted line\r\nbuy now\r\n"));

    let bounces = server.relay.sent();
    assert_eq!(bounces.len(), 1);
    assert_eq!(bounces[0].0, "sender@remote.org");
}

#[tokio::test]
async fn test_open_relay_is_refused_at_data() {
    let server = start("").await;
    let mut client = Client::connect(server.addr).await;
    client.send("HELO client.remote.org").await;
    client.send("MAIL FROM:<sender@remote.org>").await;
    client.send("RCPT TO:<someone@elsewhere.net>").await;
    client.send("DATA").await;
    let reply = client.send("Subject: x\r\n\r\nx\r\n.").await;
    assert_eq!(reply, "451 Bad recipient address. We are no open relay.\r\n");
    assert!(server.relay.sent().is_empty());
}

#[tokio::test]
async fn test_abuse_reports_are_thanked() {
    let server = start("").await;
    let mut client = Client::connect(server.addr).await;
    client.send("EHLO client.remote.org").await;
    client.send("MAIL FROM:<sender@remote.org>").await;
    client.send("RCPT TO:<abuse@example.com>").await;
    client.send("DATA").await;
    let reply = client.send("Subject: spam report\r\n\r\nx\r\n.").await;
    assert_eq!(reply, "250 Thank you.\r\n");
}

#[tokio::test]
async fn test_session_limits() {
    let server = start("").await;
    let mut client = Client::connect(server.addr).await;

    assert!(client.send("MAIL FROM:<a@remote.org>").await.starts_with("503"));
    client.send("EHLO client.remote.org").await;
    assert!(client.send("RCPT TO:<alice@example.com>").await.starts_with("503"));
    assert!(client
        .send("MAIL FROM:<a@remote.org> SIZE=4096")
        .await
        .starts_with("552"));

    client.send("MAIL FROM:<a@remote.org>").await;
    for _ in 0..3 {
        assert!(client.send("RCPT TO:<alice@example.com>").await.starts_with("250"));
    }
    assert!(client.send("RCPT TO:<alice@example.com>").await.starts_with("452"));

    assert!(client.send("DATA").await.starts_with("354"));
    let body = "x".repeat(3000);
    let reply = client.send(&format!("Subject: big\r\n\r\n{body}\r\n.")).await;
    assert!(reply.starts_with("552"), "{reply}");
    assert_eq!(server.quarantine.len().await, 0);

    // One unterminated line far past the limit
    client.send("RSET").await;
    client.send("MAIL FROM:<a@remote.org>").await;
    client.send("RCPT TO:<alice@example.com>").await;
    assert!(client.send("DATA").await.starts_with("354"));
    let line = "y".repeat(50_000);
    let reply = client.send(&format!("Subject: long\r\n\r\n{line}\r\n.")).await;
    assert!(reply.starts_with("552"), "{reply}");
    assert_eq!(server.quarantine.len().await, 0);

    assert!(client.send("VRFY alice").await.starts_with("252"));
    assert!(client.send("BOGUS").await.starts_with("500"));
}

#[tokio::test]
async fn test_auth_refused_without_tls() {
    let server = start("").await;
    let mut client = Client::connect(server.addr).await;
    client.send("EHLO client.remote.org").await;
    let reply = client.send("AUTH PLAIN AGFsaWNlQGV4YW1wbGUuY29tAGh1bnRlcjI=").await;
    assert!(reply.starts_with("538"), "{reply}");
}

#[tokio::test]
async fn test_authenticated_relay() {
    let server = start("require_tls_for_auth = false").await;
    let mut client = Client::connect(server.addr).await;

    let ehlo = client.send("EHLO laptop").await;
    assert!(ehlo.contains("AUTH PLAIN LOGIN"));
    let bad = client.send("AUTH PLAIN AGFsaWNlQGV4YW1wbGUuY29tAHdyb25n").await;
    assert!(bad.starts_with("535"), "{bad}");

    assert!(client.send("AUTH LOGIN").await.starts_with("334 VXNlcm5hbWU6"));
    assert!(client.send("YWxpY2U=").await.starts_with("334 UGFzc3dvcmQ6"));
    let ok = client.send("aHVudGVyMg==").await;
    assert!(ok.starts_with("235"), "{ok}");

    client.send("MAIL FROM:<alice@example.com>").await;
    client.send("RCPT TO:<bob@remote.org>").await;
    client.send("DATA").await;
    let reply = client.send("Subject: hi\r\n\r\nhello bob\r\n.").await;
    assert!(reply.starts_with("250"), "{reply}");

    let sent = server.relay.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "bob@remote.org");
    let data = String::from_utf8_lossy(&sent[0].1.data).to_string();
    assert!(data.starts_with("DKIM-Signature: v=1; a=ed25519-sha256;"));
    assert!(data.contains("by mx.example.com with ESMTPA;"));

    let archive = MailboxInfo::new("alice@example.com", "Sent");
    assert_eq!(server.mailboxes.message_count(&archive).await.unwrap(), 1);
}

#[tokio::test]
async fn test_shutdown_drains_open_sessions() {
    let server = start("").await;
    let mut client = Client::connect(server.addr).await;
    client.send("EHLO client.remote.org").await;
    assert_eq!(server.running.active_sessions(), 1);

    let addr = server.addr;
    let drain = tokio::spawn(server.running.shutdown());

    // The open session keeps working while the listener is gone
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(TcpStream::connect(addr).await.is_err());
    assert!(!drain.is_finished());
    assert!(client.send("NOOP").await.starts_with("250"));

    assert!(client.send("QUIT").await.starts_with("221"));
    tokio::time::timeout(std::time::Duration::from_secs(5), drain)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_helo_with_control_characters_is_refused() {
    let server = start("").await;
    let mut client = Client::connect(server.addr).await;

    let reply = client.send("EHLO evil\rReceived: forged").await;
    assert!(reply.starts_with("501"), "{reply}");
    assert!(client.send("MAIL FROM:<a@remote.org>").await.starts_with("503"));
    assert!(client.send("EHLO client.remote.org").await.starts_with("250"));
}

#[tokio::test]
async fn test_silent_tls_client_is_dropped() {
    let server = launch("tls", "read_timeout_secs = 1", Some(certless_acceptor())).await;

    // Connects but never starts the handshake
    let mut silent = TcpStream::connect(server.addr).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(server.running.active_sessions(), 1);

    tokio::time::timeout(std::time::Duration::from_secs(5), server.running.shutdown())
        .await
        .unwrap();

    let mut buf = [0u8; 16];
    let read = tokio::io::AsyncReadExt::read(&mut silent, &mut buf).await;
    assert!(matches!(read, Ok(0) | Err(_)));
}
