//! A scripted SMTP peer that accepts everything and records what it got

#![allow(dead_code)]

use paymta_common::types::Envelope;
use paymta_core::delivery::Relay;
use paymta_core::DeliveryError;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

#[derive(Debug, Clone, Default)]
pub struct ReceivedMail {
    pub helo: String,
    pub mail_from: String,
    pub rcpt_to: Vec<String>,
    pub data: String,
}

pub struct MockSmtpServer {
    pub addr: SocketAddr,
    pub received: Arc<Mutex<Vec<ReceivedMail>>>,
    pub starttls_attempts: Arc<AtomicUsize>,
}

impl MockSmtpServer {
    pub async fn start() -> Self {
        Self::spawn(false).await
    }

    /// Advertises STARTTLS, accepts the command, then hangs up instead of
    /// doing the handshake
    pub async fn start_with_broken_starttls() -> Self {
        Self::spawn(true).await
    }

    async fn spawn(broken_starttls: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let starttls_attempts = Arc::new(AtomicUsize::new(0));

        let sink = received.clone();
        let attempts = starttls_attempts.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let sink = sink.clone();
                let attempts = attempts.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, sink, attempts, broken_starttls).await;
                });
            }
        });

        Self {
            addr,
            received,
            starttls_attempts,
        }
    }

    pub fn starttls_attempts(&self) -> usize {
        self.starttls_attempts.load(Ordering::SeqCst)
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn received(&self) -> Vec<ReceivedMail> {
        self.received.lock().unwrap().clone()
    }
}

async fn serve(
    stream: TcpStream,
    sink: Arc<Mutex<Vec<ReceivedMail>>>,
    starttls_attempts: Arc<AtomicUsize>,
    broken_starttls: bool,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut mail = ReceivedMail::default();
    writer.write_all(b"220 mock.test ESMTP\r\n").await?;

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let upper = line.to_ascii_uppercase();
        if upper.starts_with("EHLO") || upper.starts_with("HELO") {
            mail.helo = line[5..].trim().to_string();
            let reply: &[u8] = if broken_starttls {
                b"250-mock.test\r\n250-STARTTLS\r\n250 8BITMIME\r\n"
            } else {
                b"250-mock.test\r\n250 8BITMIME\r\n"
            };
            writer.write_all(reply).await?;
        } else if broken_starttls && upper.starts_with("STARTTLS") {
            starttls_attempts.fetch_add(1, Ordering::SeqCst);
            writer.write_all(b"220 ready to start TLS\r\n").await?;
            return Ok(());
        } else if upper.starts_with("MAIL FROM:") {
            mail.mail_from = path(&line[10..]);
            writer.write_all(b"250 OK\r\n").await?;
        } else if upper.starts_with("RCPT TO:") {
            mail.rcpt_to.push(path(&line[8..]));
            writer.write_all(b"250 OK\r\n").await?;
        } else if upper.starts_with("DATA") {
            writer.write_all(b"354 go ahead\r\n").await?;
            loop {
                line.clear();
                if reader.read_line(&mut line).await? == 0 {
                    return Ok(());
                }
                if line == ".\r\n" {
                    break;
                }
                mail.data.push_str(&line);
            }
            sink.lock().unwrap().push(std::mem::take(&mut mail));
            writer.write_all(b"250 OK queued\r\n").await?;
        } else if upper.starts_with("QUIT") {
            writer.write_all(b"221 bye\r\n").await?;
            return Ok(());
        } else {
            writer.write_all(b"250 OK\r\n").await?;
        }
    }
}

fn path(arg: &str) -> String {
    let arg = arg.trim();
    let arg = arg.split_whitespace().next().unwrap_or("");
    arg.trim_start_matches('<').trim_end_matches('>').to_string()
}

/// A port on localhost that refuses connections
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// Relay that keeps every message instead of sending it
#[derive(Default)]
pub struct RecordingRelay {
    pub sent: Mutex<Vec<(String, Envelope)>>,
}

impl RecordingRelay {
    pub fn sent(&self) -> Vec<(String, Envelope)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Relay for RecordingRelay {
    async fn deliver(&self, envelope: &Envelope, recipient: &str) -> Result<(), DeliveryError> {
        self.sent
            .lock()
            .unwrap()
            .push((recipient.to_string(), envelope.clone()));
        Ok(())
    }
}
