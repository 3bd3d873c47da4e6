//! SMTP session handler

use super::auth::{login_challenge_password, login_challenge_username, AuthResult, SmtpAuthenticator};
use crate::filters::Policy;
use crate::routing::Router;
use anyhow::{anyhow, Result};
use paymta_common::config::Config;
use paymta_common::types::{Envelope, Peer};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream,
};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

const MAX_COMMAND_LINE: usize = 4096;

/// Shared by every session of every listener
pub struct SessionContext {
    pub config: Arc<Config>,
    pub policy: Policy,
    pub router: Arc<Router>,
    pub authenticator: SmtpAuthenticator,
}

/// SMTP session state
#[derive(Debug, Clone, Copy, PartialEq)]
enum SessionState {
    Connected,
    Greeted,
    MailFrom,
    RcptTo,
}

/// How a command loop ended
enum Next {
    Close,
    StartTls,
}

/// One SMTP session, from greeting to QUIT
pub struct SmtpHandler {
    ctx: Arc<SessionContext>,
    peer: Peer,
    state: SessionState,
    sender: String,
    recipients: Vec<String>,
    starttls: Option<TlsAcceptor>,
}

impl SmtpHandler {
    pub fn new(ctx: Arc<SessionContext>, peer_addr: SocketAddr) -> Self {
        Self {
            ctx,
            peer: Peer::new(peer_addr),
            state: SessionState::Connected,
            sender: String::new(),
            recipients: Vec::new(),
            starttls: None,
        }
    }

    /// Offer STARTTLS using `acceptor`
    pub fn with_starttls(mut self, acceptor: TlsAcceptor) -> Self {
        self.starttls = Some(acceptor);
        self
    }

    /// Mark the session as running over TLS from the first byte
    pub fn with_tls(mut self) -> Self {
        self.peer.tls = true;
        self
    }

    /// Handle the session on `stream`, upgrading it once on STARTTLS
    pub async fn handle<S>(mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut io = BufStream::new(stream);
        let greeting = format!(
            "{} {}",
            self.ctx.config.server.hostname, self.ctx.config.smtp.welcome_message
        );
        self.send_response(&mut io, 220, &greeting).await?;

        match self.serve(&mut io).await? {
            Next::Close => Ok(()),
            Next::StartTls => {
                let acceptor = self
                    .starttls
                    .clone()
                    .ok_or_else(|| anyhow!("STARTTLS without an acceptor"))?;
                // Anything the client pipelined after STARTTLS is dropped here
                let handshake = self.ctx.config.smtp.read_timeout();
                let tls = tokio::time::timeout(handshake, acceptor.accept(io.into_inner()))
                    .await
                    .map_err(|_| anyhow!("TLS handshake timed out after {:?}", handshake))??;
                debug!(peer = %self.peer.addr, "TLS established");

                self.peer.tls = true;
                self.peer.helo.clear();
                self.peer.extended = false;
                self.peer.username = None;
                self.state = SessionState::Connected;
                self.reset_transaction();

                let mut io = BufStream::new(tls);
                self.serve(&mut io).await?;
                Ok(())
            }
        }
    }

    async fn serve<T>(&mut self, io: &mut T) -> Result<Next>
    where
        T: AsyncBufRead + AsyncWrite + Unpin,
    {
        loop {
            let line = match self.read_command(io).await? {
                Some(line) => line,
                None => {
                    debug!(peer = %self.peer.addr, "Client disconnected");
                    return Ok(Next::Close);
                }
            };

            let (command, args) = parse_command(&line);
            debug!(peer = %self.peer.addr, command, "SMTP command");

            match command.to_ascii_uppercase().as_str() {
                "HELO" | "EHLO" => {
                    if args.is_empty() {
                        self.send_response(io, 501, "5.5.4 Syntax: HELO hostname").await?;
                        continue;
                    }
                    if args.chars().any(char::is_control) {
                        self.send_response(io, 501, "5.5.4 Invalid HELO hostname").await?;
                        continue;
                    }
                    self.peer.helo = args.to_string();
                    self.peer.extended = command.eq_ignore_ascii_case("EHLO");
                    self.reset_transaction();
                    self.state = SessionState::Greeted;

                    let lines = if self.peer.extended {
                        self.ehlo_lines(args)
                    } else {
                        vec![format!("{} Hello {}", self.ctx.config.server.hostname, args)]
                    };
                    self.send_multiline(io, 250, &lines).await?;
                }

                "STARTTLS" => {
                    if self.peer.tls {
                        self.send_response(io, 503, "5.5.1 TLS already active").await?;
                    } else if self.starttls.is_none() {
                        self.send_response(io, 502, "5.5.1 STARTTLS not supported").await?;
                    } else if !args.is_empty() {
                        self.send_response(io, 501, "5.5.4 Syntax error").await?;
                    } else {
                        self.send_response(io, 220, "2.0.0 Ready to start TLS").await?;
                        return Ok(Next::StartTls);
                    }
                }

                "AUTH" => self.auth(io, args).await?,

                "MAIL" => {
                    if self.state != SessionState::Greeted {
                        self.send_response(io, 503, "5.5.1 Bad sequence of commands").await?;
                        continue;
                    }
                    if self.ctx.config.smtp.force_tls && !self.peer.tls {
                        self.send_response(io, 530, "5.7.0 Must issue a STARTTLS command first")
                            .await?;
                        continue;
                    }

                    let Some((sender, size)) = parse_mail_from(args) else {
                        self.send_response(io, 501, "5.1.7 Bad sender address syntax").await?;
                        continue;
                    };
                    if size.is_some_and(|s| s > self.ctx.config.smtp.max_message_size) {
                        self.send_response(io, 552, "5.3.4 Message size exceeds fixed maximum message size")
                            .await?;
                        continue;
                    }
                    if !sender.is_empty() {
                        if let Err(rejection) = self.ctx.policy.check_sender(&sender) {
                            warn!(peer = %self.peer.addr, sender = %sender, "Sender not allowed");
                            self.send_response(io, rejection.code, &rejection.message).await?;
                            continue;
                        }
                    }

                    self.sender = sender;
                    self.state = SessionState::MailFrom;
                    self.send_response(io, 250, "2.1.0 OK").await?;
                }

                "RCPT" => {
                    if self.state != SessionState::MailFrom && self.state != SessionState::RcptTo {
                        self.send_response(io, 503, "5.5.1 Bad sequence of commands").await?;
                        continue;
                    }
                    if self.recipients.len() >= self.ctx.config.smtp.max_recipients {
                        self.send_response(io, 452, "4.5.3 Too many recipients").await?;
                        continue;
                    }

                    let Some(recipient) = parse_rcpt_to(args) else {
                        self.send_response(io, 501, "5.1.3 Bad recipient address syntax").await?;
                        continue;
                    };
                    if let Err(rejection) = self.ctx.policy.check_recipient(&recipient) {
                        warn!(peer = %self.peer.addr, recipient = %recipient, "Recipient not allowed");
                        self.send_response(io, rejection.code, &rejection.message).await?;
                        continue;
                    }

                    self.recipients.push(recipient);
                    self.state = SessionState::RcptTo;
                    self.send_response(io, 250, "2.1.5 OK").await?;
                }

                "DATA" => {
                    if self.state != SessionState::RcptTo {
                        self.send_response(io, 503, "5.5.1 Bad sequence of commands").await?;
                        continue;
                    }
                    self.send_response(io, 354, "Start mail input; end with <CRLF>.<CRLF>")
                        .await?;

                    let timeout = self.ctx.config.smtp.data_timeout();
                    let data = match tokio::time::timeout(timeout, self.read_data(io)).await {
                        Ok(Ok(data)) => data,
                        Ok(Err(DataError::TooLarge)) => {
                            self.reset_transaction();
                            self.send_response(io, 552, "5.3.4 Message size exceeds fixed maximum message size")
                                .await?;
                            continue;
                        }
                        Ok(Err(DataError::Io(e))) => return Err(e),
                        Err(_) => {
                            self.send_response(io, 421, "4.4.2 Timeout while receiving data")
                                .await?;
                            return Ok(Next::Close);
                        }
                    };

                    let envelope = Envelope::new(
                        std::mem::take(&mut self.sender),
                        std::mem::take(&mut self.recipients),
                        data,
                    );
                    let size = envelope.data.len();
                    match self.ctx.router.handle(&self.peer, envelope).await {
                        Ok(reply) => {
                            info!(peer = %self.peer.addr, size, "Message accepted");
                            self.send_response(io, reply.code, &reply.message).await?;
                        }
                        Err(rejection) => {
                            self.send_response(io, rejection.code, &rejection.message).await?;
                        }
                    }
                    self.reset_transaction();
                }

                "RSET" => {
                    self.reset_transaction();
                    self.send_response(io, 250, "2.0.0 OK").await?;
                }

                "NOOP" => {
                    self.send_response(io, 250, "2.0.0 OK").await?;
                }

                "QUIT" => {
                    self.send_response(io, 221, "2.0.0 Bye").await?;
                    return Ok(Next::Close);
                }

                "VRFY" => {
                    self.send_response(io, 252, "2.5.2 Cannot VRFY user").await?;
                }

                "EXPN" => {
                    self.send_response(io, 502, "5.5.1 EXPN not supported").await?;
                }

                _ => {
                    self.send_response(io, 500, "5.5.2 Command not recognized").await?;
                }
            }
        }
    }

    fn ehlo_lines(&self, helo: &str) -> Vec<String> {
        let smtp = &self.ctx.config.smtp;
        let mut lines = vec![
            format!("{} Hello {}", self.ctx.config.server.hostname, helo),
            format!("SIZE {}", smtp.max_message_size),
            "8BITMIME".to_string(),
            "PIPELINING".to_string(),
            "ENHANCEDSTATUSCODES".to_string(),
        ];
        if self.starttls.is_some() && !self.peer.tls {
            lines.push("STARTTLS".to_string());
        }
        if self.auth_offered() {
            lines.push("AUTH PLAIN LOGIN".to_string());
        }
        lines
    }

    fn auth_offered(&self) -> bool {
        self.peer.tls || !self.ctx.config.smtp.require_tls_for_auth
    }

    async fn auth<T>(&mut self, io: &mut T, args: &str) -> Result<()>
    where
        T: AsyncBufRead + AsyncWrite + Unpin,
    {
        if self.state != SessionState::Greeted || self.peer.authenticated_user().is_some() {
            return self.send_response(io, 503, "5.5.1 Bad sequence of commands").await;
        }
        if !self.auth_offered() {
            return self
                .send_response(io, 538, "5.7.11 Encryption required for requested authentication mechanism")
                .await;
        }

        let (mechanism, initial) = parse_command(args);
        let result = match mechanism.to_ascii_uppercase().as_str() {
            "PLAIN" => {
                let response = if initial.is_empty() {
                    self.send_response(io, 334, "").await?;
                    match self.read_auth_line(io).await? {
                        Some(response) => response,
                        None => return Ok(()),
                    }
                } else {
                    initial.to_string()
                };
                self.ctx.authenticator.authenticate_plain(&response).await
            }
            "LOGIN" => {
                let username = if initial.is_empty() {
                    self.send_response(io, 334, &login_challenge_username()).await?;
                    match self.read_auth_line(io).await? {
                        Some(username) => username,
                        None => return Ok(()),
                    }
                } else {
                    initial.to_string()
                };
                self.send_response(io, 334, &login_challenge_password()).await?;
                let Some(password) = self.read_auth_line(io).await? else {
                    return Ok(());
                };
                self.ctx
                    .authenticator
                    .authenticate_login(&username, &password)
                    .await
            }
            _ => {
                return self
                    .send_response(io, 504, "5.5.4 Unrecognized authentication mechanism")
                    .await;
            }
        };

        match &result {
            AuthResult::Success(user) => {
                info!(peer = %self.peer.addr, user = %user, "Authenticated");
                self.peer.username = Some(user.clone());
            }
            AuthResult::Failure(reason) => {
                warn!(peer = %self.peer.addr, reason, "Authentication failed");
            }
            AuthResult::Unavailable => {}
        }
        let (code, message) = result.reply();
        self.send_response(io, code, message).await
    }

    /// One SASL continuation line; `None` after the client cancelled with `*`
    async fn read_auth_line<T>(&mut self, io: &mut T) -> Result<Option<String>>
    where
        T: AsyncBufRead + AsyncWrite + Unpin,
    {
        let line = self
            .read_command(io)
            .await?
            .ok_or_else(|| anyhow!("Connection closed during AUTH"))?;
        if line == "*" {
            self.send_response(io, 501, "5.0.0 Authentication cancelled").await?;
            return Ok(None);
        }
        Ok(Some(line))
    }

    /// Read one command line, `None` at end of stream
    async fn read_command<T>(&self, io: &mut T) -> Result<Option<String>>
    where
        T: AsyncBufRead + AsyncWrite + Unpin,
    {
        let mut buf = Vec::new();
        let timeout = self.ctx.config.smtp.read_timeout();
        let read = tokio::time::timeout(
            timeout,
            (&mut *io).take(MAX_COMMAND_LINE as u64).read_until(b'\n', &mut buf),
        )
        .await;

        match read {
            Err(_) => {
                self.send_response(io, 421, "4.4.2 Idle timeout, closing connection")
                    .await?;
                Err(anyhow!("Read timeout after {:?}", timeout))
            }
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(0)) => Ok(None),
            Ok(Ok(_)) if !buf.ends_with(b"\n") => {
                self.send_response(io, 500, "5.5.2 Line too long").await?;
                Err(anyhow!("Command line too long"))
            }
            Ok(Ok(_)) => Ok(Some(String::from_utf8_lossy(&buf).trim().to_string())),
        }
    }

    /// Read message data until `<CRLF>.<CRLF>`, undoing dot-stuffing
    async fn read_data<T>(&self, io: &mut T) -> std::result::Result<Vec<u8>, DataError>
    where
        T: AsyncBufRead + Unpin,
    {
        let max_size = self.ctx.config.smtp.max_message_size;
        // Room for one byte past the limit plus the line ending
        let chunk_limit = (max_size + 3) as u64;
        let mut data = Vec::new();
        let mut line = Vec::new();
        let mut too_large = false;
        let mut at_line_start = true;

        loop {
            line.clear();
            let read = (&mut *io)
                .take(chunk_limit)
                .read_until(b'\n', &mut line)
                .await?;
            if read == 0 {
                return Err(DataError::Io(anyhow!("Connection closed during DATA")));
            }

            let starts_line = at_line_start;
            at_line_start = line.ends_with(b"\n");
            if starts_line && (line == b".\r\n" || line == b".\n") {
                break;
            }
            if too_large {
                continue;
            }

            let content = if starts_line {
                line.strip_prefix(b".").unwrap_or(&line[..])
            } else {
                &line[..]
            };
            data.extend_from_slice(content);

            if data.len() > max_size {
                too_large = true;
                data = Vec::new();
            }
        }

        if too_large {
            return Err(DataError::TooLarge);
        }
        Ok(data)
    }

    fn reset_transaction(&mut self) {
        self.sender.clear();
        self.recipients.clear();
        if self.state != SessionState::Connected {
            self.state = SessionState::Greeted;
        }
    }

    /// Send an SMTP response
    async fn send_response<W>(&self, writer: &mut W, code: u16, message: &str) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let response = if message.is_empty() {
            format!("{}\r\n", code)
        } else {
            format!("{} {}\r\n", code, message)
        };
        self.write(writer, response.as_bytes()).await?;
        debug!(peer = %self.peer.addr, "SMTP reply: {}", response.trim_end());
        Ok(())
    }

    /// Send a multi-line response; every line but the last uses `code-`
    async fn send_multiline<W>(&self, writer: &mut W, code: u16, lines: &[String]) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut response = String::new();
        for (i, line) in lines.iter().enumerate() {
            let sep = if i + 1 == lines.len() { ' ' } else { '-' };
            response.push_str(&format!("{}{}{}\r\n", code, sep, line));
        }
        self.write(writer, response.as_bytes()).await
    }

    async fn write<W>(&self, writer: &mut W, bytes: &[u8]) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let timeout = self.ctx.config.smtp.write_timeout();
        tokio::time::timeout(timeout, async {
            writer.write_all(bytes).await?;
            writer.flush().await
        })
        .await
        .map_err(|_| anyhow!("Write timeout after {:?}", timeout))??;
        Ok(())
    }
}

enum DataError {
    TooLarge,
    Io(anyhow::Error),
}

impl From<std::io::Error> for DataError {
    fn from(e: std::io::Error) -> Self {
        DataError::Io(e.into())
    }
}

/// Split a command line into verb and arguments
fn parse_command(line: &str) -> (&str, &str) {
    match line.split_once(' ') {
        Some((command, args)) => (command, args.trim()),
        None => (line, ""),
    }
}

/// Path in `<...>`, or the first word when the brackets are missing
fn parse_path(addr_part: &str) -> Option<(&str, &str)> {
    let addr_part = addr_part.trim_start();
    if let Some(rest) = addr_part.strip_prefix('<') {
        let end = rest.find('>')?;
        Some((&rest[..end], &rest[end + 1..]))
    } else {
        let mut parts = addr_part.splitn(2, ' ');
        let path = parts.next().filter(|p| !p.is_empty())?;
        Some((path, parts.next().unwrap_or("")))
    }
}

/// `FROM:<address> [SIZE=n]`; the null sender comes back empty
fn parse_mail_from(args: &str) -> Option<(String, Option<usize>)> {
    let rest = strip_prefix_ignore_case(args.trim(), "FROM:")?;
    let (path, params) = parse_path(rest)?;

    let mut size = None;
    for param in params.split_whitespace() {
        if let Some(value) = strip_prefix_ignore_case(param, "SIZE=") {
            size = Some(value.parse().ok()?);
        }
    }
    Some((path.trim().to_string(), size))
}

/// `TO:<address>`; an empty path is refused
fn parse_rcpt_to(args: &str) -> Option<String> {
    let rest = strip_prefix_ignore_case(args.trim(), "TO:")?;
    let (path, _) = parse_path(rest)?;
    let path = path.trim();
    (!path.is_empty()).then(|| path.to_string())
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}
