//! Listener set: one accept loop per configured address

use super::handler::{SessionContext, SmtpHandler};
use anyhow::{anyhow, Context, Result};
use paymta_common::config::{ListenerConfig, ListenerMode};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

struct BoundListener {
    listener: TcpListener,
    mode: ListenerMode,
    addr: SocketAddr,
}

/// Every SMTP listener of the process, bound but not yet accepting
pub struct ListenerSet {
    ctx: Arc<SessionContext>,
    tls_acceptor: Option<TlsAcceptor>,
    listeners: Vec<BoundListener>,
}

impl ListenerSet {
    /// Bind every configured address. TLS modes need `tls_acceptor`.
    pub async fn bind(
        ctx: Arc<SessionContext>,
        configs: &[ListenerConfig],
        tls_acceptor: Option<TlsAcceptor>,
    ) -> Result<Self> {
        let mut listeners = Vec::with_capacity(configs.len());
        for config in configs {
            if config.mode.needs_tls() && tls_acceptor.is_none() {
                return Err(anyhow!(
                    "Listener {} ({}) needs a TLS certificate",
                    config.address,
                    config.mode
                ));
            }
            let listener = TcpListener::bind(&config.address)
                .await
                .with_context(|| format!("Failed to bind {}", config.address))?;
            let addr = listener.local_addr()?;
            listeners.push(BoundListener {
                listener,
                mode: config.mode,
                addr,
            });
        }

        Ok(Self {
            ctx,
            tls_acceptor,
            listeners,
        })
    }

    /// Bound addresses with their modes, in configuration order
    pub fn local_addrs(&self) -> Vec<(SocketAddr, ListenerMode)> {
        self.listeners.iter().map(|l| (l.addr, l.mode)).collect()
    }

    /// Start accepting on every listener
    pub fn start(self) -> RunningListeners {
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let max_connections = self.ctx.config.smtp.max_connections;

        let accept_loops = self
            .listeners
            .into_iter()
            .map(|bound| {
                let acceptor = Acceptor {
                    ctx: self.ctx.clone(),
                    tls_acceptor: self.tls_acceptor.clone(),
                    limit: Arc::new(Semaphore::new(max_connections)),
                    shutdown: shutdown.clone(),
                    tracker: tracker.clone(),
                };
                tokio::spawn(acceptor.run(bound))
            })
            .collect();

        RunningListeners {
            shutdown,
            tracker,
            accept_loops,
        }
    }
}

/// Handle to the accepting listeners
pub struct RunningListeners {
    shutdown: CancellationToken,
    tracker: TaskTracker,
    accept_loops: Vec<JoinHandle<()>>,
}

impl RunningListeners {
    /// Sessions currently being served
    pub fn active_sessions(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting on every listener, then wait for the sessions
    /// already running to finish on their own
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for accept_loop in self.accept_loops {
            if let Err(e) = accept_loop.await {
                error!("Accept loop panicked: {}", e);
            }
        }
        info!(sessions = self.tracker.len(), "Listeners closed, draining sessions");

        self.tracker.close();
        self.tracker.wait().await;
        info!("All sessions finished");
    }
}

struct Acceptor {
    ctx: Arc<SessionContext>,
    tls_acceptor: Option<TlsAcceptor>,
    limit: Arc<Semaphore>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Acceptor {
    async fn run(self, bound: BoundListener) {
        let BoundListener {
            listener,
            mode,
            addr,
        } = bound;
        info!(%addr, %mode, "SMTP listener started");

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(%addr, "Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };

            let Ok(permit) = self.limit.clone().try_acquire_owned() else {
                warn!(%addr, peer = %peer_addr, "Max connections reached");
                self.tracker.spawn(refuse(
                    stream,
                    "421 4.3.2 Too many connections, try again later\r\n",
                ));
                continue;
            };

            let ctx = self.ctx.clone();
            let tls_acceptor = self.tls_acceptor.clone();
            self.tracker.spawn(async move {
                if let Err(e) = serve_connection(ctx, stream, peer_addr, mode, tls_acceptor).await {
                    debug!(peer = %peer_addr, "Session ended with error: {:#}", e);
                }
                drop(permit);
            });
        }

        info!(%addr, "SMTP listener stopped");
    }
}

async fn refuse(mut stream: TcpStream, reply: &'static str) {
    let _ = stream.write_all(reply.as_bytes()).await;
    let _ = stream.shutdown().await;
}

async fn serve_connection(
    ctx: Arc<SessionContext>,
    stream: TcpStream,
    peer_addr: SocketAddr,
    mode: ListenerMode,
    tls_acceptor: Option<TlsAcceptor>,
) -> Result<()> {
    if let Err(rejection) = ctx.policy.check_connection(peer_addr.ip()) {
        warn!(peer = %peer_addr, "Connection not allowed");
        let mut stream = stream;
        stream
            .write_all(format!("{}\r\n", rejection).as_bytes())
            .await?;
        return Ok(());
    }

    debug!(peer = %peer_addr, %mode, "Connection accepted");
    let handler = SmtpHandler::new(ctx.clone(), peer_addr);

    match (mode, tls_acceptor) {
        (ListenerMode::Plain, _) => handler.handle(stream).await,
        (ListenerMode::StartTls, Some(acceptor)) => {
            handler.with_starttls(acceptor).handle(stream).await
        }
        (ListenerMode::Tls, Some(acceptor)) => {
            let handshake = ctx.config.smtp.read_timeout();
            let tls = tokio::time::timeout(handshake, acceptor.accept(stream))
                .await
                .map_err(|_| anyhow!("TLS handshake timed out after {:?}", handshake))??;
            handler.with_tls().handle(tls).await
        }
        (mode, None) => Err(anyhow!("{} listener without TLS acceptor", mode)),
    }
}
