//! paymta - mail server entry point

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use paymta_common::config::{Config, LoggingConfig};
use paymta_core::delivery::{DnsMxResolver, SmtpDeliveryEngine};
use paymta_core::dkim::{dns_records, DkimSigningConfig, FileSignerSource, SignerSource};
use paymta_core::smtp::{create_tls_acceptor, ListenerSet, SessionContext, SmtpAuthenticator};
use paymta_core::{Policy, Router};
use paymta_storage::{
    CredentialStore, DatabasePool, DbCredentialStore, DbQuarantineStore, FileMailboxStore,
    LoggingCredentialStore, LoggingMailboxStore, MemoryCredentialStore, MemoryQuarantineStore,
    QuarantineStore,
};
use rand::RngCore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Pay-to-deliver mail transfer agent
#[derive(Parser, Debug)]
#[command(name = "paymta", version, about)]
struct Cli {
    /// Configuration file (default: ./paymta.toml, then /etc/paymta/paymta.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the SMTP listeners (default)
    Serve,
    /// Print the DKIM, DMARC and SPF records to publish
    DnsRecords,
    /// Create an application key for a mailbox and print it once
    AddCredential {
        /// Mailbox address
        email: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    init_logging(&config.logging);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(Arc::new(config)).await,
        Command::DnsRecords => print_dns_records(&config).await,
        Command::AddCredential { email } => add_credential(&config, &email).await,
    }
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},paymta=debug", config.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}

struct Backends {
    credentials: Arc<dyn CredentialStore>,
    quarantine: Arc<dyn QuarantineStore>,
}

async fn backends(config: &Config) -> Result<Backends> {
    match config.database.backend.as_str() {
        "memory" => {
            info!(
                accounts = config.database.accounts.len(),
                "Using in-memory credential and quarantine stores"
            );
            let credentials = MemoryCredentialStore::new();
            credentials.seed(&config.database.accounts).await?;
            Ok(Backends {
                credentials: Arc::new(LoggingCredentialStore::new(credentials)),
                quarantine: Arc::new(MemoryQuarantineStore::new()),
            })
        }
        "postgres" => {
            let pool = DatabasePool::new(&config.database).await?;
            info!("Database connection established");
            pool.migrate().await?;
            info!("Database migrations completed");
            Ok(Backends {
                credentials: Arc::new(LoggingCredentialStore::new(DbCredentialStore::new(
                    pool.clone(),
                ))),
                quarantine: Arc::new(DbQuarantineStore::new(pool)),
            })
        }
        other => bail!("Unknown database backend {:?}", other),
    }
}

fn signer_source(config: &Config) -> Result<FileSignerSource> {
    let key_path = config
        .dkim
        .key_path
        .clone()
        .context("dkim.key_path must be set")?;
    Ok(FileSignerSource::new(
        key_path,
        DkimSigningConfig::new(config.dkim_domain(), &config.dkim.selector),
    ))
}

async fn serve(config: Arc<Config>) -> Result<()> {
    info!(hostname = %config.server.hostname, domain = %config.server.domain, "Starting paymta");

    let Backends {
        credentials,
        quarantine,
    } = backends(&config).await?;
    let mailboxes = Arc::new(LoggingMailboxStore::new(FileMailboxStore::new(
        &config.storage.path,
    )?));
    let signer = Arc::new(signer_source(&config)?);
    let relay = Arc::new(SmtpDeliveryEngine::from_config(
        Arc::new(DnsMxResolver::new()),
        &config,
    ));

    let router = Router::new(
        config.clone(),
        credentials.clone(),
        mailboxes,
        quarantine,
        relay,
        signer,
    );
    let ctx = Arc::new(SessionContext {
        config: config.clone(),
        policy: Policy::from_config(&config.smtp)?,
        router: Arc::new(router),
        authenticator: SmtpAuthenticator::new(credentials),
    });

    let tls_acceptor = config.tls.as_ref().map(create_tls_acceptor).transpose()?;
    let listeners = ListenerSet::bind(ctx, &config.smtp.listeners, tls_acceptor).await?;
    for (addr, mode) in listeners.local_addrs() {
        info!(%addr, %mode, "Listening");
    }
    let running = listeners.start();

    info!("paymta started");
    shutdown_signal().await?;
    info!("Shutdown signal received, no longer accepting connections");

    running.shutdown().await;
    info!("paymta shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

async fn print_dns_records(config: &Config) -> Result<()> {
    let signer = signer_source(config)?.signer().await?;
    let records = dns_records(config.dkim_domain(), &config.dkim.selector, signer.key())?;
    for record in records {
        println!("{}", record);
    }
    Ok(())
}

async fn add_credential(config: &Config, email: &str) -> Result<()> {
    if config.database.backend == "memory" {
        bail!("add-credential needs a persistent database backend; list memory accounts under database.accounts");
    }
    let Backends { credentials, .. } = backends(config).await?;

    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    let key = hex::encode(key);

    credentials.add_credential(email, &key).await?;
    println!("{}", key);
    Ok(())
}
