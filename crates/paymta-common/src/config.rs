//! Configuration for paymta

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server identity
    pub server: ServerConfig,

    /// Credential and quarantine database
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Mailbox storage
    #[serde(default)]
    pub storage: StorageConfig,

    /// SMTP listeners and session limits
    #[serde(default)]
    pub smtp: SmtpConfig,

    /// Outbound delivery
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// DKIM signing
    #[serde(default)]
    pub dkim: DkimConfig,

    /// Unpaid mail handling
    #[serde(default)]
    pub quarantine: QuarantineConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// TLS configuration
    pub tls: Option<TlsConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Hostname used in the banner, EHLO and trace lines
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// The mail domain this server accepts local delivery for
    pub domain: String,
}

fn default_hostname() -> String {
    "localhost.localdomain".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database backend: "postgres" or "memory"
    #[serde(default = "default_db_backend")]
    pub backend: String,

    /// Database URL (for postgres)
    pub url: Option<String>,

    /// Maximum connections
    #[serde(default = "default_max_db_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_db_connections")]
    pub min_connections: u32,

    /// Accounts loaded into the memory backend at startup
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

/// A mailbox address and one application key for it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub email: String,
    pub key: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: default_db_backend(),
            url: None,
            max_connections: default_max_db_connections(),
            min_connections: default_min_db_connections(),
            accounts: Vec::new(),
        }
    }
}

fn default_db_backend() -> String {
    "postgres".to_string()
}

fn default_max_db_connections() -> u32 {
    20
}

fn default_min_db_connections() -> u32 {
    2
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory of the per-user mailboxes
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("/var/lib/paymta/mails")
}

/// How a listening socket speaks TLS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerMode {
    /// Cleartext only
    Plain,
    /// Cleartext, upgradeable with STARTTLS
    StartTls,
    /// TLS from the first byte
    Tls,
}

impl ListenerMode {
    pub fn needs_tls(self) -> bool {
        !matches!(self, ListenerMode::Plain)
    }
}

impl std::fmt::Display for ListenerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerMode::Plain => write!(f, "plain"),
            ListenerMode::StartTls => write!(f, "starttls"),
            ListenerMode::Tls => write!(f, "tls"),
        }
    }
}

/// One listening socket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Socket address, e.g. "0.0.0.0:25"
    pub address: String,

    /// TLS behaviour of the socket
    pub mode: ListenerMode,
}

/// SMTP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// Text after the hostname in the 220 greeting
    #[serde(default = "default_welcome_message")]
    pub welcome_message: String,

    /// Listening sockets
    #[serde(default = "default_listeners")]
    pub listeners: Vec<ListenerConfig>,

    /// Socket timeout for reading a command
    #[serde(default = "default_io_timeout")]
    pub read_timeout_secs: u64,

    /// Socket timeout for writing a reply
    #[serde(default = "default_io_timeout")]
    pub write_timeout_secs: u64,

    /// Timeout for the whole DATA phase
    #[serde(default = "default_data_timeout")]
    pub data_timeout_secs: u64,

    /// Maximum concurrent connections per listener
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum message size in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Maximum RCPT TO per envelope
    #[serde(default = "default_max_recipients")]
    pub max_recipients: usize,

    /// Refuse MAIL until STARTTLS completed
    #[serde(default)]
    pub force_tls: bool,

    /// Refuse AUTH on cleartext sessions
    #[serde(default = "default_require_tls_for_auth")]
    pub require_tls_for_auth: bool,

    /// Networks allowed to connect; empty means everyone
    #[serde(default)]
    pub allowed_nets: Vec<String>,

    /// Regular expression for valid MAIL FROM addresses
    pub allowed_sender: Option<String>,

    /// Regular expression for valid RCPT TO addresses
    pub allowed_recipients: Option<String>,

    /// Address patterns (`user@domain`, `@domain`, `local`) for MAIL FROM
    pub allowed_sender_addresses: Option<Vec<String>>,

    /// Address patterns (`user@domain`, `@domain`, `local`) for RCPT TO
    pub allowed_recipient_addresses: Option<Vec<String>>,

    /// Recipient prefix that marks an abuse report
    #[serde(default = "default_abuse_prefix")]
    pub abuse_prefix: String,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            welcome_message: default_welcome_message(),
            listeners: default_listeners(),
            read_timeout_secs: default_io_timeout(),
            write_timeout_secs: default_io_timeout(),
            data_timeout_secs: default_data_timeout(),
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
            max_recipients: default_max_recipients(),
            force_tls: false,
            require_tls_for_auth: default_require_tls_for_auth(),
            allowed_nets: Vec::new(),
            allowed_sender: None,
            allowed_recipients: None,
            allowed_sender_addresses: None,
            allowed_recipient_addresses: None,
            abuse_prefix: default_abuse_prefix(),
        }
    }
}

impl SmtpConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn data_timeout(&self) -> Duration {
        Duration::from_secs(self.data_timeout_secs)
    }
}

fn default_welcome_message() -> String {
    "ESMTP ready".to_string()
}

fn default_listeners() -> Vec<ListenerConfig> {
    vec![
        ListenerConfig {
            address: "0.0.0.0:25".to_string(),
            mode: ListenerMode::StartTls,
        },
        ListenerConfig {
            address: "0.0.0.0:587".to_string(),
            mode: ListenerMode::StartTls,
        },
        ListenerConfig {
            address: "0.0.0.0:465".to_string(),
            mode: ListenerMode::Tls,
        },
    ]
}

fn default_io_timeout() -> u64 {
    60
}

fn default_data_timeout() -> u64 {
    300
}

fn default_max_connections() -> usize {
    100
}

fn default_max_message_size() -> usize {
    10_240_000
}

fn default_max_recipients() -> usize {
    100
}

fn default_require_tls_for_auth() -> bool {
    true
}

fn default_abuse_prefix() -> String {
    "abuse@".to_string()
}

/// TLS behaviour when connecting to a remote port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// TLS handshake right after connect
    Implicit,
    /// STARTTLS when the server offers it
    Opportunistic,
    /// No TLS
    Plaintext,
}

impl std::fmt::Display for TlsMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsMode::Implicit => write!(f, "implicit-tls"),
            TlsMode::Opportunistic => write!(f, "starttls"),
            TlsMode::Plaintext => write!(f, "plaintext"),
        }
    }
}

/// One entry of the outbound port table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    pub port: u16,
    pub tls: TlsMode,
}

/// Outbound delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Ports tried for every MX host, in order, most secure first
    #[serde(default = "default_ports")]
    pub ports: Vec<PortConfig>,

    /// Upper bound for delivering to one recipient
    #[serde(default = "default_delivery_timeout")]
    pub timeout_secs: u64,

    /// Upper bound for sending a payment bounce
    #[serde(default = "default_bounce_timeout")]
    pub bounce_timeout_secs: u64,

    /// Timeout for a single connect and handshake
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Name sent in EHLO; defaults to the server hostname
    pub hello_name: Option<String>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            ports: default_ports(),
            timeout_secs: default_delivery_timeout(),
            bounce_timeout_secs: default_bounce_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            hello_name: None,
        }
    }
}

impl DeliveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn bounce_timeout(&self) -> Duration {
        Duration::from_secs(self.bounce_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_ports() -> Vec<PortConfig> {
    vec![
        PortConfig {
            port: 465,
            tls: TlsMode::Implicit,
        },
        PortConfig {
            port: 587,
            tls: TlsMode::Opportunistic,
        },
        PortConfig {
            port: 2525,
            tls: TlsMode::Plaintext,
        },
        PortConfig {
            port: 25,
            tls: TlsMode::Plaintext,
        },
    ]
}

fn default_delivery_timeout() -> u64 {
    60
}

fn default_bounce_timeout() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    10
}

/// DKIM signing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkimConfig {
    /// Selector (s= tag)
    #[serde(default = "default_selector")]
    pub selector: String,

    /// PKCS#8 PEM private key, RSA or Ed25519
    pub key_path: Option<PathBuf>,

    /// Signing domain (d= tag); defaults to the served domain
    pub domain: Option<String>,
}

impl Default for DkimConfig {
    fn default() -> Self {
        Self {
            selector: default_selector(),
            key_path: None,
            domain: None,
        }
    }
}

fn default_selector() -> String {
    "default".to_string()
}

/// Quarantine and payment bounce configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineConfig {
    /// Holding mailbox for unpaid mail
    #[serde(default = "default_unpaid_mailbox")]
    pub mailbox: String,

    /// Price quoted in the bounce
    #[serde(default = "default_price")]
    pub price: String,

    /// Base of the payment link; defaults to `https://<domain>/pay`
    pub payment_base_url: Option<String>,

    /// Sender of payment bounces; defaults to `info@<domain>`
    pub bounce_sender: Option<String>,
}

impl Default for QuarantineConfig {
    fn default() -> Self {
        Self {
            mailbox: default_unpaid_mailbox(),
            price: default_price(),
            payment_base_url: None,
            bounce_sender: None,
        }
    }
}

fn default_unpaid_mailbox() -> String {
    "UNPAID".to_string()
}

fn default_price() -> String {
    "$0.05".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to certificate file
    pub cert_path: PathBuf,

    /// Path to private key file
    pub key_path: PathBuf,
}

impl Config {
    /// Load configuration from a TOML file only
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file layered with `PAYMTA__SECTION__KEY`
    /// environment variables. Without an explicit path the default
    /// locations are tried in order.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => [
                PathBuf::from("./paymta.toml"),
                PathBuf::from("/etc/paymta/paymta.toml"),
            ]
            .into_iter()
            .find(|p| p.exists())
            .ok_or_else(|| crate::Error::Config("No configuration file found".to_string()))?,
        };

        let config: Config = ::config::Config::builder()
            .add_source(::config::File::from(path.as_path()).format(::config::FileFormat::Toml))
            .add_source(
                ::config::Environment::with_prefix("PAYMTA")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| {
                crate::Error::Config(format!("Failed to load {}: {}", path.display(), e))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot work, before anything binds
    pub fn validate(&self) -> crate::Result<()> {
        if self.server.domain.trim().is_empty() {
            return Err(crate::Error::Config("server.domain must be set".to_string()));
        }

        if self.database.backend == "postgres" && self.database.url.is_none() {
            return Err(crate::Error::Config(
                "database.url is required for the postgres backend".to_string(),
            ));
        }

        if self.database.backend != "memory" && !self.database.accounts.is_empty() {
            return Err(crate::Error::Config(
                "database.accounts is only read by the memory backend; use add-credential"
                    .to_string(),
            ));
        }

        if self.tls.is_none() {
            if let Some(listener) = self.smtp.listeners.iter().find(|l| l.mode.needs_tls()) {
                return Err(crate::Error::Config(format!(
                    "listener {} ({}) needs a [tls] certificate and key",
                    listener.address, listener.mode
                )));
            }
            if self.smtp.force_tls {
                return Err(crate::Error::Config(
                    "smtp.force_tls needs a [tls] certificate and key".to_string(),
                ));
            }
        }

        if self.delivery.ports.is_empty() {
            return Err(crate::Error::Config(
                "delivery.ports must list at least one port".to_string(),
            ));
        }

        for net in &self.smtp.allowed_nets {
            net.parse::<ipnet::IpNet>().map_err(|e| {
                crate::Error::Config(format!("Invalid network {:?} in smtp.allowed_nets: {}", net, e))
            })?;
        }

        for (key, pattern) in [
            ("smtp.allowed_sender", &self.smtp.allowed_sender),
            ("smtp.allowed_recipients", &self.smtp.allowed_recipients),
        ] {
            if let Some(pattern) = pattern {
                regex::Regex::new(pattern).map_err(|e| {
                    crate::Error::Config(format!("Invalid regular expression in {}: {}", key, e))
                })?;
            }
        }

        Ok(())
    }

    /// Signing domain for DKIM
    pub fn dkim_domain(&self) -> &str {
        self.dkim.domain.as_deref().unwrap_or(&self.server.domain)
    }

    /// Sender address of payment bounces
    pub fn bounce_sender(&self) -> String {
        self.quarantine
            .bounce_sender
            .clone()
            .unwrap_or_else(|| format!("info@{}", self.server.domain))
    }

    /// Base of the payment link, without a trailing slash
    pub fn payment_base_url(&self) -> String {
        self.quarantine
            .payment_base_url
            .as_deref()
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("https://{}/pay", self.server.domain))
    }

    /// Name used in outbound EHLO
    pub fn hello_name(&self) -> &str {
        self.delivery
            .hello_name
            .as_deref()
            .unwrap_or(&self.server.hostname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MINIMAL: &str = r#"
[server]
hostname = "mx.example.com"
domain = "example.com"

[database]
backend = "memory"

[smtp]
listeners = [{ address = "127.0.0.1:2525", mode = "plain" }]
"#;

    #[test]
    fn test_default_config() {
        let smtp = SmtpConfig::default();
        assert_eq!(smtp.listeners.len(), 3);
        assert_eq!(smtp.listeners[2].mode, ListenerMode::Tls);
        assert_eq!(smtp.max_message_size, 10_240_000);

        let delivery = DeliveryConfig::default();
        let ports: Vec<u16> = delivery.ports.iter().map(|p| p.port).collect();
        assert_eq!(ports, vec![465, 587, 2525, 25]);
        assert_eq!(delivery.ports[0].tls, TlsMode::Implicit);
        assert_eq!(delivery.bounce_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_parse_config() {
        let config = Config::from_toml(MINIMAL).unwrap();
        assert_eq!(config.server.hostname, "mx.example.com");
        assert_eq!(config.database.backend, "memory");
        assert_eq!(config.smtp.listeners[0].mode, ListenerMode::Plain);
        assert_eq!(config.bounce_sender(), "info@example.com");
        assert_eq!(config.payment_base_url(), "https://example.com/pay");
        assert_eq!(config.dkim_domain(), "example.com");
        assert_eq!(config.hello_name(), "mx.example.com");
    }

    #[test]
    fn test_parse_port_table() {
        let toml = format!(
            "{}\n[delivery]\nports = [{{ port = 25, tls = \"plaintext\" }}, {{ port = 465, tls = \"implicit\" }}]\n",
            MINIMAL
        );
        let config = Config::from_toml(&toml).unwrap();
        assert_eq!(
            config.delivery.ports,
            vec![
                PortConfig { port: 25, tls: TlsMode::Plaintext },
                PortConfig { port: 465, tls: TlsMode::Implicit },
            ]
        );
    }

    #[test]
    fn test_tls_listener_without_tls_is_rejected() {
        let toml = r#"
[server]
domain = "example.com"

[database]
backend = "memory"
"#;
        let err = Config::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("needs a [tls]"));
    }

    #[test]
    fn test_postgres_requires_url() {
        let toml = MINIMAL.replace("backend = \"memory\"", "backend = \"postgres\"");
        assert!(Config::from_toml(&toml).is_err());
    }

    #[test]
    fn test_memory_accounts() {
        let toml = MINIMAL.replace(
            "backend = \"memory\"",
            "backend = \"memory\"\naccounts = [{ email = \"alice@example.com\", key = \"k1\" }]",
        );
        let config = Config::from_toml(&toml).unwrap();
        assert_eq!(config.database.accounts.len(), 1);
        assert_eq!(config.database.accounts[0].email, "alice@example.com");

        let toml = toml.replace(
            "backend = \"memory\"",
            "backend = \"postgres\"\nurl = \"postgres://localhost/paymta\"",
        );
        let err = Config::from_toml(&toml).unwrap_err();
        assert!(err.to_string().contains("database.accounts"));
    }

    #[test]
    fn test_bad_regex_and_network() {
        let toml = format!("{}allowed_sender = \"([\"\n", MINIMAL);
        assert!(Config::from_toml(&toml).is_err());

        let toml = format!("{}allowed_nets = [\"10.0.0.0/33\"]\n", MINIMAL);
        assert!(Config::from_toml(&toml).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paymta.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.server.domain, "example.com");
    }
}
