//! File-backed mailbox store
//!
//! Layout: `<root>/<user>/<mailbox>/<uid>.eml` holds the literal and
//! `<uid>.meta` a single line with the internal date and the flags.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use paymta_common::{Error, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// IMAP special-use attribute (RFC 6154)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialUse {
    All,
    Drafts,
    Junk,
    Sent,
    Trash,
}

impl SpecialUse {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "All" => Some(SpecialUse::All),
            "Drafts" => Some(SpecialUse::Drafts),
            "Junk" => Some(SpecialUse::Junk),
            "Sent" => Some(SpecialUse::Sent),
            "Trash" => Some(SpecialUse::Trash),
            _ => None,
        }
    }

    pub fn attribute(self) -> &'static str {
        match self {
            SpecialUse::All => "\\All",
            SpecialUse::Drafts => "\\Drafts",
            SpecialUse::Junk => "\\Junk",
            SpecialUse::Sent => "\\Sent",
            SpecialUse::Trash => "\\Trash",
        }
    }
}

/// A mailbox owned by one user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxInfo {
    pub user: String,
    pub name: String,
    pub special_use: Option<SpecialUse>,
}

impl MailboxInfo {
    pub fn new(user: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            user: user.into(),
            special_use: SpecialUse::from_name(&name),
            name,
        }
    }

    /// LIST attributes for this mailbox
    pub fn attributes(&self) -> Vec<&'static str> {
        self.special_use.map(|s| s.attribute()).into_iter().collect()
    }
}

/// System message flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFlag {
    Seen,
    Answered,
    Flagged,
    Deleted,
    Draft,
}

impl MessageFlag {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageFlag::Seen => "\\Seen",
            MessageFlag::Answered => "\\Answered",
            MessageFlag::Flagged => "\\Flagged",
            MessageFlag::Deleted => "\\Deleted",
            MessageFlag::Draft => "\\Draft",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "\\Seen" => Some(MessageFlag::Seen),
            "\\Answered" => Some(MessageFlag::Answered),
            "\\Flagged" => Some(MessageFlag::Flagged),
            "\\Deleted" => Some(MessageFlag::Deleted),
            "\\Draft" => Some(MessageFlag::Draft),
            _ => None,
        }
    }
}

/// Per-user mailboxes and the messages in them
#[async_trait]
pub trait MailboxStore: Send + Sync {
    /// Create a mailbox; fails with `AlreadyExists` when it is there
    async fn create_mailbox(&self, user: &str, name: &str) -> Result<MailboxInfo>;

    async fn get_mailbox(&self, user: &str, name: &str) -> Result<Option<MailboxInfo>>;

    async fn list_mailboxes(&self, user: &str) -> Result<Vec<MailboxInfo>>;

    async fn delete_mailbox(&self, user: &str, name: &str) -> Result<()>;

    async fn rename_mailbox(&self, _user: &str, _from: &str, _to: &str) -> Result<()> {
        Err(Error::NotSupported("rename mailbox"))
    }

    /// Append a message; returns the UID it was stored under
    async fn create_message(
        &self,
        mailbox: &MailboxInfo,
        flags: &[MessageFlag],
        date: DateTime<Utc>,
        literal: &[u8],
    ) -> Result<u32>;
}

/// Mailboxes as directories under a root path
pub struct FileMailboxStore {
    root: PathBuf,
}

impl FileMailboxStore {
    pub fn new(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)
            .map_err(|e| Error::Storage(format!("Failed to create storage directory: {}", e)))?;

        info!(path = %root.display(), "Initialized mailbox storage");

        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Reject names that could escape the storage root
    fn component(name: &str) -> Result<&str> {
        if name.is_empty()
            || name.starts_with('.')
            || name.contains("..")
            || name.contains('/')
            || name.contains('\\')
            || name.contains('\0')
        {
            return Err(Error::Validation(format!("Invalid mailbox path component {:?}", name)));
        }
        Ok(name)
    }

    fn user_dir(&self, user: &str) -> Result<PathBuf> {
        let user = user.trim().to_ascii_lowercase();
        Ok(self.root.join(Self::component(&user)?))
    }

    fn mailbox_dir(&self, user: &str, name: &str) -> Result<PathBuf> {
        Ok(self.user_dir(user)?.join(Self::component(name)?))
    }

    async fn next_uid(dir: &Path) -> Result<u32> {
        let mut entries = fs::read_dir(dir)
            .await
            .map_err(|e| Error::Storage(format!("Failed to read mailbox: {}", e)))?;

        let mut max = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Storage(format!("Failed to read mailbox: {}", e)))?
        {
            let name = entry.file_name();
            let uid = name
                .to_str()
                .and_then(|n| n.strip_suffix(".eml"))
                .and_then(|n| n.parse::<u32>().ok());
            if let Some(uid) = uid {
                max = max.max(uid);
            }
        }
        Ok(max + 1)
    }

    /// Read back a stored literal
    pub async fn read_message(&self, mailbox: &MailboxInfo, uid: u32) -> Result<Vec<u8>> {
        let path = self
            .mailbox_dir(&mailbox.user, &mailbox.name)?
            .join(format!("{}.eml", uid));
        fs::read(&path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to read message {}: {}", uid, e)))
    }

    /// Read back the flags of a stored message
    pub async fn message_flags(&self, mailbox: &MailboxInfo, uid: u32) -> Result<Vec<MessageFlag>> {
        let path = self
            .mailbox_dir(&mailbox.user, &mailbox.name)?
            .join(format!("{}.meta", uid));
        let meta = fs::read_to_string(&path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to read flags of {}: {}", uid, e)))?;
        Ok(meta
            .split_whitespace()
            .skip(1)
            .filter_map(MessageFlag::parse)
            .collect())
    }

    /// Number of messages in a mailbox
    pub async fn message_count(&self, mailbox: &MailboxInfo) -> Result<usize> {
        let dir = self.mailbox_dir(&mailbox.user, &mailbox.name)?;
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| Error::Storage(format!("Failed to read mailbox: {}", e)))?;

        let mut count = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Storage(format!("Failed to read mailbox: {}", e)))?
        {
            if entry.path().extension().is_some_and(|ext| ext == "eml") {
                count += 1;
            }
        }
        Ok(count)
    }
}

#[async_trait]
impl MailboxStore for FileMailboxStore {
    async fn create_mailbox(&self, user: &str, name: &str) -> Result<MailboxInfo> {
        let dir = self.mailbox_dir(user, name)?;
        fs::create_dir_all(self.user_dir(user)?)
            .await
            .map_err(|e| Error::Storage(format!("Failed to create user directory: {}", e)))?;

        match fs::create_dir(&dir).await {
            Ok(()) => {
                debug!(user = %user, mailbox = %name, "Created mailbox");
                Ok(MailboxInfo::new(user, name))
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(Error::AlreadyExists(format!("Mailbox {} of {}", name, user)))
            }
            Err(e) => Err(Error::Storage(format!("Failed to create mailbox: {}", e))),
        }
    }

    async fn get_mailbox(&self, user: &str, name: &str) -> Result<Option<MailboxInfo>> {
        let dir = self.mailbox_dir(user, name)?;
        Ok(dir.is_dir().then(|| MailboxInfo::new(user, name)))
    }

    async fn list_mailboxes(&self, user: &str) -> Result<Vec<MailboxInfo>> {
        let mut entries = match fs::read_dir(self.user_dir(user)?).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Storage(format!("Failed to list mailboxes: {}", e))),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Storage(format!("Failed to list mailboxes: {}", e)))?
        {
            if entry.path().is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();

        Ok(names
            .into_iter()
            .map(|name| MailboxInfo::new(user, name))
            .collect())
    }

    async fn delete_mailbox(&self, user: &str, name: &str) -> Result<()> {
        let dir = self.mailbox_dir(user, name)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::NotFound(format!("Mailbox {} of {}", name, user)))
            }
            Err(e) => Err(Error::Storage(format!("Failed to delete mailbox: {}", e))),
        }
    }

    async fn create_message(
        &self,
        mailbox: &MailboxInfo,
        flags: &[MessageFlag],
        date: DateTime<Utc>,
        literal: &[u8],
    ) -> Result<u32> {
        let dir = self.mailbox_dir(&mailbox.user, &mailbox.name)?;
        if !dir.is_dir() {
            return Err(Error::NotFound(format!(
                "Mailbox {} of {}",
                mailbox.name, mailbox.user
            )));
        }

        // Exclusive create, so concurrent deliveries never share a UID
        let mut uid = Self::next_uid(&dir).await?;
        let mut file = loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(dir.join(format!("{}.eml", uid)))
                .await
            {
                Ok(file) => break file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => uid += 1,
                Err(e) => return Err(Error::Storage(format!("Failed to create message: {}", e))),
            }
        };

        file.write_all(literal)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write message: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| Error::Storage(format!("Failed to write message: {}", e)))?;

        let mut meta = date.to_rfc3339();
        for flag in flags {
            meta.push(' ');
            meta.push_str(flag.as_str());
        }
        meta.push('\n');
        fs::write(dir.join(format!("{}.meta", uid)), meta)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write message flags: {}", e)))?;

        debug!(
            user = %mailbox.user,
            mailbox = %mailbox.name,
            uid,
            size = literal.len(),
            "Stored message"
        );

        Ok(uid)
    }
}
