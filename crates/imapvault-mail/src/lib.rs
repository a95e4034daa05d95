//! Mail retrieval capability: the traits the sync engine consumes and the
//! blocking IMAP implementation behind them.

use anyhow::{Result, anyhow};
use imap::{ClientBuilder, ConnectionMode};
use serde::{Deserialize, Serialize};
use tracing::debug;

mod message;

pub use message::{
    ParsedAttachment, ParsedMessage, date_from_headers, header_value, message_id_from_headers,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub skip_tls_verify: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderStatus {
    pub uid_validity: u32,
    pub uid_next: Option<u32>,
    pub exists: u32,
}

/// UID predicate for enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UidQuery {
    All,
    List(Vec<u32>),
    GreaterThan(u32),
}

impl UidQuery {
    pub fn to_search(&self) -> String {
        match self {
            UidQuery::All => "ALL".to_string(),
            UidQuery::List(uids) => format!("UID {}", uid_set(uids)),
            UidQuery::GreaterThan(uid) => format!("UID {}:*", uid.saturating_add(1)),
        }
    }

    pub fn matches(&self, uid: u32) -> bool {
        match self {
            UidQuery::All => true,
            UidQuery::List(uids) => uids.contains(&uid),
            UidQuery::GreaterThan(min) => uid > *min,
        }
    }
}

/// One fetched item. `body` is `None` when the server answered the UID
/// without returning the requested section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub uid: u32,
    pub body: Option<Vec<u8>>,
}

pub trait MailSession {
    fn list_folders(&mut self) -> Result<Vec<String>>;
    fn folder_status(&mut self, folder: &str) -> Result<FolderStatus>;
    fn search_uids(&mut self, folder: &str, query: &UidQuery) -> Result<Vec<u32>>;
    fn fetch(&mut self, folder: &str, uids: &[u32]) -> Result<Vec<RawMessage>>;
    fn fetch_headers(&mut self, folder: &str, uids: &[u32]) -> Result<Vec<RawMessage>>;
    fn logout(&mut self) -> Result<()>;
}

pub trait MailConnector {
    type Session: MailSession;

    fn connect(&self) -> Result<Self::Session>;
}

#[derive(Debug, Clone)]
pub struct ImapConnector {
    config: ImapConfig,
}

impl ImapConnector {
    pub fn new(config: ImapConfig) -> Self {
        Self { config }
    }
}

impl MailConnector for ImapConnector {
    type Session = ImapSession;

    fn connect(&self) -> Result<ImapSession> {
        let session = imap_connect(&self.config)?;
        Ok(ImapSession {
            session,
            selected: None,
        })
    }
}

pub struct ImapSession {
    session: imap::Session<imap::Connection>,
    selected: Option<String>,
}

impl ImapSession {
    fn examine(&mut self, folder: &str) -> Result<()> {
        if self.selected.as_deref() == Some(folder) {
            return Ok(());
        }
        debug!(folder, "imap examine");
        self.selected = None;
        self.session.examine(folder)?;
        self.selected = Some(folder.to_string());
        Ok(())
    }

    fn uid_fetch(&mut self, folder: &str, uids: &[u32], query: &str) -> Result<Vec<RawMessage>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        self.examine(folder)?;
        debug!(folder, count = uids.len(), query, "imap uid_fetch");
        let fetches = self.session.uid_fetch(uid_set(uids), query)?;
        let header_only = query.contains("HEADER");
        let mut out = Vec::new();
        for fetch in fetches.iter() {
            let Some(uid) = fetch.uid else {
                continue;
            };
            let body = if header_only {
                fetch.header()
            } else {
                fetch.body()
            };
            out.push(RawMessage {
                uid,
                body: body.map(|b| b.to_vec()),
            });
        }
        Ok(out)
    }
}

impl MailSession for ImapSession {
    fn list_folders(&mut self) -> Result<Vec<String>> {
        let list = self.session.list(None, Some("*"))?;
        debug!(raw_count = list.len(), "imap list folders");
        let mut folders = Vec::new();
        for folder in list.iter() {
            if folder
                .attributes()
                .iter()
                .any(|attr| matches!(attr, imap_proto::NameAttribute::NoSelect))
            {
                continue;
            }
            folders.push(folder.name().to_string());
        }
        Ok(folders)
    }

    fn folder_status(&mut self, folder: &str) -> Result<FolderStatus> {
        let status = self.session.status(folder, "(UIDVALIDITY UIDNEXT MESSAGES)")?;
        let uid_validity = status.uid_validity.ok_or_else(|| {
            anyhow!("status for folder '{}' does not contain UIDVALIDITY", folder)
        })?;
        Ok(FolderStatus {
            uid_validity,
            uid_next: status.uid_next,
            exists: status.exists,
        })
    }

    fn search_uids(&mut self, folder: &str, query: &UidQuery) -> Result<Vec<u32>> {
        if let UidQuery::List(uids) = query {
            if uids.is_empty() {
                return Ok(Vec::new());
            }
        }
        self.examine(folder)?;
        let search = query.to_search();
        debug!(folder, query = %search, "imap uid_search");
        let mut uids: Vec<u32> = self
            .session
            .uid_search(&search)?
            .into_iter()
            .filter(|uid| query.matches(*uid))
            .collect();
        uids.sort_unstable();
        Ok(uids)
    }

    fn fetch(&mut self, folder: &str, uids: &[u32]) -> Result<Vec<RawMessage>> {
        self.uid_fetch(folder, uids, "(UID BODY.PEEK[])")
    }

    fn fetch_headers(&mut self, folder: &str, uids: &[u32]) -> Result<Vec<RawMessage>> {
        self.uid_fetch(folder, uids, "(UID BODY.PEEK[HEADER])")
    }

    fn logout(&mut self) -> Result<()> {
        self.selected = None;
        self.session.logout()?;
        Ok(())
    }
}

fn imap_connect(imap: &ImapConfig) -> Result<imap::Session<imap::Connection>> {
    debug!(host = %imap.host, port = imap.port, "imap_connect start");
    let client = ClientBuilder::new(imap.host.as_str(), imap.port)
        .tls_kind(imap::TlsKind::Native)
        .mode(ConnectionMode::AutoTls)
        .danger_skip_tls_verify(imap.skip_tls_verify)
        .connect()?;
    debug!("imap_connect tcp connected");
    let session = client
        .login(&imap.username, &imap.password)
        .map_err(|e| e.0)?;
    debug!("imap_connect login ok");
    Ok(session)
}

pub fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(|uid| uid.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
