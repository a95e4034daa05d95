//! In-memory mail server used by the engine tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Result, anyhow, bail};
use imapvault_content::{AttachmentLayout, FileTextExtractor};
use imapvault_core::SqliteArchiveStore;
use imapvault_mail::{FolderStatus, MailConnector, MailSession, RawMessage, UidQuery};

use crate::{Engine, RetryPolicy, SyncSettings};

#[derive(Default)]
pub struct FakeFolder {
    pub uid_validity: u32,
    pub messages: BTreeMap<u32, Vec<u8>>,
    /// UIDs the server answers without a body.
    pub broken: HashSet<u32>,
    /// UIDs answered without a body this many more times.
    pub flaky: HashMap<u32, u32>,
    /// Remaining fetch calls on this folder that fail outright.
    pub failing_fetches: u32,
    /// 1-based fetch call numbers on this folder that fail.
    pub fail_fetch_calls: HashSet<u32>,
    pub fetch_count: u32,
}

#[derive(Default)]
pub struct FakeState {
    pub folders: Vec<(String, FakeFolder)>,
    pub connects: u32,
    pub failing_connects: u32,
    pub failing_lists: u32,
    pub logouts: u32,
    pub fetched: Vec<(String, Vec<u32>)>,
    pub header_fetches: Vec<(String, Vec<u32>)>,
}

impl FakeState {
    fn folder(&mut self, name: &str) -> Result<&mut FakeFolder> {
        self.folders
            .iter_mut()
            .find(|(folder, _)| folder == name)
            .map(|(_, folder)| folder)
            .ok_or_else(|| anyhow!("No Response: mailbox '{}' does not exist", name))
    }
}

#[derive(Clone, Default)]
pub struct FakeMail {
    pub state: Rc<RefCell<FakeState>>,
}

impl FakeMail {
    pub fn add_folder(&self, name: &str, uid_validity: u32, uids: impl IntoIterator<Item = u32>) {
        let messages = uids
            .into_iter()
            .map(|uid| (uid, sample_message(uid, name)))
            .collect();
        self.state.borrow_mut().folders.push((
            name.to_string(),
            FakeFolder {
                uid_validity,
                messages,
                ..Default::default()
            },
        ));
    }

    pub fn with_folder<T>(&self, name: &str, f: impl FnOnce(&mut FakeFolder) -> T) -> T {
        let mut state = self.state.borrow_mut();
        let folder = state
            .folders
            .iter_mut()
            .find(|(folder, _)| folder == name)
            .map(|(_, folder)| folder);
        match folder {
            Some(folder) => f(folder),
            None => panic!("unknown fake folder {}", name),
        }
    }

    pub fn fetched_uids(&self, folder: &str) -> Vec<u32> {
        self.state
            .borrow()
            .fetched
            .iter()
            .filter(|(name, _)| name == folder)
            .flat_map(|(_, uids)| uids.iter().copied())
            .collect()
    }

    pub fn fetch_calls(&self, folder: &str) -> usize {
        self.state
            .borrow()
            .fetched
            .iter()
            .filter(|(name, _)| name == folder)
            .count()
    }

    pub fn connects(&self) -> u32 {
        self.state.borrow().connects
    }
}

pub struct FakeSession {
    state: Rc<RefCell<FakeState>>,
}

impl MailConnector for FakeMail {
    type Session = FakeSession;

    fn connect(&self) -> Result<FakeSession> {
        let mut state = self.state.borrow_mut();
        state.connects += 1;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            bail!("connection refused");
        }
        Ok(FakeSession {
            state: self.state.clone(),
        })
    }
}

impl MailSession for FakeSession {
    fn list_folders(&mut self) -> Result<Vec<String>> {
        let mut state = self.state.borrow_mut();
        if state.failing_lists > 0 {
            state.failing_lists -= 1;
            bail!("Bye Response: server shutting down");
        }
        Ok(state
            .folders
            .iter()
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn folder_status(&mut self, folder: &str) -> Result<FolderStatus> {
        let mut state = self.state.borrow_mut();
        let folder = state.folder(folder)?;
        Ok(FolderStatus {
            uid_validity: folder.uid_validity,
            uid_next: folder.messages.keys().last().map(|uid| uid + 1),
            exists: folder.messages.len() as u32,
        })
    }

    fn search_uids(&mut self, folder: &str, query: &UidQuery) -> Result<Vec<u32>> {
        let mut state = self.state.borrow_mut();
        let folder = state.folder(folder)?;
        Ok(folder
            .messages
            .keys()
            .copied()
            .filter(|uid| query.matches(*uid))
            .collect())
    }

    fn fetch(&mut self, folder_name: &str, uids: &[u32]) -> Result<Vec<RawMessage>> {
        let mut state = self.state.borrow_mut();
        state.fetched.push((folder_name.to_string(), uids.to_vec()));
        let folder = state.folder(folder_name)?;
        folder.fetch_count += 1;
        if folder.fail_fetch_calls.contains(&folder.fetch_count) {
            bail!("Bye Response: connection lost while fetching");
        }
        if folder.failing_fetches > 0 {
            folder.failing_fetches -= 1;
            bail!("Bye Response: connection lost while fetching");
        }
        let mut out = Vec::new();
        for uid in uids {
            let Some(body) = folder.messages.get(uid) else {
                continue;
            };
            let mut missing = folder.broken.contains(uid);
            if let Some(remaining) = folder.flaky.get_mut(uid) {
                if *remaining > 0 {
                    *remaining -= 1;
                    missing = true;
                }
            }
            out.push(RawMessage {
                uid: *uid,
                body: if missing { None } else { Some(body.clone()) },
            });
        }
        Ok(out)
    }

    fn fetch_headers(&mut self, folder_name: &str, uids: &[u32]) -> Result<Vec<RawMessage>> {
        let mut state = self.state.borrow_mut();
        state
            .header_fetches
            .push((folder_name.to_string(), uids.to_vec()));
        let folder = state.folder(folder_name)?;
        Ok(uids
            .iter()
            .filter_map(|uid| {
                folder.messages.get(uid).map(|body| RawMessage {
                    uid: *uid,
                    body: Some(header_block(body)),
                })
            })
            .collect())
    }

    fn logout(&mut self) -> Result<()> {
        self.state.borrow_mut().logouts += 1;
        Ok(())
    }
}

fn header_block(raw: &[u8]) -> Vec<u8> {
    let end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
        .unwrap_or(raw.len());
    raw[..end].to_vec()
}

/// Deterministic message: year cycles 2021..=2023 by uid.
pub fn sample_message(uid: u32, folder: &str) -> Vec<u8> {
    let year = 2021 + (uid % 3);
    format!(
        "From: \"Sender {uid}\" <Sender{uid}@Example.com>\r\n\
To: Me@Home.org, team@example.com\r\n\
Cc: boss@example.com\r\n\
Subject: {folder} message {uid}\r\n\
Date: Mon, 15 Mar {year} 10:00:00 +0000\r\n\
Message-ID: <{uid}.{folder}@example.com>\r\n\
\r\n\
Body of message {uid}.\r\n"
    )
    .into_bytes()
}

pub fn message_with_attachment(uid: u32) -> Vec<u8> {
    format!(
        "From: files@example.com\r\n\
To: me@home.org\r\n\
Subject: Files {uid}\r\n\
Date: Tue, 02 Jan 2024 08:00:00 +0000\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"B\"\r\n\
\r\n\
--B\r\n\
Content-Type: text/plain\r\n\
\r\n\
see attachment\r\n\
--B\r\n\
Content-Type: text/plain; name=\"notes.txt\"\r\n\
Content-Disposition: attachment; filename=\"notes.txt\"\r\n\
\r\n\
attached notes\r\n\
--B--\r\n"
    )
    .into_bytes()
}

pub fn temp_path(tag: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    std::env::temp_dir().join(format!(
        "imapvault_sync_{}_{}_{}",
        tag,
        std::process::id(),
        nanos
    ))
}

/// Fresh store, attachment root and zero-backoff settings.
pub struct Harness {
    pub store: SqliteArchiveStore,
    pub layout: AttachmentLayout,
    pub settings: SyncSettings,
    root: PathBuf,
}

impl Harness {
    pub async fn new() -> Result<Self> {
        let root = temp_path("harness");
        std::fs::create_dir_all(&root)?;
        let db_path = root.join("archive.db");
        let store = SqliteArchiveStore::connect(&db_path.to_string_lossy()).await?;
        store.init().await?;
        let mut settings = SyncSettings::default();
        settings.folder_retry = RetryPolicy::new(3, std::time::Duration::ZERO);
        Ok(Self {
            store,
            layout: AttachmentLayout::new(root.join("attachments")),
            settings,
            root,
        })
    }

    pub fn engine(&self) -> Engine<'_> {
        Engine {
            store: &self.store,
            layout: &self.layout,
            extractor: &FileTextExtractor,
            settings: &self.settings,
        }
    }

    pub fn attachments_root(&self) -> PathBuf {
        self.root.join("attachments")
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}
