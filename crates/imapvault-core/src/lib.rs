use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

mod participants;
mod store;

pub use participants::{MessageParticipants, RecipientInput, Role, normalize_address, normalize_recipients};
pub use store::SqliteArchiveStore;

/// Raw archive record, one per (uid, folder). Written once, never updated
/// apart from a late `message_id` backfill.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadedMessage {
    pub uid: u32,
    pub folder: String,
    pub subject: String,
    pub sender: String,
    pub recipients: String,
    pub cc: String,
    pub bcc: String,
    pub date: String,
    pub body_text: String,
    pub body_html: String,
    pub attachment_dir: Option<String>,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderUidValidity {
    pub folder: String,
    pub uidvalidity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub id: i64,
    pub email: String,
}

/// Normalized message row; `id` is the surrogate key participants point at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub id: i64,
    pub uid: u32,
    pub folder: String,
    pub subject: String,
    pub date: String,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participation {
    pub message_id: i64,
    pub address_id: i64,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub uid: u32,
    pub folder: String,
    pub filename: String,
    pub content_type: String,
    pub path: String,
    pub size: u64,
    pub extracted_text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveCounts {
    pub downloaded: i64,
    pub messages: i64,
    pub addresses: i64,
    pub participants: i64,
    pub attachments: i64,
    pub folders: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearCount {
    pub year: String,
    pub count: i64,
}

/// Key of a stored raw record, used for keyset pagination.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageKey {
    pub folder: String,
    pub uid: u32,
}

/// Raw-record and UID bookkeeping surface the sync engine runs against.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    async fn exists(&self, uid: u32, folder: &str) -> Result<bool>;
    async fn insert_if_absent(&self, record: &DownloadedMessage) -> Result<bool>;
    async fn get_uid_validity(&self, folder: &str) -> Result<Option<u32>>;
    async fn record_uid_validity(&self, folder: &str, uidvalidity: u32) -> Result<bool>;
    /// Whether the folder has been walked end to end with no message left
    /// behind. Incremental fetches are only safe once this holds.
    async fn full_sync_complete(&self, folder: &str) -> Result<bool>;
    async fn set_full_sync_complete(&self, folder: &str, complete: bool) -> Result<()>;
    async fn max_known_uid(&self, folder: &str) -> Result<Option<u32>>;
    async fn stored_uids(&self, folder: &str) -> Result<HashSet<u32>>;
    async fn normalize(
        &self,
        record: &DownloadedMessage,
        participants: &MessageParticipants,
    ) -> Result<i64>;
    async fn insert_attachment(&self, attachment: &AttachmentRecord) -> Result<bool>;
}
