use std::collections::HashSet;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::debug;

use crate::participants::normalize_address;
use crate::{
    Address, ArchiveCounts, ArchiveStore, AttachmentRecord, DownloadedMessage, FolderUidValidity,
    MessageKey, MessageParticipants, NormalizedMessage, Participation, Role, YearCount,
};

const DOWNLOADED_COLUMNS: &str = "uid, folder, subject, sender, recipients, cc, bcc, date, \
     body_text, body_html, attachment_dir, message_id";

#[derive(Clone)]
pub struct SqliteArchiveStore {
    pool: SqlitePool,
}

impl SqliteArchiveStore {
    pub async fn connect(path: &str) -> Result<Self> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{}", path)
        };
        let options = SqliteConnectOptions::new()
            .filename(url.trim_start_matches("sqlite:"))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("opening archive database {}", path))?;
        Ok(Self { pool })
    }

    pub async fn init(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        debug!("archive migrations applied");
        Ok(())
    }

    pub async fn get_downloaded(&self, uid: u32, folder: &str) -> Result<Option<DownloadedMessage>> {
        let query = format!(
            "SELECT {} FROM downloaded_messages WHERE uid = ? AND folder = ?",
            DOWNLOADED_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(i64::from(uid))
            .bind(folder)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(downloaded_from_row).transpose()
    }

    /// Keyset page over raw records ordered by (folder, uid), starting after `after`.
    pub async fn downloaded_page(
        &self,
        after: Option<&MessageKey>,
        limit: i64,
    ) -> Result<Vec<DownloadedMessage>> {
        let rows = match after {
            Some(key) => {
                let query = format!(
                    "SELECT {} FROM downloaded_messages
                     WHERE folder > ? OR (folder = ? AND uid > ?)
                     ORDER BY folder, uid LIMIT ?",
                    DOWNLOADED_COLUMNS
                );
                sqlx::query(&query)
                    .bind(&key.folder)
                    .bind(&key.folder)
                    .bind(i64::from(key.uid))
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let query = format!(
                    "SELECT {} FROM downloaded_messages ORDER BY folder, uid LIMIT ?",
                    DOWNLOADED_COLUMNS
                );
                sqlx::query(&query).bind(limit).fetch_all(&self.pool).await?
            }
        };
        rows.iter().map(downloaded_from_row).collect()
    }

    pub async fn list_uid_validities(&self) -> Result<Vec<FolderUidValidity>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT folder, uidvalidity FROM folder_uidvalidity ORDER BY folder",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(folder, uidvalidity)| {
                Ok(FolderUidValidity {
                    folder,
                    uidvalidity: u32::try_from(uidvalidity)?,
                })
            })
            .collect()
    }

    /// Stored records whose Message-ID is still unknown, grouped by folder order.
    pub async fn keys_missing_message_id(&self) -> Result<Vec<MessageKey>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT folder, uid FROM downloaded_messages
             WHERE message_id IS NULL OR message_id = ''
             ORDER BY folder, uid",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(folder, uid)| {
                Ok(MessageKey {
                    folder,
                    uid: u32::try_from(uid)?,
                })
            })
            .collect()
    }

    /// Fills an empty Message-ID in both the raw and normalized rows.
    pub async fn set_message_id(&self, uid: u32, folder: &str, message_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE downloaded_messages SET message_id = ?
             WHERE uid = ? AND folder = ? AND (message_id IS NULL OR message_id = '')",
        )
        .bind(message_id)
        .bind(i64::from(uid))
        .bind(folder)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        sqlx::query(
            "UPDATE messages SET message_id = ?
             WHERE uid = ? AND folder = ? AND message_id = ''",
        )
        .bind(message_id)
        .bind(i64::from(uid))
        .bind(folder)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(updated > 0)
    }

    pub async fn year_counts(&self) -> Result<Vec<YearCount>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT CASE WHEN length(date) >= 4 THEN substr(date, 1, 4) ELSE 'unknown' END AS year,
                    COUNT(*)
             FROM downloaded_messages GROUP BY year ORDER BY year",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(year, count)| YearCount { year, count })
            .collect())
    }

    pub async fn counts(&self) -> Result<ArchiveCounts> {
        let mut counts = ArchiveCounts::default();
        for (table, slot) in [
            ("downloaded_messages", &mut counts.downloaded),
            ("messages", &mut counts.messages),
            ("addresses", &mut counts.addresses),
            ("participants", &mut counts.participants),
            ("attachments", &mut counts.attachments),
            ("folder_uidvalidity", &mut counts.folders),
        ] {
            let query = format!("SELECT COUNT(*) FROM {}", table);
            let (count,) = sqlx::query_as::<_, (i64,)>(&query)
                .fetch_one(&self.pool)
                .await?;
            *slot = count;
        }
        Ok(counts)
    }

    /// Returns the identity for `raw`, creating it on first sight.
    pub async fn resolve_address(&self, raw: &str) -> Result<Address> {
        let mut tx = self.pool.begin().await?;
        let address = resolve_address_in(&mut *tx, raw).await?;
        tx.commit().await?;
        Ok(address)
    }

    pub async fn link(&self, message_id: i64, address_id: i64, role: Role) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let inserted = link_in(&mut *tx, message_id, address_id, role).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn normalized_message(&self, uid: u32, folder: &str) -> Result<Option<NormalizedMessage>> {
        let row = sqlx::query_as::<_, (i64, i64, String, String, String, String)>(
            "SELECT id, uid, folder, subject, date, message_id FROM messages
             WHERE folder = ? AND uid = ?",
        )
        .bind(folder)
        .bind(i64::from(uid))
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            Ok(NormalizedMessage {
                id: r.0,
                uid: u32::try_from(r.1)?,
                folder: r.2,
                subject: r.3,
                date: r.4,
                message_id: r.5,
            })
        })
        .transpose()
    }

    /// Participant links of one message as (email, role), ordered by role then email.
    pub async fn participants_of(&self, message_id: i64) -> Result<Vec<(String, Role)>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT a.email, p.role FROM participants p
             JOIN addresses a ON a.id = p.address_id
             WHERE p.message_id = ?
             ORDER BY CASE p.role WHEN 'from' THEN 0 WHEN 'to' THEN 1 WHEN 'cc' THEN 2 ELSE 3 END,
                      a.email",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(email, role)| Ok((email, role.parse()?)))
            .collect()
    }

    pub async fn participations(&self, message_id: i64) -> Result<Vec<Participation>> {
        let rows = sqlx::query_as::<_, (i64, i64, String)>(
            "SELECT message_id, address_id, role FROM participants WHERE message_id = ?
             ORDER BY address_id, role",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(message_id, address_id, role)| {
                Ok(Participation {
                    message_id,
                    address_id,
                    role: role.parse()?,
                })
            })
            .collect()
    }

    pub async fn attachments_of(&self, uid: u32, folder: &str) -> Result<Vec<AttachmentRecord>> {
        let rows = sqlx::query_as::<_, (i64, String, String, String, String, i64, String)>(
            "SELECT uid, folder, filename, content_type, path, size, extracted_text
             FROM attachments WHERE folder = ? AND uid = ? ORDER BY filename",
        )
        .bind(folder)
        .bind(i64::from(uid))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                Ok(AttachmentRecord {
                    uid: u32::try_from(r.0)?,
                    folder: r.1,
                    filename: r.2,
                    content_type: r.3,
                    path: r.4,
                    size: u64::try_from(r.5)?,
                    extracted_text: r.6,
                })
            })
            .collect()
    }
}

#[async_trait]
impl ArchiveStore for SqliteArchiveStore {
    async fn exists(&self, uid: u32, folder: &str) -> Result<bool> {
        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT 1 FROM downloaded_messages WHERE uid = ? AND folder = ?",
        )
        .bind(i64::from(uid))
        .bind(folder)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn insert_if_absent(&self, record: &DownloadedMessage) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO downloaded_messages
             (uid, folder, subject, sender, recipients, cc, bcc, date, body_text, body_html, attachment_dir, message_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(uid, folder) DO NOTHING",
        )
        .bind(i64::from(record.uid))
        .bind(&record.folder)
        .bind(&record.subject)
        .bind(&record.sender)
        .bind(&record.recipients)
        .bind(&record.cc)
        .bind(&record.bcc)
        .bind(&record.date)
        .bind(&record.body_text)
        .bind(&record.body_html)
        .bind(record.attachment_dir.as_deref())
        .bind(&record.message_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_uid_validity(&self, folder: &str) -> Result<Option<u32>> {
        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT uidvalidity FROM folder_uidvalidity WHERE folder = ?",
        )
        .bind(folder)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| u32::try_from(r.0).context("stored uidvalidity out of range"))
            .transpose()
    }

    async fn record_uid_validity(&self, folder: &str, uidvalidity: u32) -> Result<bool> {
        // A recorded value is never overwritten; a differing value has to be
        // detected by the caller as a skew.
        let result = sqlx::query(
            "INSERT INTO folder_uidvalidity (folder, uidvalidity) VALUES (?, ?)
             ON CONFLICT(folder) DO NOTHING",
        )
        .bind(folder)
        .bind(i64::from(uidvalidity))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn full_sync_complete(&self, folder: &str) -> Result<bool> {
        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT full_sync_complete FROM folder_uidvalidity WHERE folder = ?",
        )
        .bind(folder)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some_and(|(flag,)| flag != 0))
    }

    async fn set_full_sync_complete(&self, folder: &str, complete: bool) -> Result<()> {
        sqlx::query("UPDATE folder_uidvalidity SET full_sync_complete = ? WHERE folder = ?")
            .bind(i64::from(complete))
            .bind(folder)
            .execute(&self.pool)
            .await?;
        debug!(folder, complete, "full sync marker updated");
        Ok(())
    }

    async fn max_known_uid(&self, folder: &str) -> Result<Option<u32>> {
        let (max,) = sqlx::query_as::<_, (Option<i64>,)>(
            "SELECT MAX(uid) FROM downloaded_messages WHERE folder = ?",
        )
        .bind(folder)
        .fetch_one(&self.pool)
        .await?;
        max.map(|v| u32::try_from(v).context("stored uid out of range"))
            .transpose()
    }

    async fn stored_uids(&self, folder: &str) -> Result<HashSet<u32>> {
        let rows = sqlx::query_as::<_, (i64,)>("SELECT uid FROM downloaded_messages WHERE folder = ?")
            .bind(folder)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|(uid,)| u32::try_from(uid).context("stored uid out of range"))
            .collect()
    }

    async fn normalize(
        &self,
        record: &DownloadedMessage,
        participants: &MessageParticipants,
    ) -> Result<i64> {
        // Insert-if-absent and the id lookup share one transaction so the
        // lookup never depends on cross-connection visibility.
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO messages (uid, folder, subject, date, body_text, body_html, attachment_dir, message_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(folder, uid) DO NOTHING",
        )
        .bind(i64::from(record.uid))
        .bind(&record.folder)
        .bind(&record.subject)
        .bind(&record.date)
        .bind(&record.body_text)
        .bind(&record.body_html)
        .bind(record.attachment_dir.as_deref())
        .bind(&record.message_id)
        .execute(&mut *tx)
        .await?;
        let (message_id,) =
            sqlx::query_as::<_, (i64,)>("SELECT id FROM messages WHERE folder = ? AND uid = ?")
                .bind(&record.folder)
                .bind(i64::from(record.uid))
                .fetch_one(&mut *tx)
                .await?;
        let links = participants.links();
        for (email, role) in &links {
            let address = resolve_address_in(&mut *tx, email).await?;
            link_in(&mut *tx, message_id, address.id, *role).await?;
        }
        tx.commit().await?;
        debug!(uid = record.uid, folder = %record.folder, links = links.len(), "message normalized");
        Ok(message_id)
    }

    async fn insert_attachment(&self, attachment: &AttachmentRecord) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO attachments (uid, folder, filename, content_type, path, size, extracted_text)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(folder, uid, filename) DO NOTHING",
        )
        .bind(i64::from(attachment.uid))
        .bind(&attachment.folder)
        .bind(&attachment.filename)
        .bind(&attachment.content_type)
        .bind(&attachment.path)
        .bind(i64::try_from(attachment.size)?)
        .bind(&attachment.extracted_text)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

async fn resolve_address_in(conn: &mut SqliteConnection, raw: &str) -> Result<Address> {
    let Some(email) = normalize_address(raw) else {
        bail!("cannot resolve an empty address");
    };
    sqlx::query("INSERT INTO addresses (email) VALUES (?) ON CONFLICT(email) DO NOTHING")
        .bind(&email)
        .execute(&mut *conn)
        .await?;
    let (id,) = sqlx::query_as::<_, (i64,)>("SELECT id FROM addresses WHERE email = ?")
        .bind(&email)
        .fetch_one(&mut *conn)
        .await?;
    Ok(Address { id, email })
}

async fn link_in(
    conn: &mut SqliteConnection,
    message_id: i64,
    address_id: i64,
    role: Role,
) -> Result<bool> {
    let result = sqlx::query(
        "INSERT INTO participants (message_id, address_id, role) VALUES (?, ?, ?)
         ON CONFLICT(message_id, address_id, role) DO NOTHING",
    )
    .bind(message_id)
    .bind(address_id)
    .bind(role.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

fn downloaded_from_row(row: &SqliteRow) -> Result<DownloadedMessage> {
    let uid: i64 = row.try_get("uid")?;
    Ok(DownloadedMessage {
        uid: u32::try_from(uid).context("stored uid out of range")?,
        folder: row.try_get("folder")?,
        subject: row.try_get("subject")?,
        sender: row.try_get("sender")?,
        recipients: row.try_get("recipients")?,
        cc: row.try_get("cc")?,
        bcc: row.try_get("bcc")?,
        date: row.try_get("date")?,
        body_text: row.try_get("body_text")?,
        body_html: row.try_get("body_html")?,
        attachment_dir: row.try_get("attachment_dir")?,
        message_id: row.try_get("message_id")?,
    })
}
