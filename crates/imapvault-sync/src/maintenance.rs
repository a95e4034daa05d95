//! Offline and targeted passes over an existing archive.

use std::collections::{BTreeMap, HashSet};

use anyhow::Result;
use imapvault_core::{
    ArchiveCounts, ArchiveStore, FolderUidValidity, MessageKey, MessageParticipants,
    SqliteArchiveStore, YearCount,
};
use imapvault_mail::{
    MailConnector, MailSession, UidQuery, date_from_headers, message_id_from_headers,
};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::batch::{fetch_batch, partition};
use crate::tracker::{check_validity, verify_validity};
use crate::{Engine, FolderOutcome, FolderReport, SyncError, SyncResult};

const UNKNOWN_YEAR: &str = "unknown";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NormalizeReport {
    pub processed: usize,
}

/// Rebuilds messages and participant links from every stored raw record.
/// Safe to repeat: existing rows and links are left as they are.
pub async fn normalize_all(store: &SqliteArchiveStore, page_size: usize) -> Result<NormalizeReport> {
    let limit = i64::try_from(page_size.max(1))?;
    let mut report = NormalizeReport::default();
    let mut after: Option<MessageKey> = None;
    loop {
        let page = store.downloaded_page(after.as_ref(), limit).await?;
        let Some(last) = page.last() else {
            break;
        };
        after = Some(MessageKey {
            folder: last.folder.clone(),
            uid: last.uid,
        });
        for record in &page {
            let participants = MessageParticipants::from_record(record);
            store.normalize(record, &participants).await?;
            report.processed += 1;
        }
        info!(processed = report.processed, "normalized page");
    }
    Ok(report)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingReport {
    pub folder: String,
    pub uid_validity: u32,
    pub server_total: usize,
    pub stored_total: usize,
    pub missing: Vec<u32>,
    pub by_year: Vec<YearCount>,
}

/// Diffs the server's UIDs for `folder` against the archive and buckets the
/// missing ones by the year of their Date header.
pub async fn find_missing<S: MailSession>(
    store: &dyn ArchiveStore,
    session: &mut S,
    folder: &str,
    enumeration_batch_size: usize,
) -> SyncResult<MissingReport> {
    let uid_validity = verify_validity(store, session, folder).await?;
    let server = session
        .search_uids(folder, &UidQuery::All)
        .map_err(SyncError::Mail)?;
    let stored = store.stored_uids(folder).await.map_err(SyncError::Store)?;
    let missing = missing_uids(&server, &stored);
    if missing.is_empty() {
        info!(folder, "all UIDs already downloaded");
    } else {
        warn!(folder, count = missing.len(), "missing UIDs");
    }

    let mut years: BTreeMap<String, i64> = BTreeMap::new();
    for batch in partition(&missing, enumeration_batch_size) {
        let headers = session
            .fetch_headers(folder, &batch)
            .map_err(SyncError::Mail)?;
        for uid in &batch {
            let year = headers
                .iter()
                .find(|raw| raw.uid == *uid)
                .and_then(|raw| raw.body.as_deref())
                .and_then(date_from_headers)
                .map(|date| date.format("%Y").to_string())
                .unwrap_or_else(|| UNKNOWN_YEAR.to_string());
            *years.entry(year).or_default() += 1;
        }
    }

    Ok(MissingReport {
        folder: folder.to_string(),
        uid_validity,
        server_total: server.len(),
        stored_total: stored.len(),
        missing,
        by_year: years
            .into_iter()
            .map(|(year, count)| YearCount { year, count })
            .collect(),
    })
}

fn missing_uids(server: &[u32], stored: &HashSet<u32>) -> Vec<u32> {
    let mut missing: Vec<u32> = server
        .iter()
        .copied()
        .filter(|uid| !stored.contains(uid))
        .collect();
    missing.sort_unstable();
    missing.dedup();
    missing
}

/// Fetches exactly the UIDs of `folder` that the archive lacks, in recovery
/// sized batches. Each batch gets the folder retry policy on its own.
pub async fn recover_missing<C: MailConnector>(
    engine: &Engine<'_>,
    connector: &C,
    folder: &str,
) -> SyncResult<FolderReport> {
    let mut first = connector.connect().map_err(SyncError::Connect)?;
    let mut report = FolderReport::new(folder);
    report.begin_attempt();
    report.uid_validity = Some(check_validity(engine.store, &mut first, folder).await?);

    let mut stored = engine
        .store
        .stored_uids(folder)
        .await
        .map_err(SyncError::Store)?;
    let server = first
        .search_uids(folder, &UidQuery::All)
        .map_err(SyncError::Mail)?;
    let missing = missing_uids(&server, &stored);
    report.fetched = missing.len();
    info!(folder, count = missing.len(), "recovering missing UIDs");

    let policy = engine.settings.folder_retry;
    let mut session = Some(first);
    for batch in partition(&missing, engine.settings.recovery_batch_size) {
        let mut attempt = 1;
        loop {
            let result = match reopen(engine, connector, &mut session, folder).await {
                Ok(active) => {
                    fetch_batch(engine, active, folder, &batch, &mut stored, &mut report).await
                }
                Err(err) => Err(err),
            };
            let Err(err) = result else {
                break;
            };
            if err.is_fatal() {
                return Err(err);
            }
            warn!(folder, attempt, error = %err, "recovery batch failed");
            session = None;
            match policy.next_delay(attempt, &err) {
                Some(delay) => {
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => {
                    error!(folder, attempts = attempt, error = %err, "recovery batch exhausted");
                    for uid in batch.iter().filter(|uid| !stored.contains(uid)) {
                        report.record_failure(*uid, &err);
                    }
                    break;
                }
            }
        }
    }

    if let Some(mut active) = session {
        if let Err(err) = active.logout() {
            warn!(error = %err, "logout failed");
        }
    }
    // Every server UID is now stored, so later syncs may go incremental.
    if report.failed_messages.is_empty() {
        engine
            .store
            .set_full_sync_complete(folder, true)
            .await
            .map_err(SyncError::Store)?;
    }
    report.outcome = FolderOutcome::Completed;
    info!(
        folder,
        new = report.new,
        failed = report.failed_messages.len(),
        "recovery finished"
    );
    Ok(report)
}

/// Current session, or a fresh one whose UIDVALIDITY was checked again.
async fn reopen<'s, C: MailConnector>(
    engine: &Engine<'_>,
    connector: &C,
    session: &'s mut Option<C::Session>,
    folder: &str,
) -> SyncResult<&'s mut C::Session> {
    let active = match session.take() {
        Some(active) => active,
        None => {
            let mut fresh = connector.connect().map_err(SyncError::Connect)?;
            check_validity(engine.store, &mut fresh, folder).await?;
            fresh
        }
    };
    Ok(session.insert(active))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub candidates: usize,
    pub updated: usize,
    pub skipped_folders: Vec<String>,
}

/// Fills empty Message-IDs by re-reading headers from the server. Folders
/// whose UIDVALIDITY moved are left alone.
pub async fn backfill_message_ids<C: MailConnector>(
    store: &SqliteArchiveStore,
    connector: &C,
    enumeration_batch_size: usize,
) -> SyncResult<BackfillReport> {
    let keys = store
        .keys_missing_message_id()
        .await
        .map_err(SyncError::Store)?;
    let mut report = BackfillReport {
        candidates: keys.len(),
        ..Default::default()
    };
    if keys.is_empty() {
        return Ok(report);
    }
    info!(count = keys.len(), "records missing a message id");

    let mut by_folder: BTreeMap<String, Vec<u32>> = BTreeMap::new();
    for key in keys {
        by_folder.entry(key.folder).or_default().push(key.uid);
    }

    let mut session = connector.connect().map_err(SyncError::Connect)?;
    for (folder, uids) in by_folder {
        match backfill_folder(store, &mut session, &folder, &uids, enumeration_batch_size).await {
            Ok(updated) => report.updated += updated,
            Err(err) => {
                warn!(folder = %folder, error = %err, "skipping folder");
                report.skipped_folders.push(folder);
            }
        }
    }
    if let Err(err) = session.logout() {
        warn!(error = %err, "logout failed");
    }
    info!(updated = report.updated, "message id backfill finished");
    Ok(report)
}

async fn backfill_folder<S: MailSession>(
    store: &SqliteArchiveStore,
    session: &mut S,
    folder: &str,
    uids: &[u32],
    enumeration_batch_size: usize,
) -> SyncResult<usize> {
    verify_validity(store, session, folder).await?;
    let mut updated = 0;
    for batch in partition(uids, enumeration_batch_size) {
        let headers = session
            .fetch_headers(folder, &batch)
            .map_err(SyncError::Mail)?;
        for raw in headers {
            let Some(body) = raw.body.as_deref() else {
                continue;
            };
            let message_id = message_id_from_headers(body);
            if message_id.is_empty() {
                continue;
            }
            if store
                .set_message_id(raw.uid, folder, &message_id)
                .await
                .map_err(SyncError::Store)?
            {
                updated += 1;
            }
        }
    }
    Ok(updated)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsReport {
    pub counts: ArchiveCounts,
    pub by_year: Vec<YearCount>,
    pub folders: Vec<FolderUidValidity>,
}

pub async fn stats(store: &SqliteArchiveStore) -> Result<StatsReport> {
    Ok(StatsReport {
        counts: store.counts().await?,
        by_year: store.year_counts().await?,
        folders: store.list_uid_validities().await?,
    })
}
