use std::collections::HashSet;

use anyhow::anyhow;
use imapvault_mail::MailSession;
use tracing::{debug, error, info};

use crate::pipeline::{MessageOutcome, persist_message};
use crate::{Engine, FolderReport, SyncError, SyncResult};

/// Splits `uids` into consecutive chunks of at most `size`, keeping order.
pub fn partition(uids: &[u32], size: usize) -> Vec<Vec<u32>> {
    uids.chunks(size.max(1)).map(|chunk| chunk.to_vec()).collect()
}

/// Fetches and persists `uids` batch by batch. A failed batch fetch ends the
/// pass with an error; a failed message is recorded on the report and its
/// siblings carry on.
pub async fn fetch_in_batches<S: MailSession>(
    engine: &Engine<'_>,
    session: &mut S,
    folder: &str,
    uids: &[u32],
    batch_size: usize,
    report: &mut FolderReport,
) -> SyncResult<()> {
    let mut stored = engine
        .store
        .stored_uids(folder)
        .await
        .map_err(SyncError::Store)?;
    for batch in partition(uids, batch_size) {
        fetch_batch(engine, session, folder, &batch, &mut stored, report).await?;
    }
    Ok(())
}

pub(crate) async fn fetch_batch<S: MailSession>(
    engine: &Engine<'_>,
    session: &mut S,
    folder: &str,
    batch: &[u32],
    stored: &mut HashSet<u32>,
    report: &mut FolderReport,
) -> SyncResult<()> {
    if batch.iter().all(|uid| stored.contains(uid)) {
        debug!(folder, size = batch.len(), "skipping batch, all UIDs already stored");
        report.skipped_batches += 1;
        report.already_present += batch.len();
        return Ok(());
    }

    let pending: Vec<u32> = batch
        .iter()
        .copied()
        .filter(|uid| !stored.contains(uid))
        .collect();
    report.already_present += batch.len() - pending.len();

    let fetched = session.fetch(folder, &pending).map_err(SyncError::Mail)?;
    for uid in pending {
        let Some(raw) = fetched.iter().find(|raw| raw.uid == uid) else {
            let err = SyncError::Mail(anyhow!("server returned nothing for uid {}", uid));
            error!(uid, folder, error = %err, "message missing from batch");
            report.record_failure(uid, &err);
            continue;
        };
        match persist_message(engine, folder, raw).await {
            Ok(MessageOutcome::Stored) => {
                stored.insert(uid);
                report.new += 1;
            }
            Ok(MessageOutcome::AlreadyPresent) => {
                stored.insert(uid);
                report.already_present += 1;
            }
            Err(err) => {
                error!(uid, folder, error = %err, "error processing message");
                report.record_failure(uid, &err);
            }
        }
    }
    info!(
        folder,
        size = batch.len(),
        new = report.new,
        failed = report.failed_messages.len(),
        "batch done"
    );
    Ok(())
}
