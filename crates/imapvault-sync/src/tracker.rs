use imapvault_core::ArchiveStore;
use imapvault_mail::{MailSession, UidQuery};
use tracing::{info, warn};

use crate::{FetchMode, SyncError, SyncResult};

/// UIDs to fetch for a folder, already in processing order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPlan {
    pub mode: FetchMode,
    pub uids: Vec<u32>,
}

/// Compares the server's UIDVALIDITY with the stored one, recording it as
/// the baseline the first time a folder is seen.
pub async fn check_validity<S: MailSession>(
    store: &dyn ArchiveStore,
    session: &mut S,
    folder: &str,
) -> SyncResult<u32> {
    let current = verify_validity(store, session, folder).await?;
    if store
        .record_uid_validity(folder, current)
        .await
        .map_err(SyncError::Store)?
    {
        info!(folder, uidvalidity = current, "recorded UIDVALIDITY baseline");
    }
    Ok(current)
}

/// Read-only variant of [`check_validity`]: fails on a mismatch but never
/// writes a baseline.
pub async fn verify_validity<S: MailSession>(
    store: &dyn ArchiveStore,
    session: &mut S,
    folder: &str,
) -> SyncResult<u32> {
    let status = session.folder_status(folder).map_err(SyncError::Mail)?;
    let current = status.uid_validity;
    match store
        .get_uid_validity(folder)
        .await
        .map_err(SyncError::Store)?
    {
        Some(stored) if stored != current => {
            warn!(folder, stored, current, "UIDVALIDITY mismatch");
            Err(SyncError::UidValiditySkew {
                folder: folder.to_string(),
                stored,
                current,
            })
        }
        _ => Ok(current),
    }
}

/// Incremental above the highest stored UID (ascending) once a pass over
/// the folder has finished with nothing left behind. Until then the whole
/// folder is planned newest first; stored UIDs are skipped batch by batch.
pub async fn fetch_plan<S: MailSession>(
    store: &dyn ArchiveStore,
    session: &mut S,
    folder: &str,
) -> SyncResult<FetchPlan> {
    let complete = store
        .full_sync_complete(folder)
        .await
        .map_err(SyncError::Store)?;
    let max_known = if complete {
        store.max_known_uid(folder).await.map_err(SyncError::Store)?
    } else {
        None
    };
    let query = match max_known {
        Some(max) => UidQuery::GreaterThan(max),
        None => UidQuery::All,
    };
    let mut uids: Vec<u32> = session
        .search_uids(folder, &query)
        .map_err(SyncError::Mail)?
        .into_iter()
        .filter(|uid| query.matches(*uid))
        .collect();
    uids.sort_unstable();
    uids.dedup();
    let mode = match max_known {
        Some(above) => {
            info!(folder, above, count = uids.len(), "incremental fetch");
            FetchMode::Incremental { above }
        }
        None => {
            uids.reverse();
            info!(folder, count = uids.len(), "full pass, enumerating all UIDs");
            FetchMode::Full
        }
    };
    Ok(FetchPlan { mode, uids })
}
