use std::collections::BTreeSet;

use anyhow::anyhow;
use imapvault_mail::{MailConnector, MailSession};
use tracing::{error, info, warn};

use crate::batch::fetch_in_batches;
use crate::pipeline::persist_message;
use crate::tracker::{check_validity, fetch_plan};
use crate::{
    Engine, FailedMessage, FolderOutcome, FolderReport, MessageRef, RunReport,
    SyncError, SyncResult,
};

/// Full backup run over every folder the server lists.
///
/// Only a failed initial connection is returned as an error. Everything
/// else, including a UIDVALIDITY skew, is described by the report.
pub async fn run_sync<C: MailConnector>(engine: &Engine<'_>, connector: &C) -> SyncResult<RunReport> {
    let mut first = connector.connect().map_err(SyncError::Connect)?;
    let folders = match first.list_folders() {
        Ok(folders) => folders,
        Err(err) => {
            if let Err(logout_err) = first.logout() {
                warn!(error = %logout_err, "logout failed");
            }
            return Err(SyncError::Mail(err));
        }
    };
    let mut session = Some(first);
    info!(count = folders.len(), "found folders");

    let mut report = RunReport::default();
    for folder in &folders {
        if engine.settings.is_skipped(folder) {
            info!(folder = %folder, "skipping folder");
            report.skipped_folders.push(folder.clone());
            continue;
        }
        let folder_report = sync_folder(engine, connector, &mut session, folder).await;
        let outcome = folder_report.outcome;
        let abort_reason = folder_report.error.clone();
        report.folders.push(folder_report);
        match outcome {
            FolderOutcome::Aborted => {
                report.aborted = abort_reason;
                error!(folder = %folder, "backup halted");
                break;
            }
            FolderOutcome::Failed => report.failed_folders.push(folder.clone()),
            FolderOutcome::Completed | FolderOutcome::Pending => {}
        }
    }

    if let Some(mut session) = session.take() {
        if let Err(err) = session.logout() {
            warn!(error = %err, "logout failed");
        }
    }

    if report.aborted.is_none() {
        retry_failed_messages(engine, connector, &mut report).await;
    }
    if !report.failed_folders.is_empty() {
        warn!(folders = ?report.failed_folders, "folders failed after all retry attempts");
    }
    info!(
        new = report.new_messages(),
        failed_folders = report.failed_folders.len(),
        failed_messages = report.failed_messages.len(),
        "backup run finished"
    );
    Ok(report)
}

/// Runs folder attempts under the folder retry policy. The session is
/// dropped after a failed attempt and reopened before the next one.
pub async fn sync_folder<C: MailConnector>(
    engine: &Engine<'_>,
    connector: &C,
    session: &mut Option<C::Session>,
    folder: &str,
) -> FolderReport {
    let policy = engine.settings.folder_retry;
    let mut report = FolderReport::new(folder);
    loop {
        report.begin_attempt();
        let attempt = report.attempts;
        info!(folder, attempt, "processing folder");

        let result = match ensure_session(connector, session) {
            Ok(active) => sync_folder_attempt(engine, active, folder, &mut report).await,
            Err(err) => Err(err),
        };

        let err = match result {
            Ok(()) => {
                report.outcome = FolderOutcome::Completed;
                info!(
                    folder,
                    fetched = report.fetched,
                    new = report.new,
                    already_present = report.already_present,
                    failed = report.failed_messages.len(),
                    "finished folder"
                );
                return report;
            }
            Err(err) => err,
        };

        report.error = Some(err.to_string());
        if err.is_fatal() {
            report.outcome = FolderOutcome::Aborted;
            error!(folder, error = %err, "aborting backup");
            return report;
        }
        warn!(folder, attempt, error = %err, "folder attempt failed");
        *session = None;
        match policy.next_delay(attempt, &err) {
            Some(delay) => tokio::time::sleep(delay).await,
            None => {
                report.outcome = FolderOutcome::Failed;
                error!(folder, attempts = attempt, "folder failed after retries");
                return report;
            }
        }
    }
}

fn ensure_session<'s, C: MailConnector>(
    connector: &C,
    session: &'s mut Option<C::Session>,
) -> SyncResult<&'s mut C::Session> {
    let active = match session.take() {
        Some(active) => active,
        None => connector.connect().map_err(SyncError::Connect)?,
    };
    Ok(session.insert(active))
}

async fn sync_folder_attempt<S: MailSession>(
    engine: &Engine<'_>,
    session: &mut S,
    folder: &str,
    report: &mut FolderReport,
) -> SyncResult<()> {
    report.uid_validity = Some(check_validity(engine.store, session, folder).await?);
    let plan = fetch_plan(engine.store, session, folder).await?;
    // Cleared while the pass runs so that an attempt cut short, in this run
    // or by a killed process, is planned as a full pass next time.
    engine
        .store
        .set_full_sync_complete(folder, false)
        .await
        .map_err(SyncError::Store)?;
    report.mode = Some(plan.mode);
    report.fetched = plan.uids.len();
    fetch_in_batches(
        engine,
        session,
        folder,
        &plan.uids,
        engine.settings.batch_size,
        report,
    )
    .await?;
    // Messages that failed here sit below UIDs that were stored; only a
    // clean pass may let the next run start above the newest UID.
    if report.failed_messages.is_empty() {
        engine
            .store
            .set_full_sync_complete(folder, true)
            .await
            .map_err(SyncError::Store)?;
    }
    Ok(())
}

/// Retries the messages that failed during completed folders under the
/// message retry policy. A folder whose failures were all recovered counts
/// as fully synced.
async fn retry_failed_messages<C: MailConnector>(
    engine: &Engine<'_>,
    connector: &C,
    report: &mut RunReport,
) {
    let queued: Vec<FailedMessage> = report
        .folders
        .iter()
        .filter(|f| f.outcome == FolderOutcome::Completed)
        .flat_map(|f| f.failed_messages.iter().cloned())
        .collect();
    if queued.is_empty() {
        return;
    }
    info!(count = queued.len(), "retrying failed messages");

    let mut touched = BTreeSet::new();
    let mut incomplete = BTreeSet::new();
    for failed in queued {
        touched.insert(failed.folder.clone());
        match retry_message(engine, connector, &failed).await {
            Ok(attempts) => {
                info!(uid = failed.uid, folder = %failed.folder, attempts, "retry successful");
                report.recovered_messages.push(MessageRef {
                    folder: failed.folder,
                    uid: failed.uid,
                });
            }
            Err(still_failed) => {
                incomplete.insert(still_failed.folder.clone());
                report.failed_messages.push(still_failed);
            }
        }
    }

    for folder in touched.difference(&incomplete) {
        if let Err(err) = engine.store.set_full_sync_complete(folder, true).await {
            warn!(folder = %folder, error = %err, "could not mark folder as fully synced");
        }
    }
}

/// Runs further attempts for one queued message while the policy allows.
/// The failure recorded during the folder pass is attempt one. Returns the
/// attempt that succeeded, or the last failure.
async fn retry_message<C: MailConnector>(
    engine: &Engine<'_>,
    connector: &C,
    failed: &FailedMessage,
) -> Result<u32, FailedMessage> {
    let policy = engine.settings.message_retry;
    let mut last = failed.clone();
    let mut attempt = 1;
    while let Some(delay) = policy.delay_after(attempt, last.retryable) {
        tokio::time::sleep(delay).await;
        attempt += 1;
        match refetch_on_fresh_session(engine, connector, failed).await {
            Ok(()) => return Ok(attempt),
            Err(err) => {
                error!(uid = failed.uid, folder = %failed.folder, attempt, error = %err, "retry failed again");
                last = FailedMessage {
                    error: err.to_string(),
                    retryable: err.is_retryable(),
                    ..failed.clone()
                };
            }
        }
    }
    Err(last)
}

async fn refetch_on_fresh_session<C: MailConnector>(
    engine: &Engine<'_>,
    connector: &C,
    failed: &FailedMessage,
) -> SyncResult<()> {
    let mut session = connector.connect().map_err(SyncError::Connect)?;
    let result = refetch_message(engine, &mut session, failed).await;
    if let Err(err) = session.logout() {
        warn!(error = %err, "logout failed");
    }
    result
}

async fn refetch_message<S: MailSession>(
    engine: &Engine<'_>,
    session: &mut S,
    failed: &FailedMessage,
) -> SyncResult<()> {
    check_validity(engine.store, session, &failed.folder).await?;
    let fetched = session
        .fetch(&failed.folder, &[failed.uid])
        .map_err(SyncError::Mail)?;
    let raw = fetched
        .iter()
        .find(|raw| raw.uid == failed.uid)
        .ok_or_else(|| SyncError::Mail(anyhow!("server returned nothing for uid {}", failed.uid)))?;
    persist_message(engine, &failed.folder, raw).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use imapvault_core::ArchiveStore;

    use std::time::Duration;

    use super::run_sync;
    use crate::fake::{FakeMail, Harness, sample_message};
    use crate::{FetchMode, FolderOutcome, RetryPolicy, SyncError};

    #[tokio::test]
    async fn second_run_over_unchanged_mailbox_changes_nothing() -> anyhow::Result<()> {
        let harness = Harness::new().await?;
        let engine = harness.engine();
        let mail = FakeMail::default();
        mail.add_folder("INBOX", 7, 1..=25);
        mail.add_folder("Sent", 8, 1..=4);

        let first = run_sync(&engine, &mail).await?;
        assert!(first.is_clean());
        assert_eq!(first.new_messages(), 29);
        let counts = harness.store.counts().await?;

        let second = run_sync(&engine, &mail).await?;
        assert!(second.is_clean());
        assert_eq!(second.new_messages(), 0);
        assert_eq!(harness.store.counts().await?, counts);
        assert_eq!(counts.downloaded, 29);
        assert_eq!(counts.messages, 29);
        assert_eq!(counts.folders, 2);
        Ok(())
    }

    #[tokio::test]
    async fn uidvalidity_change_halts_the_run_without_writes() -> anyhow::Result<()> {
        let harness = Harness::new().await?;
        let engine = harness.engine();
        let mail = FakeMail::default();
        mail.add_folder("INBOX", 100, 1..=3);
        mail.add_folder("Sent", 5, 1..=2);
        run_sync(&engine, &mail).await?;

        mail.with_folder("INBOX", |f| {
            f.uid_validity = 200;
            f.messages.insert(4, Vec::new());
        });
        mail.with_folder("Sent", |f| {
            f.messages.insert(3, Vec::new());
        });
        let fetches_before = mail.fetch_calls("INBOX") + mail.fetch_calls("Sent");
        let counts_before = harness.store.counts().await?;

        let report = run_sync(&engine, &mail).await?;
        let aborted = report.aborted.as_deref().unwrap_or_default();
        assert!(aborted.contains("stored 100, server reports 200"));
        assert_eq!(report.folders.len(), 1);
        assert_eq!(report.folders[0].outcome, FolderOutcome::Aborted);
        assert_eq!(report.folders[0].attempts, 1);
        assert!(report.folder("Sent").is_none());
        assert_eq!(harness.store.counts().await?, counts_before);
        assert_eq!(harness.store.get_uid_validity("INBOX").await?, Some(100));
        assert_eq!(mail.fetch_calls("INBOX") + mail.fetch_calls("Sent"), fetches_before);
        assert!(!harness.store.exists(3, "Sent").await?);
        Ok(())
    }

    #[tokio::test]
    async fn incremental_fetch_only_requests_new_uids() -> anyhow::Result<()> {
        let harness = Harness::new().await?;
        let engine = harness.engine();
        let mail = FakeMail::default();
        mail.add_folder("Sent", 3, 1..=50);
        run_sync(&engine, &mail).await?;
        assert_eq!(harness.store.max_known_uid("Sent").await?, Some(50));
        let already_fetched = mail.fetched_uids("Sent").len();

        mail.with_folder("Sent", |f| {
            for uid in 51..=53 {
                f.messages.insert(uid, crate::fake::sample_message(uid, "Sent"));
            }
        });
        let report = run_sync(&engine, &mail).await?;
        let sent = report.folder("Sent").expect("Sent processed");
        assert_eq!(sent.mode, Some(FetchMode::Incremental { above: 50 }));
        assert_eq!(sent.fetched, 3);
        assert_eq!(sent.new, 3);
        assert_eq!(mail.fetched_uids("Sent")[already_fetched..], [51, 52, 53]);
        assert_eq!(harness.store.max_known_uid("Sent").await?, Some(53));
        assert_eq!(harness.store.counts().await?.downloaded, 53);
        Ok(())
    }

    #[tokio::test]
    async fn exhausted_folder_does_not_block_later_folders() -> anyhow::Result<()> {
        let harness = Harness::new().await?;
        let engine = harness.engine();
        let mail = FakeMail::default();
        mail.add_folder("Archive", 1, 1..=3);
        mail.add_folder("INBOX", 2, 1..=3);
        mail.with_folder("Archive", |f| f.failing_fetches = u32::MAX);

        let report = run_sync(&engine, &mail).await?;
        let archive = report.folder("Archive").expect("Archive processed");
        assert_eq!(archive.outcome, FolderOutcome::Failed);
        assert_eq!(archive.attempts, 3);
        assert_eq!(report.failed_folders, vec!["Archive".to_string()]);
        assert_eq!(report.folder("INBOX").map(|f| f.new), Some(3));
        assert!(report.has_permanent_failures());
        // initial session, a reconnect per Archive retry, then one for INBOX
        assert_eq!(mail.connects(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn folder_recovers_on_a_later_attempt() -> anyhow::Result<()> {
        let harness = Harness::new().await?;
        let engine = harness.engine();
        let mail = FakeMail::default();
        mail.add_folder("INBOX", 1, 1..=12);
        mail.with_folder("INBOX", |f| f.failing_fetches = 1);

        let report = run_sync(&engine, &mail).await?;
        let inbox = report.folder("INBOX").expect("INBOX processed");
        assert_eq!(inbox.outcome, FolderOutcome::Completed);
        assert_eq!(inbox.attempts, 2);
        assert_eq!(inbox.new, 12);
        assert!(report.is_clean());
        Ok(())
    }

    #[tokio::test]
    async fn interrupted_full_pass_stays_full_on_retry() -> anyhow::Result<()> {
        let harness = Harness::new().await?;
        let engine = harness.engine();
        let mail = FakeMail::default();
        mail.add_folder("INBOX", 1, 1..=12);
        mail.with_folder("INBOX", |f| {
            f.fail_fetch_calls.insert(2);
        });

        let report = run_sync(&engine, &mail).await?;
        let inbox = report.folder("INBOX").expect("INBOX processed");
        assert_eq!(inbox.attempts, 2);
        assert_eq!(inbox.mode, Some(FetchMode::Full));
        assert_eq!(inbox.new, 12);
        assert_eq!(inbox.skipped_batches, 1);
        assert_eq!(harness.store.counts().await?.downloaded, 12);
        Ok(())
    }

    #[tokio::test]
    async fn partial_full_pass_is_resumed_by_the_next_run() -> anyhow::Result<()> {
        let harness = Harness::new().await?;
        let engine = harness.engine();
        let mail = FakeMail::default();
        mail.add_folder("INBOX", 1, 1..=25);
        mail.with_folder("INBOX", |f| {
            f.fail_fetch_calls.extend([2, 3, 4]);
        });

        let first = run_sync(&engine, &mail).await?;
        assert_eq!(first.failed_folders, vec!["INBOX".to_string()]);
        assert_eq!(harness.store.counts().await?.downloaded, 10);
        assert!(!harness.store.full_sync_complete("INBOX").await?);

        let second = run_sync(&engine, &mail).await?;
        assert!(second.is_clean());
        let inbox = second.folder("INBOX").expect("INBOX processed");
        assert_eq!(inbox.mode, Some(FetchMode::Full));
        assert_eq!(inbox.new, 15);
        assert_eq!(inbox.skipped_batches, 1);
        assert!(harness.store.exists(1, "INBOX").await?);
        assert_eq!(harness.store.counts().await?.downloaded, 25);
        assert!(harness.store.full_sync_complete("INBOX").await?);

        mail.with_folder("INBOX", |f| {
            f.messages.insert(26, sample_message(26, "INBOX"));
        });
        let third = run_sync(&engine, &mail).await?;
        let inbox = third.folder("INBOX").expect("INBOX processed");
        assert_eq!(inbox.mode, Some(FetchMode::Incremental { above: 25 }));
        assert_eq!(inbox.new, 1);
        Ok(())
    }

    #[tokio::test]
    async fn permanently_failed_message_is_picked_up_by_a_later_run() -> anyhow::Result<()> {
        let harness = Harness::new().await?;
        let engine = harness.engine();
        let mail = FakeMail::default();
        mail.add_folder("INBOX", 1, 1..=5);
        mail.with_folder("INBOX", |f| {
            f.broken.insert(3);
        });

        let first = run_sync(&engine, &mail).await?;
        assert_eq!(first.failed_messages.len(), 1);
        assert!(!harness.store.full_sync_complete("INBOX").await?);

        mail.with_folder("INBOX", |f| {
            f.broken.clear();
            f.messages.insert(6, sample_message(6, "INBOX"));
        });
        let second = run_sync(&engine, &mail).await?;
        assert!(second.is_clean());
        let inbox = second.folder("INBOX").expect("INBOX processed");
        assert_eq!(inbox.mode, Some(FetchMode::Full));
        assert_eq!(inbox.new, 2);
        assert!(harness.store.exists(3, "INBOX").await?);
        assert!(harness.store.full_sync_complete("INBOX").await?);
        Ok(())
    }

    #[tokio::test]
    async fn end_of_run_retry_follows_the_message_policy() -> anyhow::Result<()> {
        let mut harness = Harness::new().await?;
        harness.settings.message_retry = RetryPolicy::new(1, Duration::ZERO);
        let engine = harness.engine();
        let mail = FakeMail::default();
        mail.add_folder("INBOX", 1, 1..=3);
        mail.with_folder("INBOX", |f| {
            f.flaky.insert(2, 1);
        });

        let report = run_sync(&engine, &mail).await?;
        assert!(report.recovered_messages.is_empty());
        assert_eq!(report.failed_messages.len(), 1);
        assert_eq!(report.failed_messages[0].uid, 2);
        assert!(report.failed_messages[0].retryable);
        // no fresh connection and no second fetch for the queued message
        assert_eq!(mail.connects(), 1);
        assert_eq!(mail.fetch_calls("INBOX"), 1);
        assert!(!harness.store.exists(2, "INBOX").await?);
        assert!(!harness.store.full_sync_complete("INBOX").await?);
        Ok(())
    }

    #[tokio::test]
    async fn recovering_every_failure_marks_the_folder_complete() -> anyhow::Result<()> {
        let harness = Harness::new().await?;
        let engine = harness.engine();
        let mail = FakeMail::default();
        mail.add_folder("INBOX", 1, 1..=3);
        mail.with_folder("INBOX", |f| {
            f.flaky.insert(2, 1);
        });

        let report = run_sync(&engine, &mail).await?;
        assert!(report.is_clean());
        assert_eq!(report.recovered_messages.len(), 1);
        assert_eq!(mail.connects(), 2);
        assert!(harness.store.full_sync_complete("INBOX").await?);
        Ok(())
    }

    #[tokio::test]
    async fn flaky_message_is_recovered_by_the_end_of_run_retry() -> anyhow::Result<()> {
        let harness = Harness::new().await?;
        let engine = harness.engine();
        let mail = FakeMail::default();
        mail.add_folder("INBOX", 1, 1..=5);
        mail.with_folder("INBOX", |f| {
            f.flaky.insert(2, 1);
            f.broken.insert(4);
        });

        let report = run_sync(&engine, &mail).await?;
        assert_eq!(report.folder("INBOX").map(|f| f.new), Some(3));
        assert_eq!(report.recovered_messages.len(), 1);
        assert_eq!(report.recovered_messages[0].uid, 2);
        assert_eq!(report.failed_messages.len(), 1);
        assert_eq!(report.failed_messages[0].uid, 4);
        assert!(harness.store.exists(2, "INBOX").await?);
        assert!(!harness.store.exists(4, "INBOX").await?);
        assert!(!report.is_clean());
        assert!(!harness.store.full_sync_complete("INBOX").await?);
        Ok(())
    }

    #[tokio::test]
    async fn denylisted_folders_are_skipped() -> anyhow::Result<()> {
        let harness = Harness::new().await?;
        let engine = harness.engine();
        let mail = FakeMail::default();
        mail.add_folder("INBOX", 1, [1]);
        mail.add_folder("[Gmail]/Spam", 1, [1]);
        let report = run_sync(&engine, &mail).await?;
        assert_eq!(report.skipped_folders, vec!["[Gmail]/Spam".to_string()]);
        assert_eq!(mail.fetch_calls("[Gmail]/Spam"), 0);
        assert_eq!(harness.store.get_uid_validity("[Gmail]/Spam").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn initial_connection_failure_is_fatal() -> anyhow::Result<()> {
        let harness = Harness::new().await?;
        let engine = harness.engine();
        let mail = FakeMail::default();
        mail.add_folder("INBOX", 1, [1]);
        mail.state.borrow_mut().failing_connects = 1;
        let err = run_sync(&engine, &mail).await.unwrap_err();
        assert!(matches!(err, SyncError::Connect(_)));
        assert_eq!(harness.store.counts().await?.downloaded, 0);
        Ok(())
    }

    #[tokio::test]
    async fn failed_folder_listing_still_logs_out() -> anyhow::Result<()> {
        let harness = Harness::new().await?;
        let engine = harness.engine();
        let mail = FakeMail::default();
        mail.add_folder("INBOX", 1, [1]);
        mail.state.borrow_mut().failing_lists = 1;
        let err = run_sync(&engine, &mail).await.unwrap_err();
        assert!(matches!(err, SyncError::Mail(_)));
        assert_eq!(mail.connects(), 1);
        assert_eq!(mail.state.borrow().logouts, 1);
        Ok(())
    }
}
