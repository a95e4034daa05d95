use std::io::{self, BufRead};

use anyhow::{Result, anyhow};
use imapvault_content::{AttachmentLayout, FileTextExtractor};
use imapvault_core::SqliteArchiveStore;
use imapvault_mail::{ImapConfig, ImapConnector, MailConnector, MailSession};
use imapvault_sync::{
    Engine, SyncError, backfill_message_ids, find_missing, normalize_all, recover_missing,
    run_sync, stats,
};
use serde_json::json;
use tracing::{info, warn};

use super::{
    AppConfig, CliCommand, CredentialStore, KeyringCredentials, RunStatus, output_ok,
    resolve_password,
};

const DEFAULT_NORMALIZE_PAGE: usize = 500;

pub(crate) fn run_cli(
    rt: &tokio::runtime::Runtime,
    command: CliCommand,
    config: &AppConfig,
) -> Result<RunStatus> {
    let credentials = KeyringCredentials;
    if let CliCommand::SetPassword = command {
        return set_password(config, &credentials);
    }
    rt.block_on(dispatch(command, config, &credentials))
}

async fn dispatch(
    command: CliCommand,
    config: &AppConfig,
    credentials: &dyn CredentialStore,
) -> Result<RunStatus> {
    let store = open_store(config).await?;
    let layout = AttachmentLayout::new(&config.attachments_dir);
    let extractor = FileTextExtractor;
    let engine = Engine {
        store: &store,
        layout: &layout,
        extractor: &extractor,
        settings: &config.sync,
    };

    match command {
        CliCommand::Sync => {
            let connector = imap_connector(config, credentials)?;
            info!(host = %config.imap()?.host, "starting backup");
            let report = run_sync(&engine, &connector).await?;
            let status = RunStatus::of_run(&report);
            output_ok(serde_json::to_value(&report)?)?;
            Ok(status)
        }
        CliCommand::Normalize(cmd) => {
            let page_size = cmd.page_size.unwrap_or(DEFAULT_NORMALIZE_PAGE);
            let report = normalize_all(&store, page_size).await?;
            output_ok(serde_json::to_value(&report)?)?;
            Ok(RunStatus::Clean)
        }
        CliCommand::Missing(arg) => {
            let connector = imap_connector(config, credentials)?;
            let mut session = connector.connect().map_err(SyncError::Connect)?;
            let result = find_missing(
                &store,
                &mut session,
                &arg.folder,
                config.sync.enumeration_batch_size,
            )
            .await;
            if let Err(err) = session.logout() {
                warn!(error = %err, "logout failed");
            }
            output_ok(serde_json::to_value(&result?)?)?;
            Ok(RunStatus::Clean)
        }
        CliCommand::Recover(arg) => {
            let connector = imap_connector(config, credentials)?;
            let report = recover_missing(&engine, &connector, &arg.folder).await?;
            let status = if report.failed_messages.is_empty() {
                RunStatus::Clean
            } else {
                RunStatus::PermanentFailures
            };
            output_ok(serde_json::to_value(&report)?)?;
            Ok(status)
        }
        CliCommand::BackfillMessageIds => {
            let connector = imap_connector(config, credentials)?;
            let report =
                backfill_message_ids(&store, &connector, config.sync.enumeration_batch_size)
                    .await?;
            let status = if report.skipped_folders.is_empty() {
                RunStatus::Clean
            } else {
                RunStatus::PermanentFailures
            };
            output_ok(serde_json::to_value(&report)?)?;
            Ok(status)
        }
        CliCommand::Stats => {
            let report = stats(&store).await?;
            output_ok(serde_json::to_value(&report)?)?;
            Ok(RunStatus::Clean)
        }
        CliCommand::SetPassword => Err(anyhow!("set-password does not use the archive")),
    }
}

async fn open_store(config: &AppConfig) -> Result<SqliteArchiveStore> {
    let path = config.db_path.to_string_lossy();
    let store = SqliteArchiveStore::connect(&path).await?;
    store.init().await?;
    Ok(store)
}

fn imap_connector(config: &AppConfig, credentials: &dyn CredentialStore) -> Result<ImapConnector> {
    let imap = config.imap()?;
    let password = resolve_password(
        imap.password.as_deref(),
        credentials,
        &config.credential_service,
        &imap.username,
    )?;
    Ok(ImapConnector::new(ImapConfig {
        host: imap.host.clone(),
        port: imap.port,
        username: imap.username.clone(),
        password,
        skip_tls_verify: imap.skip_tls_verify,
    }))
}

fn set_password(config: &AppConfig, credentials: &dyn CredentialStore) -> Result<RunStatus> {
    let imap = config.imap()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let secret = line.trim_end_matches(['\r', '\n']);
    if secret.is_empty() {
        return Err(anyhow!("no password on stdin"));
    }
    credentials.set(&config.credential_service, &imap.username, secret)?;
    output_ok(json!({
        "service": config.credential_service,
        "account": imap.username,
    }))?;
    Ok(RunStatus::Clean)
}
