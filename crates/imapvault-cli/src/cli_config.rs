use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use imapvault_sync::{RetryPolicy, SyncSettings};

use super::{DB_ENV, config_path_candidates};

const DEFAULT_DB_PATH: &str = "email_tracking.db";
const DEFAULT_ATTACHMENTS_DIR: &str = "email_attachments";
const DEFAULT_CREDENTIAL_SERVICE: &str = "imap_email_backup";
const DEFAULT_IMAP_PORT: u16 = 993;

#[derive(Debug, Clone)]
pub(crate) struct ImapAccount {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) username: String,
    pub(crate) password: Option<String>,
    pub(crate) skip_tls_verify: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct AppConfig {
    pub(crate) imap: Option<ImapAccount>,
    pub(crate) db_path: PathBuf,
    pub(crate) attachments_dir: PathBuf,
    pub(crate) sync: SyncSettings,
    pub(crate) credential_service: String,
}

impl AppConfig {
    pub(crate) fn imap(&self) -> Result<&ImapAccount> {
        self.imap
            .as_ref()
            .ok_or_else(|| anyhow!("missing [imap] section with host and username"))
    }
}

/// Reads the config from `explicit`, or from the first default candidate
/// that exists. No file at all yields the defaults, without IMAP settings.
pub(crate) fn load_app_config(explicit: Option<&Path>) -> Result<AppConfig> {
    let db_override = std::env::var(DB_ENV).ok().filter(|v| !v.trim().is_empty());
    let text = match explicit {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?,
        ),
        None => load_config_text()?,
    };
    parse_app_config(text.as_deref().unwrap_or(""), db_override.as_deref())
}

fn load_config_text() -> Result<Option<String>> {
    for path in config_path_candidates() {
        if path.exists() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            return Ok(Some(text));
        }
    }
    Ok(None)
}

pub(crate) fn parse_app_config(text: &str, db_override: Option<&str>) -> Result<AppConfig> {
    let value: toml::Value = toml::from_str(text).context("invalid imapvault.toml")?;

    let imap = value.get("imap").map(parse_imap_table).transpose()?;

    let archive = value.get("archive");
    let db_path = db_override
        .map(str::to_string)
        .or_else(|| archive.and_then(|a| parse_string(a, "db_path")))
        .unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
    let attachments_dir = archive
        .and_then(|a| parse_string(a, "attachments_dir"))
        .unwrap_or_else(|| DEFAULT_ATTACHMENTS_DIR.to_string());

    let mut sync = SyncSettings::default();
    if let Some(skip) = archive.and_then(|a| parse_string_list(a, "skip_folders")) {
        sync.skip_folders = skip;
    }
    if let Some(table) = value.get("sync") {
        apply_sync_table(table, &mut sync)?;
    }

    let credential_service = value
        .get("credentials")
        .and_then(|c| parse_string(c, "service"))
        .unwrap_or_else(|| DEFAULT_CREDENTIAL_SERVICE.to_string());

    Ok(AppConfig {
        imap,
        db_path: PathBuf::from(db_path),
        attachments_dir: PathBuf::from(attachments_dir),
        sync,
        credential_service,
    })
}

fn parse_imap_table(table: &toml::Value) -> Result<ImapAccount> {
    let host = parse_string(table, "host").ok_or_else(|| anyhow!("[imap] host is required"))?;
    let username =
        parse_string(table, "username").ok_or_else(|| anyhow!("[imap] username is required"))?;
    let port = match table.get("port").and_then(|v| v.as_integer()) {
        Some(port) => u16::try_from(port).with_context(|| format!("invalid [imap] port {}", port))?,
        None => DEFAULT_IMAP_PORT,
    };
    Ok(ImapAccount {
        host,
        port,
        username,
        password: parse_string(table, "password"),
        skip_tls_verify: table
            .get("skip_tls_verify")
            .and_then(parse_bool)
            .unwrap_or(false),
    })
}

fn apply_sync_table(table: &toml::Value, sync: &mut SyncSettings) -> Result<()> {
    if let Some(size) = parse_count(table, "batch_size")? {
        sync.batch_size = size;
    }
    if let Some(size) = parse_count(table, "recovery_batch_size")? {
        sync.recovery_batch_size = size;
    }
    if let Some(size) = parse_count(table, "enumeration_batch_size")? {
        sync.enumeration_batch_size = size;
    }
    let limit = parse_count(table, "folder_retry_limit")?;
    let backoff = parse_count(table, "folder_retry_backoff_secs")?;
    if limit.is_some() || backoff.is_some() {
        let current = sync.folder_retry;
        let max_attempts = match limit {
            Some(limit) => u32::try_from(limit)
                .with_context(|| format!("[sync] folder_retry_limit {} is too large", limit))?,
            None => current.max_attempts,
        };
        let backoff = match backoff {
            Some(secs) => Duration::from_secs(
                u64::try_from(secs)
                    .with_context(|| format!("[sync] folder_retry_backoff_secs {} is too large", secs))?,
            ),
            None => current.backoff,
        };
        sync.folder_retry = RetryPolicy::new(max_attempts, backoff);
    }
    Ok(())
}

/// Non-negative integer key. Batch sizes of zero are rejected.
fn parse_count(table: &toml::Value, key: &str) -> Result<Option<usize>> {
    let Some(value) = table.get(key) else {
        return Ok(None);
    };
    let raw = value
        .as_integer()
        .ok_or_else(|| anyhow!("[sync] {} must be an integer", key))?;
    let count = usize::try_from(raw).with_context(|| format!("[sync] {} must not be negative", key))?;
    if count == 0 && key.ends_with("batch_size") {
        return Err(anyhow!("[sync] {} must be at least 1", key));
    }
    Ok(Some(count))
}

fn parse_string(table: &toml::Value, key: &str) -> Option<String> {
    table
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn parse_string_list(value: &toml::Value, key: &str) -> Option<Vec<String>> {
    let list = value.get(key)?.as_array()?;
    let mut out = Vec::new();
    for item in list {
        if let Some(s) = item.as_str() {
            out.push(s.to_string());
        }
    }
    Some(out)
}

fn parse_bool(value: &toml::Value) -> Option<bool> {
    value.as_bool().or_else(|| {
        value
            .as_str()
            .map(|s| s == "1" || s.eq_ignore_ascii_case("true"))
    })
}
