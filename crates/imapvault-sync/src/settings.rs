use serde::Serialize;

use crate::RetryPolicy;

pub const DEFAULT_SKIP_FOLDERS: [&str; 6] = [
    "[gmail]/spam",
    "[gmail]/trash",
    "inbox.spam",
    "inbox.trash",
    "junk",
    "trash",
];

#[derive(Debug, Clone, Serialize)]
pub struct SyncSettings {
    pub batch_size: usize,
    pub recovery_batch_size: usize,
    pub enumeration_batch_size: usize,
    pub folder_retry: RetryPolicy,
    pub message_retry: RetryPolicy,
    pub skip_folders: Vec<String>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            recovery_batch_size: 20,
            enumeration_batch_size: 500,
            folder_retry: RetryPolicy::folder_default(),
            message_retry: RetryPolicy::message_default(),
            skip_folders: DEFAULT_SKIP_FOLDERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl SyncSettings {
    pub fn is_skipped(&self, folder: &str) -> bool {
        let folder = folder.to_lowercase();
        self.skip_folders
            .iter()
            .any(|skip| skip.to_lowercase() == folder)
    }
}
