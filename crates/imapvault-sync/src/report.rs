use serde::Serialize;

use crate::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedMessage {
    pub folder: String,
    pub uid: u32,
    pub error: String,
    /// Whether the error class may clear up on a fresh connection.
    pub retryable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageRef {
    pub folder: String,
    pub uid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FetchMode {
    Full,
    Incremental { above: u32 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderOutcome {
    #[default]
    Pending,
    Completed,
    Failed,
    Aborted,
}

/// Result of one folder pass. Counters describe the last attempt, except
/// `new` which accumulates across attempts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FolderReport {
    pub folder: String,
    pub uid_validity: Option<u32>,
    pub mode: Option<FetchMode>,
    pub attempts: u32,
    pub fetched: usize,
    pub new: usize,
    pub already_present: usize,
    pub skipped_batches: usize,
    pub failed_messages: Vec<FailedMessage>,
    pub outcome: FolderOutcome,
    pub error: Option<String>,
}

impl FolderReport {
    pub fn new(folder: &str) -> Self {
        Self {
            folder: folder.to_string(),
            ..Default::default()
        }
    }

    pub(crate) fn begin_attempt(&mut self) {
        self.attempts += 1;
        self.fetched = 0;
        self.already_present = 0;
        self.skipped_batches = 0;
        self.failed_messages.clear();
        self.error = None;
    }

    pub(crate) fn record_failure(&mut self, uid: u32, error: &SyncError) {
        self.failed_messages.push(FailedMessage {
            folder: self.folder.clone(),
            uid,
            error: error.to_string(),
            retryable: error.is_retryable(),
        });
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub folders: Vec<FolderReport>,
    pub skipped_folders: Vec<String>,
    pub failed_folders: Vec<String>,
    pub recovered_messages: Vec<MessageRef>,
    pub failed_messages: Vec<FailedMessage>,
    pub aborted: Option<String>,
}

impl RunReport {
    pub fn folder(&self, name: &str) -> Option<&FolderReport> {
        self.folders.iter().find(|f| f.folder == name)
    }

    pub fn new_messages(&self) -> usize {
        self.folders.iter().map(|f| f.new).sum()
    }

    pub fn has_permanent_failures(&self) -> bool {
        !self.failed_folders.is_empty() || !self.failed_messages.is_empty()
    }

    pub fn is_clean(&self) -> bool {
        self.aborted.is_none() && !self.has_permanent_failures()
    }
}
