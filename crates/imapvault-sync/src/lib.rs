//! Synchronization engine: UIDVALIDITY tracking, batched fetch with
//! per-message isolation, folder retry and the maintenance passes.

use imapvault_content::{AttachmentLayout, TextExtractor};
use imapvault_core::ArchiveStore;

mod batch;
mod driver;
mod error;
mod maintenance;
mod pipeline;
mod report;
mod retry;
mod settings;
mod tracker;

#[cfg(test)]
mod fake;

pub use batch::{fetch_in_batches, partition};
pub use driver::{run_sync, sync_folder};
pub use error::{SyncError, SyncResult};
pub use maintenance::{
    BackfillReport, MissingReport, NormalizeReport, StatsReport, backfill_message_ids,
    find_missing, normalize_all, recover_missing, stats,
};
pub use pipeline::{MessageOutcome, persist_message};
pub use report::{FailedMessage, FetchMode, FolderOutcome, FolderReport, MessageRef, RunReport};
pub use retry::RetryPolicy;
pub use settings::{DEFAULT_SKIP_FOLDERS, SyncSettings};
pub use tracker::{FetchPlan, check_validity, fetch_plan, verify_validity};

/// Everything a sync pass writes to, borrowed for the length of the pass.
pub struct Engine<'a> {
    pub store: &'a dyn ArchiveStore,
    pub layout: &'a AttachmentLayout,
    pub extractor: &'a dyn TextExtractor,
    pub settings: &'a SyncSettings,
}
