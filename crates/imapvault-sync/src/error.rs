use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("UIDVALIDITY changed for folder '{folder}': stored {stored}, server reports {current}")]
    UidValiditySkew {
        folder: String,
        stored: u32,
        current: u32,
    },
    #[error("connection failed: {0:#}")]
    Connect(anyhow::Error),
    #[error("mail server error: {0:#}")]
    Mail(anyhow::Error),
    #[error("archive store error: {0:#}")]
    Store(anyhow::Error),
}

impl SyncError {
    /// Connection and protocol failures may clear up on a fresh session.
    /// A UID renumbering never does, and a failing local store is not
    /// helped by reconnecting to the server.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Connect(_) | SyncError::Mail(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::UidValiditySkew { .. })
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
