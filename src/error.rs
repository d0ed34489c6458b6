use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("invalid operation on {table}/{item_id}: {reason}")]
    InvalidOperation {
        table: String,
        item_id: String,
        reason: &'static str,
    },
    #[error("a push is already in progress")]
    PushInProgress,
    #[error("local store: {0}")]
    Store(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl SyncError {
    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        SyncError::InvalidState(msg.into())
    }

    /// True for the §7 InvalidState condition (already handled / operation gone).
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, SyncError::InvalidState(_))
    }
}
