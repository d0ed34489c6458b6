use serde::{Deserialize, Serialize};

/// Tuning knobs for a [`SyncContext`](crate::SyncContext).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum number of remote requests in flight within one push wave.
    pub max_fanout: usize,
    /// Upper bound on operations attempted by a single `push()` call.
    pub max_pass_operations: usize,
    /// Page size handed to the pull fetcher.
    pub pull_page_limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_fanout: 4,
            max_pass_operations: 1000,
            pull_page_limit: 50,
        }
    }
}

impl SyncConfig {
    pub(crate) fn fanout(&self) -> usize {
        self.max_fanout.max(1)
    }
}
