/// Coordinator tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Read-modify-write attempts per event before a storage conflict is
    /// surfaced to the caller (default: 2).
    pub max_commit_attempts: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_commit_attempts: 2,
        }
    }
}

impl CoordinatorConfig {
    pub fn with_max_commit_attempts(max_commit_attempts: u32) -> Self {
        Self {
            max_commit_attempts,
        }
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.max_commit_attempts.max(1)
    }
}
