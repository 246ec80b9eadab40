//! Transcode task types.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::queue::ItemId;

/// Identifier for one transcode task.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Runtime state of a transcode task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for an encoder slot.
    Queued,
    /// Encoder process running.
    Running,
    /// Encoder process stopped, resumable.
    Suspended,
    /// Encoder exited successfully; output recorded.
    Complete,
    /// Encoder exited non-zero.
    Failed,
    /// Encoder cancelled; partial output removed.
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Complete | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Live tasks hold (or will hold) an encoder slot.
    pub fn is_live(&self) -> bool {
        matches!(self, TaskStatus::Running | TaskStatus::Suspended)
    }
}

/// One (item, target) encoding attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeTask {
    pub id: TaskId,
    pub item_id: ItemId,
    pub target_id: Uuid,
    pub target_label: String,
    pub output_path: PathBuf,
    pub status: TaskStatus,
    /// Completion fraction reported by the encoder, 0.0 to 1.0.
    pub progress: f32,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Complete.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Suspended.is_terminal());
    }

    #[test]
    fn test_live_statuses_hold_slots() {
        assert!(TaskStatus::Running.is_live());
        assert!(TaskStatus::Suspended.is_live());
        assert!(!TaskStatus::Queued.is_live());
        assert!(!TaskStatus::Complete.is_live());
    }
}
