//! Progress accounting and the single-valued activity level.

use serde::{Deserialize, Serialize};

/// Byte progress of the pull. Change announcements grow `total`; completions
/// (including transient failures, which will be retried) grow `completed`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub completed: u64,
    pub total: u64,
}

impl Progress {
    pub fn is_complete(&self) -> bool {
        self.completed >= self.total
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityLevel {
    Stopped,
    Idle,
    Busy,
}

impl ActivityLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            ActivityLevel::Stopped => "stopped",
            ActivityLevel::Idle => "idle",
            ActivityLevel::Busy => "busy",
        }
    }
}

/// Snapshot surfaced to the parent worker whenever either field changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullStatus {
    pub level: ActivityLevel,
    pub progress: Progress,
}
