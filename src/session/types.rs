use crate::fetch::DrainReport;
use std::fmt;

/// How the wait for shots ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    TargetReached { shots: u32 },
    /// The device reported itself disconnected while streaming
    DeviceLost { shots: u32 },
    TimedOut { shots: u32 },
    Cancelled { shots: u32 },
}

impl CompletionOutcome {
    pub fn shots(&self) -> u32 {
        match self {
            CompletionOutcome::TargetReached { shots }
            | CompletionOutcome::DeviceLost { shots }
            | CompletionOutcome::TimedOut { shots }
            | CompletionOutcome::Cancelled { shots } => *shots,
        }
    }
}

/// How a whole session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    NoDevicesFound,
    SelectionAborted,
    ConnectionFailed { device_id: String, error: String },
    Completed(CompletionOutcome),
}

impl SessionOutcome {
    /// Process exit code for this outcome
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionOutcome::NoDevicesFound
            | SessionOutcome::SelectionAborted
            | SessionOutcome::Completed(CompletionOutcome::TargetReached { .. }) => 0,
            SessionOutcome::Completed(CompletionOutcome::Cancelled { .. }) => 130,
            SessionOutcome::ConnectionFailed { .. } | SessionOutcome::Completed(_) => 1,
        }
    }
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOutcome::NoDevicesFound => f.write_str("no launch monitors found"),
            SessionOutcome::SelectionAborted => f.write_str("no device selected"),
            SessionOutcome::ConnectionFailed { device_id, error } => {
                write!(f, "connection to {} failed: {}", device_id, error)
            }
            SessionOutcome::Completed(CompletionOutcome::TargetReached { shots }) => {
                write!(f, "completed after {} shots", shots)
            }
            SessionOutcome::Completed(CompletionOutcome::DeviceLost { shots }) => {
                write!(f, "device lost after {} shots", shots)
            }
            SessionOutcome::Completed(CompletionOutcome::TimedOut { shots }) => {
                write!(f, "timed out after {} shots", shots)
            }
            SessionOutcome::Completed(CompletionOutcome::Cancelled { shots }) => {
                write!(f, "cancelled after {} shots", shots)
            }
        }
    }
}

/// What a teardown pass actually did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub drain: Option<DrainReport>,
    pub power_restored: bool,
    pub unsubscribed: usize,
    pub disconnected: bool,
}

impl TeardownReport {
    /// True when the pass found nothing left to release
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}
