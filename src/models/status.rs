// Task and process status machines

//! # Statuses and Transitions
//!
//! ```text
//!            assign            execute / complete
//!   NEW ───────────────▶ ASSIGNED ───────────────▶ DONE
//!    │  ▲   unassign        │                      │ ▲
//!    │  └───────────────────┘                 undo │ │ retry (ERROR → … → DONE)
//!    │ activate / run / start_job                  ▼ │
//!    └──────▶ STARTED ─────────▶ DONE        CANCELED  ERROR
//!   SCHEDULED ──start_job──▶ STARTED ──fail──▶ ERROR ──revive──▶ REVIVED (+ new task)
//! ```
//!
//! The table in [`Transition::sources`] is the single authority on which
//! status a transition may start from. Everything else in the engine asks
//! it before writing.

use serde::{Deserialize, Serialize};

/// Life-cycle status of a single task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    New,
    Assigned,
    Scheduled,
    Started,
    Done,
    Canceled,
    Error,
    Revived,
}

impl TaskStatus {
    /// Statuses that no longer count as active work.
    ///
    /// `Revived` is terminal: the errored row was superseded by a fresh copy.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Canceled | TaskStatus::Revived)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::New => "NEW",
            TaskStatus::Assigned => "ASSIGNED",
            TaskStatus::Scheduled => "SCHEDULED",
            TaskStatus::Started => "STARTED",
            TaskStatus::Done => "DONE",
            TaskStatus::Canceled => "CANCELED",
            TaskStatus::Error => "ERROR",
            TaskStatus::Revived => "REVIVED",
        }
    }

    /// Every non-terminal status, handy for storage queries.
    pub fn active() -> &'static [TaskStatus] {
        &[
            TaskStatus::New,
            TaskStatus::Assigned,
            TaskStatus::Scheduled,
            TaskStatus::Started,
            TaskStatus::Error,
        ]
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a whole process instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStatus {
    New,
    Done,
    Canceled,
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProcessStatus::New => "NEW",
            ProcessStatus::Done => "DONE",
            ProcessStatus::Canceled => "CANCELED",
        };
        f.write_str(name)
    }
}

/// A guarded state change on a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Activate,
    Assign,
    Unassign,
    Reassign,
    Execute,
    Run,
    StartJob,
    Complete,
    Cancel,
    Undo,
    Retry,
    Revive,
}

impl Transition {
    /// Statuses the transition may start from.
    pub fn sources(self) -> &'static [TaskStatus] {
        use TaskStatus::*;
        match self {
            Transition::Activate => &[New],
            Transition::Assign => &[New],
            Transition::Unassign => &[Assigned],
            Transition::Reassign => &[Assigned],
            Transition::Execute => &[Assigned],
            Transition::Run => &[New],
            Transition::StartJob => &[Scheduled],
            Transition::Complete => &[Assigned, Started],
            Transition::Cancel => &[New, Assigned, Scheduled, Started, Error],
            Transition::Undo => &[Done, Error],
            Transition::Retry => &[Error],
            Transition::Revive => &[Canceled, Error],
        }
    }

    pub fn allows(self, status: TaskStatus) -> bool {
        self.sources().contains(&status)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Transition::Activate => "activate",
            Transition::Assign => "assign",
            Transition::Unassign => "unassign",
            Transition::Reassign => "reassign",
            Transition::Execute => "execute",
            Transition::Run => "run",
            Transition::StartJob => "start_job",
            Transition::Complete => "complete",
            Transition::Cancel => "cancel",
            Transition::Undo => "undo",
            Transition::Retry => "retry",
            Transition::Revive => "revive",
        }
    }
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
