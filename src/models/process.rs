// Process records - one running instance of a flow

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ProcessId, TaskId};
use super::status::ProcessStatus;

/// Persisted record of one flow execution.
///
/// Created by a Start activation and mutated only while the process lock
/// is held.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
    /// Storage-assigned key; `ProcessId(0)` until the record is created.
    pub id: ProcessId,

    /// Reference string of the flow this process runs (`app/path.FlowName`).
    pub flow: String,

    pub status: ProcessStatus,

    pub created: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,

    /// Subprocess task in the parent process that spawned this one.
    pub parent_task: Option<TaskId>,

    /// Business payload shared by every task of the process.
    pub data: serde_json::Value,

    /// Optional reference to a domain object the process works on.
    pub artifact: Option<String>,
}

impl Process {
    pub fn new<F: Into<String>>(flow: F) -> Self {
        Process {
            id: ProcessId(0),
            flow: flow.into(),
            status: ProcessStatus::New,
            created: Utc::now(),
            finished: None,
            parent_task: None,
            data: serde_json::Value::Object(Default::default()),
            artifact: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn is_finished(&self) -> bool {
        self.status != ProcessStatus::New
    }

    pub(crate) fn mark_done(&mut self) {
        self.status = ProcessStatus::Done;
        self.finished = Some(Utc::now());
    }

    pub(crate) fn mark_canceled(&mut self) {
        self.status = ProcessStatus::Canceled;
        self.finished = Some(Utc::now());
    }

    pub(crate) fn reopen(&mut self) {
        self.status = ProcessStatus::New;
        self.finished = None;
    }
}
