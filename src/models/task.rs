// Task records - one node visit inside a process

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ProcessId, TaskId};
use super::status::TaskStatus;
use super::token::Token;

/// Persisted record of one node instance within a process.
///
/// Tasks are never deleted. Cancellation, undo and revive are status
/// changes, so the full route a process took stays queryable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Storage-assigned key; `TaskId(0)` until the record is created.
    pub id: TaskId,

    pub process_id: ProcessId,

    /// Name of the node inside the process's flow.
    pub node: String,

    pub status: TaskStatus,

    /// Branch lineage. Set at creation and never changed afterwards.
    pub token: Token,

    pub created: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,

    /// Tasks whose completion led here. A Join collects one per arriving branch.
    pub previous: Vec<TaskId>,

    /// User currently holding a human task.
    pub owner: Option<String>,

    /// Permission a user needs to pick up or execute the task.
    pub owner_permission: Option<String>,

    /// Free-form task payload (form data, job results).
    pub data: serde_json::Value,

    /// Rendered error chain of the last captured failure.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl Task {
    pub fn new<N: Into<String>>(process_id: ProcessId, node: N, token: Token) -> Self {
        Task {
            id: TaskId(0),
            process_id,
            node: node.into(),
            status: TaskStatus::New,
            token,
            created: Utc::now(),
            started: None,
            finished: None,
            previous: Vec::new(),
            owner: None,
            owner_permission: None,
            data: serde_json::Value::Object(Default::default()),
            error: None,
        }
    }

    pub fn with_previous(mut self, previous: Vec<TaskId>) -> Self {
        self.previous = previous;
        self
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Record an additional predecessor, ignoring duplicates.
    pub fn add_previous(&mut self, task: TaskId) {
        if !self.previous.contains(&task) {
            self.previous.push(task);
        }
    }

    /// Shallow-merge a JSON object into the task payload.
    ///
    /// Non-object payloads replace the current data outright.
    pub fn merge_data(&mut self, patch: serde_json::Value) {
        merge_json(&mut self.data, patch);
    }
}

pub(crate) fn merge_json(target: &mut serde_json::Value, patch: serde_json::Value) {
    match (target.as_object_mut(), patch) {
        (Some(existing), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                existing.insert(key, value);
            }
        }
        (_, serde_json::Value::Null) => {}
        (_, patch) => *target = patch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_task_is_active_and_empty() {
        let task = Task::new(ProcessId(1), "approve", Token::start());
        assert_eq!(task.status, TaskStatus::New);
        assert!(task.is_active());
        assert!(task.previous.is_empty());
        assert_eq!(task.data, json!({}));
    }

    #[test]
    fn previous_tasks_are_deduplicated() {
        let mut task = Task::new(ProcessId(1), "join", Token::start());
        task.add_previous(TaskId(3));
        task.add_previous(TaskId(4));
        task.add_previous(TaskId(3));
        assert_eq!(task.previous, vec![TaskId(3), TaskId(4)]);
    }

    #[test]
    fn merge_data_overlays_keys() {
        let mut task = Task::new(ProcessId(1), "review", Token::start());
        task.merge_data(json!({"approved": false, "comment": "draft"}));
        task.merge_data(json!({"approved": true}));
        task.merge_data(serde_json::Value::Null);
        assert_eq!(task.data, json!({"approved": true, "comment": "draft"}));
    }
}
