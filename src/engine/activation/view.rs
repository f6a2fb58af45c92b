// View node: a human task claimed and completed by a user

//! ```text
//!   NEW ──assign──▶ ASSIGNED ──execute──▶ DONE
//!    ▲                │   ▲                 │
//!    └────unassign────┘   └──────undo───────┘
//! ```
//!
//! Ownership rules: a user may take a task only if the permission policy
//! lets them hold its permission; only the owner (or the system) may
//! execute it; only the owner or a manager may unassign or reassign it.

use chrono::Utc;
use tracing::info;

use super::{single_next, NextActivation, NodeActivation, Progress, Scope};
use crate::engine::events::FlowEvent;
use crate::flow::{Node, NodeIndex, TaskCallback};
use crate::models::{Task, TaskStatus, Transition};
use crate::{FlowError, Result};

pub(crate) struct ViewActivation<'f> {
    pub node: &'f Node,
    pub next: Option<NodeIndex>,
    pub handler: Option<&'f TaskCallback>,
}

impl ViewActivation<'_> {
    /// The caller must own the task or be allowed to manage it.
    fn require_owner_or_manager(scope: &Scope, task: &Task, action: &'static str) -> Result<()> {
        match scope.caller.user.as_deref() {
            Some(user) if task.owner.as_deref() == Some(user) => Ok(()),
            _ => scope.permit(action, task, |policy, user| policy.can_manage(user, task)),
        }
    }

    fn require_assignable(scope: &Scope, task: &Task, target: &str) -> Result<()> {
        if scope.core.permissions.can_assign(target, task) {
            Ok(())
        } else {
            Err(FlowError::PermissionDenied {
                user: target.to_string(),
                action: "assign",
                task: task.id,
            })
        }
    }
}

#[async_trait::async_trait]
impl NodeActivation for ViewActivation<'_> {
    fn node(&self) -> &Node {
        self.node
    }

    /// Human tasks wait in NEW until someone takes them.
    async fn activate(&self, scope: &mut Scope, task: &mut Task) -> Result<Progress> {
        scope.guard(task, Transition::Activate)?;
        Ok(Progress::Wait)
    }

    fn create_next(&self, _scope: &Scope, task: &Task) -> Result<Vec<NextActivation>> {
        single_next(self.node, self.next, task)
    }

    async fn assign(&self, scope: &mut Scope, task: &mut Task, user: &str) -> Result<()> {
        scope.guard(task, Transition::Assign)?;
        Self::require_assignable(scope, task, user)?;
        if scope.caller.user.as_deref() != Some(user) {
            scope.permit("assign", task, |policy, caller| policy.can_manage(caller, task))?;
        }

        task.owner = Some(user.to_string());
        task.status = TaskStatus::Assigned;
        task.started.get_or_insert_with(Utc::now);
        info!(task_id = %task.id, node = %task.node, owner = user, "task assigned");
        scope.emit(FlowEvent::TaskStarted {
            process: task.process_id,
            task: task.id,
            node: task.node.clone(),
        });
        Ok(())
    }

    async fn unassign(&self, scope: &mut Scope, task: &mut Task) -> Result<()> {
        scope.guard(task, Transition::Unassign)?;
        Self::require_owner_or_manager(scope, task, "unassign")?;

        info!(task_id = %task.id, node = %task.node, owner = ?task.owner, "task unassigned");
        task.owner = None;
        task.status = TaskStatus::New;
        task.started = None;
        Ok(())
    }

    async fn reassign(&self, scope: &mut Scope, task: &mut Task, user: &str) -> Result<()> {
        scope.guard(task, Transition::Reassign)?;
        Self::require_owner_or_manager(scope, task, "reassign")?;
        Self::require_assignable(scope, task, user)?;

        info!(task_id = %task.id, node = %task.node, from = ?task.owner, to = user, "task reassigned");
        task.owner = Some(user.to_string());
        Ok(())
    }

    async fn execute(&self, scope: &mut Scope, task: &mut Task, data: serde_json::Value) -> Result<Progress> {
        scope.guard(task, Transition::Execute)?;
        if let Some(user) = scope.caller.user.as_deref() {
            if task.owner.as_deref() != Some(user) {
                return Err(FlowError::PermissionDenied {
                    user: user.to_string(),
                    action: "execute",
                    task: task.id,
                });
            }
        }
        scope.permit("execute", task, |policy, user| policy.can_execute(user, task))?;

        task.merge_data(data);
        if let Some(handler) = self.handler {
            scope.call(handler, task)?;
        }
        Ok(Progress::Complete)
    }

    /// A failed view goes back to its owner.
    async fn retry(&self, _scope: &mut Scope, task: &mut Task) -> Result<Progress> {
        task.status = if task.owner.is_some() {
            TaskStatus::Assigned
        } else {
            TaskStatus::New
        };
        Ok(Progress::Wait)
    }

    /// An undone view returns to its owner instead of being canceled.
    async fn undo(&self, _scope: &mut Scope, task: &mut Task) -> Result<()> {
        task.status = if task.owner.is_some() {
            TaskStatus::Assigned
        } else {
            TaskStatus::New
        };
        task.finished = None;
        Ok(())
    }
}
