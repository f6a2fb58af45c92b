// Start node: opens the process and completes immediately

use super::{single_next, NextActivation, NodeActivation, Progress, Scope};
use crate::flow::{Node, NodeIndex, TaskCallback};
use crate::models::{Task, Transition};
use crate::Result;

pub(crate) struct StartActivation<'f> {
    pub node: &'f Node,
    pub next: Option<NodeIndex>,
    pub handler: Option<&'f TaskCallback>,
}

#[async_trait::async_trait]
impl NodeActivation for StartActivation<'_> {
    fn node(&self) -> &Node {
        self.node
    }

    async fn activate(&self, scope: &mut Scope, task: &mut Task) -> Result<Progress> {
        scope.guard(task, Transition::Activate)?;
        scope.mark_started(task);
        if let Some(handler) = self.handler {
            scope.call(handler, task)?;
        }
        Ok(Progress::Complete)
    }

    fn create_next(&self, _scope: &Scope, task: &Task) -> Result<Vec<NextActivation>> {
        single_next(self.node, self.next, task)
    }

    /// Undoing the start of a process cancels the whole process.
    async fn undo(&self, scope: &mut Scope, task: &mut Task) -> Result<()> {
        task.status = crate::models::TaskStatus::Canceled;
        task.finished = Some(chrono::Utc::now());
        scope.process.mark_canceled();
        tracing::info!(process_id = %scope.process.id, "process canceled by start undo");
        Ok(())
    }
}
