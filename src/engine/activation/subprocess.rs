// Subprocess node: starts a child process and waits for it to finish

use super::{single_next, NextActivation, NodeActivation, Progress, Scope, SubprocessStart};
use crate::flow::{Node, NodeIndex};
use crate::models::{Task, Transition};
use crate::Result;

/// The child is started after the parent's lock is released, so the two
/// processes never hold each other's locks. When the child reaches its End
/// the engine completes this task through `complete_subprocess`.
pub(crate) struct SubprocessActivation<'f> {
    pub node: &'f Node,
    pub next: Option<NodeIndex>,
    pub flow: &'f String,
    pub start_node: &'f String,
}

#[async_trait::async_trait]
impl NodeActivation for SubprocessActivation<'_> {
    fn node(&self) -> &Node {
        self.node
    }

    async fn activate(&self, scope: &mut Scope, task: &mut Task) -> Result<Progress> {
        scope.guard(task, Transition::Activate)?;
        scope.mark_started(task);
        scope.effects.spawns.push(SubprocessStart {
            parent_task: task.id,
            flow: self.flow.clone(),
            start_node: self.start_node.clone(),
            data: scope.process.data.clone(),
        });
        tracing::debug!(task_id = %task.id, child_flow = %self.flow, "subprocess requested");
        Ok(Progress::Wait)
    }

    fn create_next(&self, _scope: &Scope, task: &Task) -> Result<Vec<NextActivation>> {
        single_next(self.node, self.next, task)
    }

    /// Canceling the parent task cancels every child still running.
    async fn cancel(&self, scope: &mut Scope, task: &mut Task) -> Result<()> {
        let children = scope.storage().processes_by_parent(task.id).await?;
        scope
            .effects
            .cancel_processes
            .extend(children.into_iter().filter(|p| !p.is_finished()).map(|p| p.id));
        Ok(())
    }
}
