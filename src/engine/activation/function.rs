// Function and Handle nodes: automatic steps with a user callback

use super::{not_allowed, single_next, NextActivation, NodeActivation, Progress, Scope};
use crate::flow::{Node, NodeIndex, TaskCallback};
use crate::models::{Task, TaskStatus, Transition};
use crate::Result;

/// Runs its callback inline while the process advances.
pub(crate) struct FunctionActivation<'f> {
    pub node: &'f Node,
    pub next: Option<NodeIndex>,
    pub callback: &'f TaskCallback,
}

#[async_trait::async_trait]
impl NodeActivation for FunctionActivation<'_> {
    fn node(&self) -> &Node {
        self.node
    }

    async fn activate(&self, scope: &mut Scope, task: &mut Task) -> Result<Progress> {
        scope.guard(task, Transition::Activate)?;
        scope.mark_started(task);
        scope.call(self.callback, task)?;
        Ok(Progress::Complete)
    }

    fn create_next(&self, _scope: &Scope, task: &Task) -> Result<Vec<NextActivation>> {
        single_next(self.node, self.next, task)
    }
}

/// Created NEW; waits until external code runs it.
pub(crate) struct HandleActivation<'f> {
    pub node: &'f Node,
    pub next: Option<NodeIndex>,
    pub callback: Option<&'f TaskCallback>,
}

#[async_trait::async_trait]
impl NodeActivation for HandleActivation<'_> {
    fn node(&self) -> &Node {
        self.node
    }

    async fn activate(&self, scope: &mut Scope, task: &mut Task) -> Result<Progress> {
        scope.guard(task, Transition::Activate)?;
        Ok(Progress::Wait)
    }

    fn create_next(&self, _scope: &Scope, task: &Task) -> Result<Vec<NextActivation>> {
        single_next(self.node, self.next, task)
    }

    async fn run(&self, scope: &mut Scope, task: &mut Task) -> Result<Progress> {
        scope.guard(task, Transition::Run)?;
        scope.mark_started(task);
        if let Some(callback) = self.callback {
            scope.call(callback, task)?;
        }
        Ok(Progress::Complete)
    }

    /// A failed handle is run again straight away.
    async fn retry(&self, scope: &mut Scope, task: &mut Task) -> Result<Progress> {
        if task.status != TaskStatus::Error {
            return Err(not_allowed(task, Transition::Retry));
        }
        task.status = TaskStatus::New;
        self.run(scope, task).await
    }
}
