// End node: finishes the process once no other work is active

use chrono::Utc;
use tracing::info;

use super::{NextActivation, NodeActivation, Progress, Scope};
use crate::engine::events::FlowEvent;
use crate::flow::Node;
use crate::models::{Task, TaskStatus, Transition};
use crate::Result;

pub(crate) struct EndActivation<'f> {
    pub node: &'f Node,
    /// Cancel every other active task on arrival.
    pub terminate: bool,
}

#[async_trait::async_trait]
impl NodeActivation for EndActivation<'_> {
    fn node(&self) -> &Node {
        self.node
    }

    async fn activate(&self, scope: &mut Scope, task: &mut Task) -> Result<Progress> {
        scope.guard(task, Transition::Activate)?;
        scope.mark_started(task);

        if self.terminate {
            for other in scope.active_tasks().await? {
                if other.id != task.id {
                    scope.cancel_task(other).await?;
                }
            }
        }

        let remaining = scope
            .active_tasks()
            .await?
            .into_iter()
            .filter(|t| t.id != task.id)
            .count();
        if remaining == 0 {
            scope.process.mark_done();
            info!(process_id = %scope.process.id, flow = %scope.process.flow, "process finished");
            let event = FlowEvent::FlowFinished {
                process: scope.process.id,
                flow: scope.process.flow.clone(),
                parent_task: scope.process.parent_task,
            };
            scope.emit(event);
        } else {
            tracing::debug!(task_id = %task.id, remaining, "end reached with work still active");
        }
        Ok(Progress::Complete)
    }

    fn create_next(&self, _scope: &Scope, _task: &Task) -> Result<Vec<NextActivation>> {
        Ok(Vec::new())
    }

    /// Undoing an End reopens the process.
    async fn undo(&self, scope: &mut Scope, task: &mut Task) -> Result<()> {
        task.status = TaskStatus::Canceled;
        task.finished = Some(Utc::now());
        scope.process.reopen();
        info!(process_id = %scope.process.id, "process reopened by end undo");
        Ok(())
    }
}
