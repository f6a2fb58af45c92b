// Job node: background work run by a worker without holding the process lock

//! ```text
//!   NEW ─▶ SCHEDULED ──start_job──▶ STARTED ──ok──▶ DONE
//!              ▲                        │
//!              └───────retry─────── ERROR ◀──err──┘
//! ```
//!
//! Activation only schedules the task and queues a
//! [`JobRequest`](crate::engine::jobs::JobRequest), dispatched after the
//! lock is released. The worker then calls `FlowEngine::run_job`, which
//! takes the lock twice: once to move the task to STARTED, once to record
//! the outcome. The job body itself runs unlocked.

use super::{not_allowed, single_next, NextActivation, NodeActivation, Progress, Scope};
use crate::engine::jobs::JobRequest;
use crate::flow::{JobContext, Node, NodeIndex};
use crate::models::{Task, TaskStatus, Transition};
use crate::Result;

pub(crate) struct JobActivation<'f> {
    pub node: &'f Node,
    /// Full node reference a worker can resolve on its own
    pub reference: String,
    pub next: Option<NodeIndex>,
}

impl JobActivation<'_> {
    fn schedule(&self, scope: &mut Scope, task: &mut Task) {
        task.status = TaskStatus::Scheduled;
        tracing::debug!(task_id = %task.id, job = %self.reference, "job scheduled");
        scope.effects.jobs.push(JobRequest {
            job: self.reference.clone(),
            process: task.process_id,
            task: task.id,
        });
    }

    /// SCHEDULED -> STARTED, returning the snapshot handed to the job body.
    pub fn begin(&self, scope: &mut Scope, task: &mut Task) -> Result<JobContext> {
        scope.guard(task, Transition::StartJob)?;
        scope.mark_started(task);
        Ok(JobContext {
            process_id: task.process_id,
            task_id: task.id,
            process_data: scope.process.data.clone(),
            task_data: task.data.clone(),
        })
    }
}

#[async_trait::async_trait]
impl NodeActivation for JobActivation<'_> {
    fn node(&self) -> &Node {
        self.node
    }

    async fn activate(&self, scope: &mut Scope, task: &mut Task) -> Result<Progress> {
        scope.guard(task, Transition::Activate)?;
        self.schedule(scope, task);
        Ok(Progress::Wait)
    }

    fn create_next(&self, _scope: &Scope, task: &Task) -> Result<Vec<NextActivation>> {
        single_next(self.node, self.next, task)
    }

    /// A failed job is rescheduled rather than run inline.
    async fn retry(&self, scope: &mut Scope, task: &mut Task) -> Result<Progress> {
        if task.status != TaskStatus::Error {
            return Err(not_allowed(task, Transition::Retry));
        }
        task.error = None;
        self.schedule(scope, task);
        Ok(Progress::Wait)
    }
}
