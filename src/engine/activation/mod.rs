// Task activation - the per-node state machines and the graph driver

//! # Activation
//!
//! An activation drives one task through its node kind's state machine.
//! Every kind implements [`NodeActivation`]; the shared machinery lives on
//! [`Scope`], which represents one locked engine operation on one process.
//!
//! ## Driving the Graph
//!
//! [`Scope::advance`] is the `activate_next` loop. It takes the successors
//! produced by a finished task and keeps creating, activating and
//! completing tasks until every branch is waiting or finished:
//!
//! ```text
//!   frontier ──pop──▶ enter ─▶ activate ─▶ Complete ─▶ create_next ─▶ done ─┐
//!      ▲                                   Wait ─────▶ saved as-is          │
//!      └───────────────────────── successors ◀──────────────────────────────┘
//! ```
//!
//! Join activations are parked until nothing else is left in the frontier,
//! then merged one at a time, so a join never judges completeness against
//! siblings that are about to be created in the same pass. End activations
//! are parked behind joins for the same reason.
//!
//! ## Failure Boundary
//!
//! [`Scope::settle`] is the only place a callback error can be turned into
//! an ERROR task, and only when the caller asked for
//! [`ErrorPolicy::Capture`]. Graph inconsistencies always propagate.
//!
//! An error that reaches [`Scope::close`] rolls the process back to the
//! checkpoint taken when the lock was acquired, and the events, jobs and
//! subprocess requests collected so far are dropped.

mod end;
mod function;
mod gate;
pub(crate) mod job;
mod parallel;
mod start;
mod subprocess;
mod view;

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::events::FlowEvent;
use super::flow_engine::EngineCore;
use super::jobs::JobRequest;
use super::lock::{LockKey, LockLease};
use super::permissions::PermissionPolicy;
use super::storage::{Checkpoint, FlowStorage};
use super::{Caller, ErrorPolicy};
use crate::flow::{Behavior, Condition, Flow, Node, NodeIndex, NodeKind, TaskCallback, TaskContext};
use crate::models::{Process, ProcessId, Task, TaskId, TaskStatus, Token, Transition};
use crate::{FlowError, Result};

/// Outcome of a task's domain logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    /// The task is finished; complete it and follow its successors.
    Complete,
    /// The task waits for a user, a job worker, a child process or siblings.
    Wait,
}

/// A successor to create, produced by `create_next`.
#[derive(Debug, Clone)]
pub(crate) struct NextActivation {
    pub node: NodeIndex,
    pub token: Token,
    pub previous: Vec<TaskId>,
}

impl NextActivation {
    /// Successor on the same branch as `task`.
    pub fn follow(node: NodeIndex, task: &Task) -> Self {
        NextActivation {
            node,
            token: task.token.clone(),
            previous: vec![task.id],
        }
    }
}

/// Child process to start once the parent's lock is released.
#[derive(Debug, Clone)]
pub(crate) struct SubprocessStart {
    pub parent_task: TaskId,
    pub flow: String,
    pub start_node: String,
    pub data: serde_json::Value,
}

/// Side effects collected under the lock and applied after release.
#[derive(Debug, Default)]
pub(crate) struct Effects {
    pub events: Vec<FlowEvent>,
    pub jobs: Vec<JobRequest>,
    pub spawns: Vec<SubprocessStart>,
    pub cancel_processes: Vec<ProcessId>,
}

impl Effects {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.jobs.is_empty() && self.spawns.is_empty() && self.cancel_processes.is_empty()
    }
}

/// Behaviour of one node kind.
///
/// Methods a kind does not support reject with `TransitionNotAllowed`.
#[async_trait::async_trait]
pub(crate) trait NodeActivation: Send + Sync {
    fn node(&self) -> &Node;

    /// Create the task for an incoming activation.
    async fn enter(&self, scope: &mut Scope, next: NextActivation) -> Result<Task> {
        scope.create_task(self.node(), next).await
    }

    /// Domain logic run right after the task is created.
    async fn activate(&self, scope: &mut Scope, task: &mut Task) -> Result<Progress>;

    /// Successors of a task that is about to complete.
    fn create_next(&self, scope: &Scope, task: &Task) -> Result<Vec<NextActivation>>;

    /// External trigger for automatic tasks that wait (Handle).
    async fn run(&self, _scope: &mut Scope, task: &mut Task) -> Result<Progress> {
        Err(not_allowed(task, Transition::Run))
    }

    /// Human completion of a task with submitted data (View).
    async fn execute(&self, _scope: &mut Scope, task: &mut Task, _data: serde_json::Value) -> Result<Progress> {
        Err(not_allowed(task, Transition::Execute))
    }

    async fn assign(&self, _scope: &mut Scope, task: &mut Task, _user: &str) -> Result<()> {
        Err(not_allowed(task, Transition::Assign))
    }

    async fn unassign(&self, _scope: &mut Scope, task: &mut Task) -> Result<()> {
        Err(not_allowed(task, Transition::Unassign))
    }

    async fn reassign(&self, _scope: &mut Scope, task: &mut Task, _user: &str) -> Result<()> {
        Err(not_allowed(task, Transition::Reassign))
    }

    /// Re-run the domain logic of an ERROR task.
    async fn retry(&self, scope: &mut Scope, task: &mut Task) -> Result<Progress> {
        task.status = TaskStatus::New;
        self.activate(scope, task).await
    }

    /// Revert a DONE or ERROR task whose successors are all canceled.
    async fn undo(&self, _scope: &mut Scope, task: &mut Task) -> Result<()> {
        task.status = TaskStatus::Canceled;
        task.finished = Some(Utc::now());
        Ok(())
    }

    /// Hook run before a live task is marked CANCELED.
    async fn cancel(&self, _scope: &mut Scope, _task: &mut Task) -> Result<()> {
        Ok(())
    }
}

pub(crate) fn not_allowed(task: &Task, transition: Transition) -> FlowError {
    FlowError::TransitionNotAllowed {
        task: task.id,
        transition,
        status: task.status,
    }
}

/// Successor list for nodes with exactly one next node.
pub(crate) fn single_next(node: &Node, next: Option<NodeIndex>, task: &Task) -> Result<Vec<NextActivation>> {
    let next = next.ok_or_else(|| FlowError::FlowDefinition(format!("node `{}` has no successor", node.name())))?;
    Ok(vec![NextActivation::follow(next, task)])
}

/// Build the activation for a node.
pub(crate) fn activation(flow: &Flow, index: NodeIndex) -> Box<dyn NodeActivation + '_> {
    let node = flow.node(index);
    match node.behavior() {
        Behavior::Start { next, handler } => Box::new(start::StartActivation {
            node,
            next: *next,
            handler: handler.as_ref(),
        }),
        Behavior::View { next, handler } => Box::new(view::ViewActivation {
            node,
            next: *next,
            handler: handler.as_ref(),
        }),
        Behavior::Function { next, callback } => Box::new(function::FunctionActivation {
            node,
            next: *next,
            callback,
        }),
        Behavior::Handle { next, callback } => Box::new(function::HandleActivation {
            node,
            next: *next,
            callback: callback.as_ref(),
        }),
        Behavior::Job { next, .. } => Box::new(job::JobActivation {
            node,
            reference: flow.node_reference(index),
            next: *next,
        }),
        Behavior::If {
            condition,
            on_true,
            on_false,
        } => Box::new(gate::IfActivation {
            node,
            condition,
            on_true: *on_true,
            on_false: *on_false,
        }),
        Behavior::Switch { cases, default } => Box::new(gate::SwitchActivation {
            node,
            cases,
            default: *default,
        }),
        Behavior::Split { branches } => Box::new(parallel::SplitActivation { node, branches }),
        Behavior::Join { next, wait_all } => Box::new(parallel::JoinActivation {
            node,
            next: *next,
            wait_all: *wait_all,
        }),
        Behavior::Subprocess {
            next,
            flow: child,
            start_node,
        } => Box::new(subprocess::SubprocessActivation {
            node,
            next: *next,
            flow: child,
            start_node,
        }),
        Behavior::End { terminate } => Box::new(end::EndActivation {
            node,
            terminate: *terminate,
        }),
    }
}

/// One locked engine operation on one process.
pub(crate) struct Scope {
    pub core: Arc<EngineCore>,
    pub caller: Caller,
    pub flow: Arc<Flow>,
    pub process: Process,
    pub effects: Effects,
    key: LockKey,
    lease: Option<Box<dyn LockLease>>,
    checkpoint: Option<Checkpoint>,
}

impl Scope {
    /// Acquire the process lock, then load and checkpoint the process under it.
    pub async fn open(core: Arc<EngineCore>, caller: &Caller, process_id: ProcessId) -> Result<Scope> {
        let snapshot = core.storage.load_process(process_id).await?;
        let flow = core.registry.get(&snapshot.flow)?;
        let key = LockKey::new(snapshot.flow, process_id);

        let mut lease = core.lock.acquire(&key).await?;
        let checkpoint = match core.storage.checkpoint(process_id).await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                lease.release().await?;
                return Err(e);
            }
        };
        let Some(process) = checkpoint.process.clone() else {
            lease.release().await?;
            return Err(FlowError::NotFound(format!("process {}", process_id)));
        };
        debug!(lock = %key, caller = caller.name(), "process scope opened");

        Ok(Scope {
            core,
            caller: caller.clone(),
            flow,
            process,
            effects: Effects::default(),
            key,
            lease: Some(lease),
            checkpoint: Some(checkpoint),
        })
    }

    /// The operation created this process: rolling back removes it.
    pub fn created_process(&mut self) {
        self.checkpoint = Some(Checkpoint::absent(self.process.id));
    }

    /// Persist the process and release the lock, or roll back every write
    /// of a failed operation. Returns the effects still to apply.
    pub async fn close<T>(mut self, result: Result<T>) -> (Result<T>, Effects) {
        let result = match result {
            Ok(value) => self
                .core
                .storage
                .update_process(self.process.clone())
                .await
                .map(|_| value),
            Err(e) => Err(e),
        };

        let mut effects = std::mem::take(&mut self.effects);
        if result.is_err() && self.rollback().await {
            effects = Effects::default();
        }

        let released = self.release().await;
        let result = match (result, released) {
            (Err(e), _) | (Ok(_), Err(e)) => Err(e),
            (Ok(value), Ok(())) => Ok(value),
        };
        (result, effects)
    }

    async fn rollback(&mut self) -> bool {
        let Some(checkpoint) = self.checkpoint.take() else {
            return false;
        };
        match self.core.storage.rollback(checkpoint).await {
            Ok(()) => {
                debug!(lock = %self.key, "process scope rolled back");
                true
            }
            Err(e) => {
                error!(lock = %self.key, error = %e, "rollback failed, partial writes remain");
                false
            }
        }
    }

    async fn release(&mut self) -> Result<()> {
        if let Some(mut lease) = self.lease.take() {
            lease.release().await?;
            debug!(lock = %self.key, "process scope released");
        }
        Ok(())
    }

    pub fn storage(&self) -> &dyn FlowStorage {
        self.core.storage.as_ref()
    }

    pub fn emit(&mut self, event: FlowEvent) {
        self.effects.events.push(event);
    }

    pub fn guard(&self, task: &Task, transition: Transition) -> Result<()> {
        if transition.allows(task.status) {
            Ok(())
        } else {
            Err(not_allowed(task, transition))
        }
    }

    /// Ask the permission policy on behalf of a user caller.
    pub fn permit<F>(&self, action: &'static str, task: &Task, check: F) -> Result<()>
    where
        F: FnOnce(&dyn PermissionPolicy, &str) -> bool,
    {
        match self.caller.user.as_deref() {
            None => Ok(()),
            Some(user) if check(self.core.permissions.as_ref(), user) => Ok(()),
            Some(user) => Err(FlowError::PermissionDenied {
                user: user.to_string(),
                action,
                task: task.id,
            }),
        }
    }

    /// Persist a fresh NEW task for `node`.
    pub async fn create_task(&mut self, node: &Node, next: NextActivation) -> Result<Task> {
        let mut task = Task::new(self.process.id, node.name(), next.token).with_previous(next.previous);
        task.owner_permission = node.permission().map(str::to_string);
        let task = self.storage().create_task(task).await?;
        debug!(
            process_id = %self.process.id,
            task_id = %task.id,
            node = node.name(),
            token = %task.token,
            "task created"
        );
        Ok(task)
    }

    pub async fn save(&self, task: &Task) -> Result<()> {
        self.storage().update_task(task.clone()).await?;
        Ok(())
    }

    pub fn mark_started(&mut self, task: &mut Task) {
        task.status = TaskStatus::Started;
        task.started.get_or_insert_with(Utc::now);
        self.emit(FlowEvent::TaskStarted {
            process: task.process_id,
            task: task.id,
            node: task.node.clone(),
        });
    }

    pub fn mark_done(&mut self, task: &mut Task) -> Result<()> {
        self.guard(task, Transition::Complete)?;
        task.status = TaskStatus::Done;
        task.finished = Some(Utc::now());
        task.error = None;
        info!(process_id = %task.process_id, task_id = %task.id, node = %task.node, "task done");
        self.emit(FlowEvent::TaskFinished {
            process: task.process_id,
            task: task.id,
            node: task.node.clone(),
        });
        Ok(())
    }

    /// Run a user callback with mutable access to the process and task.
    pub fn call(&mut self, callback: &TaskCallback, task: &mut Task) -> Result<()> {
        let node = task.node.clone();
        let mut ctx = TaskContext {
            process: &mut self.process,
            task,
            user: self.caller.user.as_deref(),
        };
        callback.call(&mut ctx).map_err(|e| FlowError::callback(&node, e))
    }

    pub fn evaluate(&self, condition: &Condition, task: &Task) -> Result<bool> {
        condition
            .evaluate(&self.process, task)
            .map_err(|e| FlowError::callback(&task.node, e))
    }

    fn should_capture(&self, error: &FlowError) -> bool {
        self.caller.error_policy == ErrorPolicy::Capture && error.is_capturable()
    }

    /// Record a failure on the task.
    pub async fn fail(&mut self, task: &mut Task, error: &FlowError) -> Result<()> {
        task.status = TaskStatus::Error;
        task.error = Some(error.to_string());
        task.started.get_or_insert_with(Utc::now);
        self.save(task).await?;
        warn!(
            process_id = %task.process_id,
            task_id = %task.id,
            node = %task.node,
            error = %error,
            "task failed"
        );
        self.emit(FlowEvent::TaskFailed {
            process: task.process_id,
            task: task.id,
            node: task.node.clone(),
            error: error.to_string(),
        });
        Ok(())
    }

    /// Finish the activation half of a task: complete it and collect its
    /// successors, save it as waiting, or capture its failure.
    ///
    /// Successors are computed before the task is marked DONE, so a gate
    /// with no viable branch never completes.
    pub async fn settle(
        &mut self,
        activation: &dyn NodeActivation,
        mut task: Task,
        progress: Result<Progress>,
    ) -> Result<(Task, Vec<NextActivation>)> {
        let outcome = match progress {
            Ok(Progress::Complete) => activation.create_next(self, &task).map(Some),
            Ok(Progress::Wait) => Ok(None),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(Some(next)) => {
                self.mark_done(&mut task)?;
                self.save(&task).await?;
                Ok((task, next))
            }
            Ok(None) => {
                self.save(&task).await?;
                debug!(task_id = %task.id, node = %task.node, status = %task.status, "task waiting");
                Ok((task, Vec::new()))
            }
            Err(e) if self.should_capture(&e) => {
                self.fail(&mut task, &e).await?;
                Ok((task, Vec::new()))
            }
            Err(e) => Err(e),
        }
    }

    /// The `activate_next` loop.
    pub async fn advance(&mut self, initial: Vec<NextActivation>) -> Result<()> {
        let flow = self.flow.clone();
        let mut frontier: VecDeque<NextActivation> = initial.into();
        let mut joins: VecDeque<NextActivation> = VecDeque::new();
        let mut ends: VecDeque<NextActivation> = VecDeque::new();

        loop {
            let next = if let Some(next) = frontier.pop_front() {
                match flow.node(next.node).kind() {
                    NodeKind::Join => {
                        joins.push_back(next);
                        continue;
                    }
                    NodeKind::End => {
                        ends.push_back(next);
                        continue;
                    }
                    _ => next,
                }
            } else if let Some(mut join) = joins.pop_front() {
                // Arrivals at the same join instance enter together.
                let base = join.token.base_split_token();
                let (same, rest): (VecDeque<_>, VecDeque<_>) = joins
                    .into_iter()
                    .partition(|other| other.node == join.node && other.token.base_split_token() == base);
                joins = rest;
                for other in same {
                    join.previous.extend(other.previous);
                }
                join
            } else if let Some(end) = ends.pop_front() {
                end
            } else {
                break;
            };

            let act = activation(&flow, next.node);
            let mut task = act.enter(self, next).await?;
            let progress = act.activate(self, &mut task).await;
            let (_, successors) = self.settle(act.as_ref(), task, progress).await?;
            frontier.extend(successors);
        }
        Ok(())
    }

    /// Settle a task that an external trigger just advanced, then follow it.
    pub async fn resume(
        &mut self,
        activation: &dyn NodeActivation,
        task: Task,
        progress: Result<Progress>,
    ) -> Result<Task> {
        let (task, successors) = self.settle(activation, task, progress).await?;
        self.advance(successors).await?;
        Ok(task)
    }

    /// Cancel a live task without running its domain logic.
    pub async fn cancel_task(&mut self, mut task: Task) -> Result<Task> {
        self.guard(&task, Transition::Cancel)?;
        let flow = self.flow.clone();
        let index = flow.node_index(&task.node)?;
        activation(&flow, index).cancel(self, &mut task).await?;

        task.status = TaskStatus::Canceled;
        task.finished = Some(Utc::now());
        self.save(&task).await?;
        info!(process_id = %task.process_id, task_id = %task.id, node = %task.node, "task canceled");
        Ok(task)
    }

    /// Re-evaluate waiting joins, e.g. after a branch was canceled.
    ///
    /// Each join is reloaded before the check: releasing one join can carry
    /// the flow through a later one in the same pass.
    pub async fn recheck_joins(&mut self) -> Result<()> {
        let flow = self.flow.clone();
        let mut waiting = Vec::new();
        for task in self.storage().process_tasks(self.process.id).await? {
            let index = flow.node_index(&task.node)?;
            if task.status == TaskStatus::Started && flow.node(index).is_join() {
                waiting.push((task.id, index));
            }
        }

        for (id, index) in waiting {
            let mut task = self.storage().load_task(id).await?;
            if task.status != TaskStatus::Started {
                debug!(task_id = %task.id, node = %task.node, status = %task.status, "join already settled");
                continue;
            }
            let act = activation(&flow, index);
            let progress = act.activate(self, &mut task).await;
            if matches!(progress, Ok(Progress::Complete)) {
                debug!(task_id = %task.id, node = %task.node, "join released by recheck");
            }
            self.resume(act.as_ref(), task, progress).await?;
        }
        Ok(())
    }

    /// Tasks of this process that still count as active work.
    pub async fn active_tasks(&self) -> Result<Vec<Task>> {
        Ok(self
            .storage()
            .process_tasks(self.process.id)
            .await?
            .into_iter()
            .filter(Task::is_active)
            .collect())
    }
}
