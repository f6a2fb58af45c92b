// Flow engine facade
// Every public operation: lock the process, mutate, release, then publish

//! # FlowEngine
//!
//! [`FlowEngine`] is the only way to change process and task records. Each
//! entry point follows the same shape:
//!
//! 1. load the task (unlocked) to learn which process it belongs to
//! 2. open a `Scope`: acquire the process lock, reload the records and
//!    checkpoint them
//! 3. run the task's activation
//! 4. close the scope: save the process, or roll back to the checkpoint if
//!    step 3 failed, then release the lock
//! 5. apply collected effects: publish events, dispatch jobs, start or
//!    cancel child processes
//!
//! A rolled-back operation has no effects to apply.
//!
//! ## Rust Learning Notes:
//!
//! ### Boxed Recursive Futures
//! Applying effects can start a child process, whose End can complete the
//! parent task, which applies more effects. An `async fn` cannot await
//! itself, so [`FlowEngine::after`] returns a `BoxFuture` that breaks the
//! cycle in the type system.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::activation::job::JobActivation;
use super::activation::{activation, not_allowed, Effects, NextActivation, Progress, Scope};
use super::config::EngineConfig;
use super::events::{EventBus, FlowEvent};
use super::jobs::{JobDispatcher, JobRequest, QueuedJobDispatcher};
use super::lock::{CacheLock, LockRetryPolicy, ProcessLock, RowLocker};
use super::permissions::{AllowAll, PermissionPolicy};
use super::storage::{Checkpoint, FlowStorage, InMemoryStorage};
use super::{Caller, ErrorPolicy};
use crate::flow::{Behavior, Flow, FlowRegistry, JobContext, NodeKind};
use crate::models::{Process, ProcessId, Task, TaskId, TaskStatus, Token, Transition};
use crate::{FlowError, Result};

/// Shared collaborators of every engine operation.
pub(crate) struct EngineCore {
    pub registry: Arc<FlowRegistry>,
    pub storage: Arc<dyn FlowStorage>,
    pub lock: Arc<dyn ProcessLock>,
    pub permissions: Arc<dyn PermissionPolicy>,
    pub events: EventBus,
    pub jobs: Arc<dyn JobDispatcher>,
}

/// Cheap to clone; clones share storage, locks and the event bus.
#[derive(Clone)]
pub struct FlowEngine {
    core: Arc<EngineCore>,
}

impl FlowEngine {
    pub fn builder() -> FlowEngineBuilder {
        FlowEngineBuilder::new()
    }

    pub fn storage(&self) -> &Arc<dyn FlowStorage> {
        &self.core.storage
    }

    pub fn registry(&self) -> &Arc<FlowRegistry> {
        &self.core.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.core.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.core.events.subscribe()
    }

    pub fn lock_backend(&self) -> &'static str {
        self.core.lock.name()
    }

    /// Register another flow after the engine was built.
    pub fn register_flow(&self, flow: Arc<Flow>) -> Arc<Flow> {
        self.core.registry.register(flow)
    }

    pub async fn process(&self, id: ProcessId) -> Result<Process> {
        self.core.storage.load_process(id).await
    }

    pub async fn task(&self, id: TaskId) -> Result<Task> {
        self.core.storage.load_task(id).await
    }

    /// Every task of a process, oldest first.
    pub async fn tasks(&self, process: ProcessId) -> Result<Vec<Task>> {
        self.core.storage.process_tasks(process).await
    }

    // ========================================================================
    // Process lifecycle
    // ========================================================================

    /// Start a new process of `flow` at one of its Start nodes.
    pub async fn start_process(&self, flow: &str, start_node: &str, data: Value, caller: &Caller) -> Result<Process> {
        self.start_inner(flow, start_node, data, None, caller).await
    }

    async fn start_inner(
        &self,
        flow_ref: &str,
        start_node: &str,
        data: Value,
        parent_task: Option<TaskId>,
        caller: &Caller,
    ) -> Result<Process> {
        let flow = self.core.registry.get(flow_ref)?;
        let index = flow.node_index(start_node)?;
        let node = flow.node(index);
        if node.kind() != NodeKind::Start {
            return Err(FlowError::FlowDefinition(format!(
                "`{}` is a {:?} node, not a start node",
                start_node,
                node.kind()
            )));
        }
        if let Some(user) = caller.user.as_deref() {
            if !self.core.permissions.can_start(user, node.permission()) {
                return Err(FlowError::StartDenied {
                    user: user.to_string(),
                    node: flow.node_reference(index),
                });
            }
        }

        let mut process = Process::new(flow.reference()).with_data(data);
        process.parent_task = parent_task;
        let process = self.core.storage.create_process(process).await?;
        info!(process_id = %process.id, flow = %process.flow, caller = caller.name(), "process created");

        let mut scope = match Scope::open(self.core.clone(), caller, process.id).await {
            Ok(scope) => scope,
            Err(e) => {
                if let Err(cleanup) = self.core.storage.rollback(Checkpoint::absent(process.id)).await {
                    warn!(process_id = %process.id, error = %cleanup, "unstarted process left behind");
                }
                return Err(e);
            }
        };
        scope.created_process();
        let result: Result<Process> = async {
            let act = activation(&flow, index);
            let next = NextActivation {
                node: index,
                token: Token::start(),
                previous: Vec::new(),
            };
            let mut task = act.enter(&mut scope, next).await?;
            let event = FlowEvent::FlowStarted {
                process: scope.process.id,
                flow: scope.process.flow.clone(),
            };
            scope.emit(event);
            let progress = act.activate(&mut scope, &mut task).await;
            scope.resume(act.as_ref(), task, progress).await?;
            Ok(scope.process.clone())
        }
        .await;
        self.finish(scope, result).await
    }

    /// Cancel every active task of a live process and mark it CANCELED.
    pub async fn cancel_process(&self, process: ProcessId, caller: &Caller) -> Result<Process> {
        let mut scope = Scope::open(self.core.clone(), caller, process).await?;
        let result: Result<Process> = async {
            if scope.process.is_finished() {
                return Err(FlowError::ProcessFinished {
                    process: scope.process.id,
                    status: scope.process.status,
                });
            }
            for task in scope.active_tasks().await? {
                scope.permit("cancel", &task, |policy, user| policy.can_manage(user, &task))?;
                scope.cancel_task(task).await?;
            }
            scope.process.mark_canceled();
            info!(process_id = %scope.process.id, caller = scope.caller.name(), "process canceled");
            Ok(scope.process.clone())
        }
        .await;
        self.finish(scope, result).await
    }

    /// Complete a Subprocess task once its child process has finished.
    pub async fn complete_subprocess(&self, task: TaskId, caller: &Caller) -> Result<Task> {
        let (mut scope, task) = self.open_task(task, caller).await?;
        let result: Result<Task> = async {
            let flow = scope.flow.clone();
            let act = activation(&flow, flow.node_index(&task.node)?);
            if act.node().kind() != NodeKind::Subprocess || task.status != TaskStatus::Started {
                return Err(not_allowed(&task, Transition::Complete));
            }
            debug!(task_id = %task.id, "child process finished");
            scope.resume(act.as_ref(), task, Ok(Progress::Complete)).await
        }
        .await;
        self.finish(scope, result).await
    }

    // ========================================================================
    // Human tasks
    // ========================================================================

    pub async fn assign(&self, task: TaskId, user: &str, caller: &Caller) -> Result<Task> {
        let (mut scope, mut task) = self.open_task(task, caller).await?;
        let result: Result<Task> = async {
            let flow = scope.flow.clone();
            let act = activation(&flow, flow.node_index(&task.node)?);
            act.assign(&mut scope, &mut task, user).await?;
            scope.save(&task).await?;
            Ok(task)
        }
        .await;
        self.finish(scope, result).await
    }

    pub async fn unassign(&self, task: TaskId, caller: &Caller) -> Result<Task> {
        let (mut scope, mut task) = self.open_task(task, caller).await?;
        let result: Result<Task> = async {
            let flow = scope.flow.clone();
            let act = activation(&flow, flow.node_index(&task.node)?);
            act.unassign(&mut scope, &mut task).await?;
            scope.save(&task).await?;
            Ok(task)
        }
        .await;
        self.finish(scope, result).await
    }

    pub async fn reassign(&self, task: TaskId, user: &str, caller: &Caller) -> Result<Task> {
        let (mut scope, mut task) = self.open_task(task, caller).await?;
        let result: Result<Task> = async {
            let flow = scope.flow.clone();
            let act = activation(&flow, flow.node_index(&task.node)?);
            act.reassign(&mut scope, &mut task, user).await?;
            scope.save(&task).await?;
            Ok(task)
        }
        .await;
        self.finish(scope, result).await
    }

    /// Submit a human task with form data.
    pub async fn execute(&self, task: TaskId, data: Value, caller: &Caller) -> Result<Task> {
        let (mut scope, mut task) = self.open_task(task, caller).await?;
        let result: Result<Task> = async {
            let flow = scope.flow.clone();
            let act = activation(&flow, flow.node_index(&task.node)?);
            let progress = act.execute(&mut scope, &mut task, data).await;
            scope.resume(act.as_ref(), task, progress).await
        }
        .await;
        self.finish(scope, result).await
    }

    // ========================================================================
    // Automatic tasks
    // ========================================================================

    /// Run a waiting Handle task.
    pub async fn run_handle(&self, task: TaskId, caller: &Caller) -> Result<Task> {
        let (mut scope, mut task) = self.open_task(task, caller).await?;
        let result: Result<Task> = async {
            let flow = scope.flow.clone();
            let act = activation(&flow, flow.node_index(&task.node)?);
            let progress = act.run(&mut scope, &mut task).await;
            scope.resume(act.as_ref(), task, progress).await
        }
        .await;
        self.finish(scope, result).await
    }

    /// Run a scheduled job: start it under the lock, run the body unlocked,
    /// then record the outcome under the lock again.
    ///
    /// A failing body always leaves the task in ERROR. A propagating caller
    /// additionally gets the error back.
    pub async fn run_job(&self, request: &JobRequest, caller: &Caller) -> Result<Task> {
        let (flow, index) = self.core.registry.resolve_node(&request.job)?;
        let node = flow.node(index);
        let (next, job) = match node.behavior() {
            Behavior::Job { next, job } => (*next, job),
            _ => {
                return Err(FlowError::FlowDefinition(format!("`{}` is not a job node", request.job)));
            }
        };
        let act = JobActivation {
            node,
            reference: request.job.clone(),
            next,
        };

        // Phase 1: SCHEDULED -> STARTED
        let (mut scope, mut task) = self.open_task(request.task, caller).await?;
        let result: Result<Option<JobContext>> = async {
            if task.status == TaskStatus::Canceled {
                info!(task_id = %task.id, job = %request.job, "job skipped, task canceled");
                return Ok(None);
            }
            let ctx = act.begin(&mut scope, &mut task)?;
            scope.save(&task).await?;
            Ok(Some(ctx))
        }
        .await;
        let Some(ctx) = self.finish(scope, result).await? else {
            return self.task(request.task).await;
        };

        // Phase 2: the body, without the lock
        debug!(task_id = %request.task, job = %request.job, "job running");
        let outcome = job.call(ctx).await;

        // Phase 3: record the outcome. A failure is committed as ERROR
        // before a propagating caller sees it.
        let (mut scope, mut task) = self.open_task(request.task, caller).await?;
        let result: Result<(Task, Option<FlowError>)> = async {
            if task.status != TaskStatus::Started {
                warn!(task_id = %task.id, status = %task.status, "job finished but task moved on");
                return Ok((task, None));
            }
            match outcome {
                Ok(value) => {
                    task.merge_data(value);
                    let task = scope.resume(&act, task, Ok(Progress::Complete)).await?;
                    Ok((task, None))
                }
                Err(e) => {
                    let err = FlowError::callback(&task.node, e);
                    scope.fail(&mut task, &err).await?;
                    Ok((task, Some(err)))
                }
            }
        }
        .await;
        match self.finish(scope, result).await? {
            (_, Some(err)) if caller.error_policy == ErrorPolicy::Propagate => Err(err),
            (task, _) => Ok(task),
        }
    }

    // ========================================================================
    // Administration
    // ========================================================================

    /// Cancel a live task, then let any join waiting on it re-check.
    pub async fn cancel(&self, task: TaskId, caller: &Caller) -> Result<Task> {
        let (mut scope, task) = self.open_task(task, caller).await?;
        let result: Result<Task> = async {
            scope.guard(&task, Transition::Cancel)?;
            scope.permit("cancel", &task, |policy, user| policy.can_manage(user, &task))?;
            let task = scope.cancel_task(task).await?;
            scope.recheck_joins().await?;
            Ok(task)
        }
        .await;
        self.finish(scope, result).await
    }

    /// Revert a DONE or ERROR task. Every task created from it must already
    /// be canceled or revived.
    pub async fn undo(&self, task: TaskId, caller: &Caller) -> Result<Task> {
        let (mut scope, mut task) = self.open_task(task, caller).await?;
        let result: Result<Task> = async {
            scope.guard(&task, Transition::Undo)?;
            scope.permit("undo", &task, |policy, user| policy.can_manage(user, &task))?;

            let leading = scope.storage().leading_tasks(task.id).await?;
            if let Some(live) = leading
                .iter()
                .find(|t| !matches!(t.status, TaskStatus::Canceled | TaskStatus::Revived))
            {
                debug!(task_id = %task.id, blocking = %live.id, "undo blocked by successor");
                return Err(not_allowed(&task, Transition::Undo));
            }

            let flow = scope.flow.clone();
            let act = activation(&flow, flow.node_index(&task.node)?);
            act.undo(&mut scope, &mut task).await?;
            scope.save(&task).await?;
            info!(task_id = %task.id, node = %task.node, status = %task.status, "task undone");
            Ok(task)
        }
        .await;
        self.finish(scope, result).await
    }

    /// Re-create a CANCELED or ERROR task as a fresh copy and activate it.
    ///
    /// Returns the new task. An ERROR source becomes REVIVED; a finished
    /// process is reopened.
    pub async fn revive(&self, task: TaskId, caller: &Caller) -> Result<Task> {
        let (mut scope, mut source) = self.open_task(task, caller).await?;
        let result: Result<Task> = async {
            scope.guard(&source, Transition::Revive)?;
            scope.permit("revive", &source, |policy, user| policy.can_manage(user, &source))?;

            if source.status == TaskStatus::Error {
                source.status = TaskStatus::Revived;
                source.finished = Some(chrono::Utc::now());
                scope.save(&source).await?;
            }
            if scope.process.is_finished() {
                scope.process.reopen();
                info!(process_id = %scope.process.id, "process reopened by revive");
            }

            let mut copy = Task::new(source.process_id, source.node.clone(), source.token.clone())
                .with_previous(source.previous.clone());
            copy.owner_permission = source.owner_permission.clone();
            copy.data = source.data.clone();
            let mut copy = scope.storage().create_task(copy).await?;
            info!(task_id = %source.id, copy_id = %copy.id, node = %copy.node, "task revived");

            let flow = scope.flow.clone();
            let act = activation(&flow, flow.node_index(&copy.node)?);
            let progress = act.activate(&mut scope, &mut copy).await;
            scope.resume(act.as_ref(), copy, progress).await
        }
        .await;
        self.finish(scope, result).await
    }

    /// Re-run the domain logic of an ERROR task in place.
    pub async fn retry(&self, task: TaskId, caller: &Caller) -> Result<Task> {
        let (mut scope, mut task) = self.open_task(task, caller).await?;
        let result: Result<Task> = async {
            scope.guard(&task, Transition::Retry)?;
            scope.permit("retry", &task, |policy, user| policy.can_manage(user, &task))?;

            let flow = scope.flow.clone();
            let act = activation(&flow, flow.node_index(&task.node)?);
            task.error = None;
            info!(task_id = %task.id, node = %task.node, "task retried");
            let progress = act.retry(&mut scope, &mut task).await;
            scope.resume(act.as_ref(), task, progress).await
        }
        .await;
        self.finish(scope, result).await
    }

    // ========================================================================
    // Scope plumbing
    // ========================================================================

    /// Lock the process owning `task` and load the task under the lock.
    async fn open_task(&self, task: TaskId, caller: &Caller) -> Result<(Scope, Task)> {
        let snapshot = self.core.storage.load_task(task).await?;
        let scope = Scope::open(self.core.clone(), caller, snapshot.process_id).await?;
        let loaded = scope.storage().load_task(task).await;
        match loaded {
            Ok(task) => Ok((scope, task)),
            Err(e) => {
                if let (Err(close), _) = scope.close(Ok(())).await {
                    warn!(error = %close, "failed to close scope");
                }
                Err(e)
            }
        }
    }

    async fn finish<T>(&self, scope: Scope, result: Result<T>) -> Result<T> {
        let (result, effects) = scope.close(result).await;
        if !effects.is_empty() {
            self.after(effects).await;
        }
        result
    }

    /// Apply effects collected under a lock that is now released.
    fn after(&self, effects: Effects) -> BoxFuture<'_, ()> {
        async move {
            let mut finished_children = Vec::new();
            for event in effects.events {
                if let FlowEvent::FlowFinished {
                    parent_task: Some(parent),
                    ..
                } = &event
                {
                    finished_children.push(*parent);
                }
                self.core.events.publish(event);
            }

            for request in effects.jobs {
                if let Err(e) = self.core.jobs.dispatch(request.clone()).await {
                    error!(job = %request.job, task_id = %request.task, error = %e, "job dispatch failed");
                }
            }

            for spawn in effects.spawns {
                let started = self
                    .start_inner(&spawn.flow, &spawn.start_node, spawn.data, Some(spawn.parent_task), &Caller::system())
                    .await;
                match started {
                    Ok(child) => debug!(parent_task = %spawn.parent_task, child = %child.id, "subprocess started"),
                    Err(e) => error!(parent_task = %spawn.parent_task, flow = %spawn.flow, error = %e, "subprocess start failed"),
                }
            }

            for child in effects.cancel_processes {
                if let Err(e) = self.cancel_process(child, &Caller::system()).await {
                    error!(process_id = %child, error = %e, "child process cancel failed");
                }
            }

            for parent in finished_children {
                if let Err(e) = self.complete_subprocess(parent, &Caller::system()).await {
                    warn!(task_id = %parent, error = %e, "parent task not completed");
                }
            }
        }
        .boxed()
    }
}

/// Assembles a [`FlowEngine`].
///
/// Defaults: in-memory storage, a cache lock with a 60s TTL and the default
/// retry policy, [`AllowAll`] permissions and a [`QueuedJobDispatcher`].
#[derive(Default)]
pub struct FlowEngineBuilder {
    registry: Option<Arc<FlowRegistry>>,
    flows: Vec<Arc<Flow>>,
    storage: Option<Arc<dyn FlowStorage>>,
    row_locker: Option<Arc<dyn RowLocker>>,
    lock: Option<Arc<dyn ProcessLock>>,
    permissions: Option<Arc<dyn PermissionPolicy>>,
    jobs: Option<Arc<dyn JobDispatcher>>,
    events: Option<EventBus>,
}

impl FlowEngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flow(mut self, flow: Arc<Flow>) -> Self {
        self.flows.push(flow);
        self
    }

    pub fn with_registry(mut self, registry: Arc<FlowRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Storage that can also serve as the row lock backend.
    pub fn with_storage<S>(mut self, storage: Arc<S>) -> Self
    where
        S: FlowStorage + RowLocker + 'static,
    {
        self.storage = Some(storage.clone());
        self.row_locker = Some(storage);
        self
    }

    /// Storage without row locks; pair it with a non-row lock backend.
    pub fn with_plain_storage(mut self, storage: Arc<dyn FlowStorage>) -> Self {
        self.storage = Some(storage);
        self.row_locker = None;
        self
    }

    pub fn with_lock(mut self, lock: Arc<dyn ProcessLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn with_permissions(mut self, permissions: Arc<dyn PermissionPolicy>) -> Self {
        self.permissions = Some(permissions);
        self
    }

    pub fn with_jobs(mut self, jobs: Arc<dyn JobDispatcher>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    fn default_storage(&mut self) {
        if self.storage.is_none() {
            let storage = Arc::new(InMemoryStorage::new());
            self.storage = Some(storage.clone());
            self.row_locker = Some(storage);
        }
    }

    pub fn build(mut self) -> FlowEngine {
        self.default_storage();
        let lock = self
            .lock
            .take()
            .unwrap_or_else(|| Arc::new(CacheLock::new(Duration::from_secs(60), LockRetryPolicy::default())));
        self.assemble(lock, EventBus::default())
    }

    /// Build with the lock backend and event buffer from `config`.
    ///
    /// A lock set with [`with_lock`](Self::with_lock) takes precedence.
    pub async fn build_from_config(mut self, config: &EngineConfig) -> Result<FlowEngine> {
        self.default_storage();
        let lock = match self.lock.take() {
            Some(lock) => lock,
            None => {
                let locker = self.row_locker.clone().ok_or_else(|| {
                    FlowError::Config(config::ConfigError::Message(
                        "row lock backend needs a storage that supports row locks".to_string(),
                    ))
                })?;
                config.lock.build(locker).await?
            }
        };
        Ok(self.assemble(lock, EventBus::new(config.event_buffer)))
    }

    fn assemble(self, lock: Arc<dyn ProcessLock>, default_events: EventBus) -> FlowEngine {
        let registry = self.registry.unwrap_or_else(|| Arc::new(FlowRegistry::new()));
        for flow in self.flows {
            registry.register(flow);
        }
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(InMemoryStorage::new()) as Arc<dyn FlowStorage>);

        let core = EngineCore {
            registry,
            storage,
            lock,
            permissions: self.permissions.unwrap_or_else(|| Arc::new(AllowAll)),
            events: self.events.unwrap_or(default_events),
            jobs: self.jobs.unwrap_or_else(|| Arc::new(QueuedJobDispatcher::new())),
        };
        info!(lock = core.lock.name(), flows = core.registry.references().len(), "flow engine ready");
        FlowEngine { core: Arc::new(core) }
    }
}
