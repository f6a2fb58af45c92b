// Node definitions - the typed vertices of a flow graph

//! # Nodes
//!
//! A node is declared with symbolic references to its successors
//! (`NodeSpec`, references are `String` names) and resolved by
//! [`FlowBuilder::build`](super::FlowBuilder::build) into a [`Node`] whose
//! references are indices into the flow's node table. Both phases share
//! the [`Behavior`] enum, parameterised over the reference type.
//!
//! ```rust
//! use flowkeeper::flow::NodeSpec;
//!
//! let review = NodeSpec::view()
//!     .permission("documents.review")
//!     .next("decide");
//! let decide = NodeSpec::if_(|process, _task| Ok(process.data["approved"] == true))
//!     .then("publish")
//!     .otherwise("review");
//! # let _ = (review, decide);
//! ```
//!
//! ## Rust Learning Notes:
//!
//! ### Generic Parameters with Defaults
//! `Node<R = NodeIndex>` means "a node whose references are of type `R`",
//! defaulting to resolved indices. `NodeSpec` is just `Node<String>`.
//!
//! ### Closures Behind `Arc<dyn Fn>`
//! Callbacks are stored as `Arc<dyn Fn(..) + Send + Sync>` so a single flow
//! definition can be shared by every process and thread without copying.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};

use crate::models::{Process, ProcessId, Task, TaskId};

/// Position of a node inside its flow's node table.
pub type NodeIndex = usize;

/// A node declared with unresolved, name-based references.
pub type NodeSpec = Node<String>;

/// Coarse classification of a node, used for reporting and diagrams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeKind {
    Start,
    Human,
    Function,
    Job,
    ExclusiveGateway,
    ParallelGateway,
    Join,
    Subprocess,
    End,
}

/// Mutable view handed to synchronous node callbacks.
pub struct TaskContext<'a> {
    pub process: &'a mut Process,
    pub task: &'a mut Task,
    /// Acting user, `None` for system-driven activations.
    pub user: Option<&'a str>,
}

/// Owned snapshot handed to background job callbacks.
///
/// Jobs run without the process lock, so they receive copies rather than
/// references. The JSON a job returns is merged into the task's data.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub process_id: ProcessId,
    pub task_id: TaskId,
    pub process_data: serde_json::Value,
    pub task_data: serde_json::Value,
}

/// User code attached to Start, View, Function and Handle nodes.
#[derive(Clone)]
pub struct TaskCallback(Arc<dyn Fn(&mut TaskContext<'_>) -> anyhow::Result<()> + Send + Sync>);

impl TaskCallback {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut TaskContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        TaskCallback(Arc::new(f))
    }

    pub fn call(&self, ctx: &mut TaskContext<'_>) -> anyhow::Result<()> {
        (self.0)(ctx)
    }
}

/// Boolean guard evaluated against the current process and task.
#[derive(Clone)]
pub struct Condition(Arc<dyn Fn(&Process, &Task) -> anyhow::Result<bool> + Send + Sync>);

impl Condition {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Process, &Task) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        Condition(Arc::new(f))
    }

    pub fn evaluate(&self, process: &Process, task: &Task) -> anyhow::Result<bool> {
        (self.0)(process, task)
    }
}

/// Asynchronous body of a Job node.
#[derive(Clone)]
pub struct JobCallback(
    Arc<dyn Fn(JobContext) -> BoxFuture<'static, anyhow::Result<serde_json::Value>> + Send + Sync>,
);

impl JobCallback {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        JobCallback(Arc::new(move |ctx| f(ctx).boxed()))
    }

    pub fn call(&self, ctx: JobContext) -> BoxFuture<'static, anyhow::Result<serde_json::Value>> {
        (self.0)(ctx)
    }
}

impl fmt::Debug for TaskCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TaskCallback(..)")
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Condition(..)")
    }
}

impl fmt::Debug for JobCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JobCallback(..)")
    }
}

/// Node-specific configuration, generic over the successor reference type.
#[derive(Debug, Clone)]
pub enum Behavior<R> {
    Start {
        next: Option<R>,
        handler: Option<TaskCallback>,
    },
    View {
        next: Option<R>,
        handler: Option<TaskCallback>,
    },
    Function {
        next: Option<R>,
        callback: TaskCallback,
    },
    Handle {
        next: Option<R>,
        callback: Option<TaskCallback>,
    },
    Job {
        next: Option<R>,
        job: JobCallback,
    },
    If {
        condition: Condition,
        on_true: Option<R>,
        on_false: Option<R>,
    },
    Switch {
        cases: Vec<(R, Condition)>,
        default: Option<R>,
    },
    Split {
        branches: Vec<(R, Option<Condition>)>,
    },
    Join {
        next: Option<R>,
        wait_all: bool,
    },
    Subprocess {
        next: Option<R>,
        flow: String,
        start_node: String,
    },
    End {
        terminate: bool,
    },
}

/// Diagnostic class of an edge. Routing never looks at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Next,
    CondTrue,
    CondFalse,
    Default,
}

impl<R> Behavior<R> {
    pub fn kind(&self) -> NodeKind {
        match self {
            Behavior::Start { .. } => NodeKind::Start,
            Behavior::View { .. } => NodeKind::Human,
            Behavior::Function { .. } | Behavior::Handle { .. } => NodeKind::Function,
            Behavior::Job { .. } => NodeKind::Job,
            Behavior::If { .. } | Behavior::Switch { .. } => NodeKind::ExclusiveGateway,
            Behavior::Split { .. } => NodeKind::ParallelGateway,
            Behavior::Join { .. } => NodeKind::Join,
            Behavior::Subprocess { .. } => NodeKind::Subprocess,
            Behavior::End { .. } => NodeKind::End,
        }
    }

    /// Short lowercase label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            Behavior::Start { .. } => "start",
            Behavior::View { .. } => "view",
            Behavior::Function { .. } => "function",
            Behavior::Handle { .. } => "handle",
            Behavior::Job { .. } => "job",
            Behavior::If { .. } => "if",
            Behavior::Switch { .. } => "switch",
            Behavior::Split { .. } => "split",
            Behavior::Join { .. } => "join",
            Behavior::Subprocess { .. } => "subprocess",
            Behavior::End { .. } => "end",
        }
    }

    /// Every outgoing reference with its diagnostic class.
    pub fn outgoing(&self) -> Vec<(&R, EdgeKind)> {
        match self {
            Behavior::Start { next, .. }
            | Behavior::View { next, .. }
            | Behavior::Function { next, .. }
            | Behavior::Handle { next, .. }
            | Behavior::Job { next, .. }
            | Behavior::Join { next, .. }
            | Behavior::Subprocess { next, .. } => {
                next.iter().map(|n| (n, EdgeKind::Next)).collect()
            }
            Behavior::If { on_true, on_false, .. } => on_true
                .iter()
                .map(|n| (n, EdgeKind::CondTrue))
                .chain(on_false.iter().map(|n| (n, EdgeKind::CondFalse)))
                .collect(),
            Behavior::Switch { cases, default } => cases
                .iter()
                .map(|(n, _)| (n, EdgeKind::CondTrue))
                .chain(default.iter().map(|n| (n, EdgeKind::Default)))
                .collect(),
            Behavior::Split { branches } => branches
                .iter()
                .map(|(n, condition)| {
                    let kind = if condition.is_some() { EdgeKind::CondTrue } else { EdgeKind::Next };
                    (n, kind)
                })
                .collect(),
            Behavior::End { .. } => Vec::new(),
        }
    }

    /// Names of required successor slots that were never filled.
    pub fn missing_successors(&self) -> Vec<&'static str> {
        match self {
            Behavior::Start { next: None, .. }
            | Behavior::View { next: None, .. }
            | Behavior::Function { next: None, .. }
            | Behavior::Handle { next: None, .. }
            | Behavior::Job { next: None, .. }
            | Behavior::Join { next: None, .. }
            | Behavior::Subprocess { next: None, .. } => vec!["next"],
            Behavior::If { on_true, on_false, .. } => {
                let mut missing = Vec::new();
                if on_true.is_none() {
                    missing.push("then");
                }
                if on_false.is_none() {
                    missing.push("otherwise");
                }
                missing
            }
            Behavior::Switch { cases, default: None } if cases.is_empty() => vec!["case"],
            Behavior::Split { branches } if branches.is_empty() => vec!["branch"],
            _ => Vec::new(),
        }
    }

    /// Replace every reference through `resolve`, failing on the first error.
    pub fn try_map<T, E>(self, mut resolve: impl FnMut(R) -> Result<T, E>) -> Result<Behavior<T>, E> {
        let mut opt = |r: Option<R>| r.map(&mut resolve).transpose();
        Ok(match self {
            Behavior::Start { next, handler } => Behavior::Start { next: opt(next)?, handler },
            Behavior::View { next, handler } => Behavior::View { next: opt(next)?, handler },
            Behavior::Function { next, callback } => Behavior::Function { next: opt(next)?, callback },
            Behavior::Handle { next, callback } => Behavior::Handle { next: opt(next)?, callback },
            Behavior::Job { next, job } => Behavior::Job { next: opt(next)?, job },
            Behavior::If { condition, on_true, on_false } => Behavior::If {
                condition,
                on_true: opt(on_true)?,
                on_false: opt(on_false)?,
            },
            Behavior::Switch { cases, default } => {
                let default = opt(default)?;
                let cases = cases
                    .into_iter()
                    .map(|(r, condition)| resolve(r).map(|t| (t, condition)))
                    .collect::<Result<Vec<_>, E>>()?;
                Behavior::Switch { cases, default }
            }
            Behavior::Split { branches } => Behavior::Split {
                branches: branches
                    .into_iter()
                    .map(|(r, condition)| resolve(r).map(|t| (t, condition)))
                    .collect::<Result<Vec<_>, E>>()?,
            },
            Behavior::Join { next, wait_all } => Behavior::Join { next: opt(next)?, wait_all },
            Behavior::Subprocess { next, flow, start_node } => Behavior::Subprocess {
                next: opt(next)?,
                flow,
                start_node,
            },
            Behavior::End { terminate } => Behavior::End { terminate },
        })
    }
}

/// A vertex of a flow graph.
#[derive(Debug, Clone)]
pub struct Node<R = NodeIndex> {
    pub(crate) name: String,
    pub(crate) behavior: Behavior<R>,
    pub(crate) permission: Option<String>,
    pub(crate) description: Option<String>,
}

impl<R> Node<R> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> NodeKind {
        self.behavior.kind()
    }

    pub fn behavior(&self) -> &Behavior<R> {
        &self.behavior
    }

    pub fn is_join(&self) -> bool {
        matches!(self.behavior, Behavior::Join { .. })
    }
}

impl Node<NodeIndex> {
    /// Permission descriptor copied onto tasks created from this node.
    pub fn permission(&self) -> Option<&str> {
        self.permission.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

impl NodeSpec {
    fn spec(behavior: Behavior<String>) -> Self {
        Node {
            name: String::new(),
            behavior,
            permission: None,
            description: None,
        }
    }

    /// Process entry point. The start task completes as soon as it is created.
    pub fn start() -> Self {
        Self::spec(Behavior::Start { next: None, handler: None })
    }

    /// Human task: waits for assignment and execution by a user.
    pub fn view() -> Self {
        Self::spec(Behavior::View { next: None, handler: None })
    }

    /// Automatic step run inline while the process advances.
    pub fn function<F>(callback: F) -> Self
    where
        F: Fn(&mut TaskContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::spec(Behavior::Function { next: None, callback: TaskCallback::new(callback) })
    }

    /// Automatic step that waits until external code runs it.
    pub fn handle() -> Self {
        Self::spec(Behavior::Handle { next: None, callback: None })
    }

    /// Background step executed by a job worker.
    pub fn job<F, Fut>(job: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        Self::spec(Behavior::Job { next: None, job: JobCallback::new(job) })
    }

    /// Two-way decision gate.
    pub fn if_<F>(condition: F) -> Self
    where
        F: Fn(&Process, &Task) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        Self::spec(Behavior::If {
            condition: Condition::new(condition),
            on_true: None,
            on_false: None,
        })
    }

    /// Multi-way decision gate; first matching case wins.
    pub fn switch() -> Self {
        Self::spec(Behavior::Switch { cases: Vec::new(), default: None })
    }

    /// Parallel fan-out.
    pub fn split() -> Self {
        Self::spec(Behavior::Split { branches: Vec::new() })
    }

    /// Parallel fan-in that waits for every sibling branch.
    pub fn join() -> Self {
        Self::spec(Behavior::Join { next: None, wait_all: true })
    }

    /// Nested flow started from this node; completes when the child finishes.
    pub fn subprocess<F: Into<String>, S: Into<String>>(flow: F, start_node: S) -> Self {
        Self::spec(Behavior::Subprocess {
            next: None,
            flow: flow.into(),
            start_node: start_node.into(),
        })
    }

    pub fn end() -> Self {
        Self::spec(Behavior::End { terminate: false })
    }

    /// Set the single successor of a linear node.
    pub fn next<S: Into<String>>(mut self, target: S) -> Self {
        let target = Some(target.into());
        let label = self.behavior.label();
        match &mut self.behavior {
            Behavior::Start { next, .. }
            | Behavior::View { next, .. }
            | Behavior::Function { next, .. }
            | Behavior::Handle { next, .. }
            | Behavior::Job { next, .. }
            | Behavior::Join { next, .. }
            | Behavior::Subprocess { next, .. } => *next = target,
            Behavior::Split { branches } => branches.extend(target.map(|t| (t, None))),
            Behavior::If { .. } | Behavior::Switch { .. } | Behavior::End { .. } => {
                tracing::warn!(node = label, "next() ignored on this node kind");
            }
        }
        self
    }

    /// Add a guarded Split branch.
    pub fn branch_if<S, F>(mut self, target: S, condition: F) -> Self
    where
        S: Into<String>,
        F: Fn(&Process, &Task) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        if let Behavior::Split { branches } = &mut self.behavior {
            branches.push((target.into(), Some(Condition::new(condition))));
        }
        self
    }

    /// True branch of an If gate.
    pub fn then<S: Into<String>>(mut self, target: S) -> Self {
        if let Behavior::If { on_true, .. } = &mut self.behavior {
            *on_true = Some(target.into());
        }
        self
    }

    /// False branch of an If gate.
    pub fn otherwise<S: Into<String>>(mut self, target: S) -> Self {
        if let Behavior::If { on_false, .. } = &mut self.behavior {
            *on_false = Some(target.into());
        }
        self
    }

    /// Ordered Switch case.
    pub fn case<S, F>(mut self, target: S, condition: F) -> Self
    where
        S: Into<String>,
        F: Fn(&Process, &Task) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        if let Behavior::Switch { cases, .. } = &mut self.behavior {
            cases.push((target.into(), Condition::new(condition)));
        }
        self
    }

    /// Unconditional Switch fallback.
    pub fn default<S: Into<String>>(mut self, target: S) -> Self {
        if let Behavior::Switch { default, .. } = &mut self.behavior {
            *default = Some(target.into());
        }
        self
    }

    /// Attach a handler to Start, View or Handle nodes.
    pub fn on_execute<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut TaskContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let callback = Some(TaskCallback::new(f));
        let label = self.behavior.label();
        match &mut self.behavior {
            Behavior::Start { handler, .. } | Behavior::View { handler, .. } => *handler = callback,
            Behavior::Handle { callback: slot, .. } => *slot = callback,
            _ => tracing::warn!(node = label, "on_execute() ignored on this node kind"),
        }
        self
    }

    /// Let a Join proceed on the first arriving branch.
    pub fn wait_any(mut self) -> Self {
        if let Behavior::Join { wait_all, .. } = &mut self.behavior {
            *wait_all = false;
        }
        self
    }

    /// Make an End cancel every other active task before finishing.
    pub fn terminate(mut self) -> Self {
        if let Behavior::End { terminate } = &mut self.behavior {
            *terminate = true;
        }
        self
    }

    pub fn permission<S: Into<String>>(mut self, permission: S) -> Self {
        self.permission = Some(permission.into());
        self
    }

    pub fn description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = Some(description.into());
        self
    }
}
