// Flowkeeper - Rust Edition
// A human-task workflow engine with branch tokens, process locks and undo/revive

//! # Flowkeeper Library
//!
//! Flowkeeper drives business processes modelled as directed graphs of typed
//! nodes. Each running process is a [`Process`] record; each visit to a node
//! is a [`Task`] record that moves through a small status machine.
//!
//! ## Core Components
//!
//! ### Domain Models ([`models`])
//! - [`Token`]: branch lineage used to synchronise parallel gateways
//! - [`Task`] / [`Process`]: the persisted records
//! - [`TaskStatus`] / [`Transition`]: the guarded task life cycle
//!
//! ### Flow Graph ([`flow`])
//! - [`Flow`]: an immutable node graph built once per flow type
//! - [`NodeSpec`]: builders for Start, View, Function, Handle, Job, If,
//!   Switch, Split, Join, Subprocess and End nodes
//! - [`FlowRegistry`]: resolves `"{app}/{module.path}.{Flow}.{node}"` strings
//!
//! ### Engine ([`engine`])
//! - [`FlowEngine`]: every mutating entry point, each run under a process lock
//! - [`ProcessLock`]: no-op, row, cache and NATS KV lock backends
//! - [`FlowStorage`]: the persistence contract, with [`InMemoryStorage`]
//! - [`EventBus`]: lifecycle notifications published after the lock is released
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use flowkeeper::{Caller, Flow, FlowEngine, NodeSpec};
//!
//! # async fn run() -> flowkeeper::Result<()> {
//! let flow = Flow::builder("helpdesk", "tickets.flows.TicketFlow")
//!     .node("start", NodeSpec::start().next("triage"))
//!     .node("triage", NodeSpec::handle().next("end"))
//!     .node("end", NodeSpec::end())
//!     .build()?;
//!
//! let engine = FlowEngine::builder().flow(flow.clone()).build();
//! let process = engine
//!     .start_process(&flow.reference(), "start", serde_json::json!({}), &Caller::system())
//!     .await?;
//! let triage = engine.storage().find_tasks(process.id, "triage", &[]).await?;
//! engine.run_handle(triage[0].id, &Caller::system()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Rust Learning Notes:
//!
//! ### Re-exports
//! `pub use` statements create shortcuts so users don't need to know the
//! internal module structure: `flowkeeper::Task` instead of
//! `flowkeeper::models::task::Task`.

pub mod engine;
pub mod flow;
pub mod models;

pub use models::{Process, ProcessId, ProcessStatus, Task, TaskId, TaskStatus, Token, Transition};

pub use flow::{Edge, EdgeKind, Flow, FlowBuilder, FlowRegistry, NodeKind, NodeSpec};

pub use engine::{
    config::{EngineConfig, LockBackend, LockSettings},
    events::{EventBus, FlowEvent},
    flow_engine::{FlowEngine, FlowEngineBuilder},
    jobs::{JobDispatcher, JobRequest, QueuedJobDispatcher},
    lock::{CacheLock, LockKey, LockRetryPolicy, NoLock, ProcessLock, RowLock},
    permissions::{AllowAll, PermissionPolicy, RolePermissions},
    storage::{Checkpoint, FlowStorage, InMemoryStorage},
    Caller, ErrorPolicy,
};

use thiserror::Error;

/// Errors raised by flowkeeper operations.
///
/// The variants follow four families:
/// - a rejected transition (wrong source status, missing permission)
/// - a failing domain callback, the only kind that may be captured onto a task
/// - a graph inconsistency (no viable branch, duplicate join instances)
/// - infrastructure failures (lock, storage, config)
///
/// ## Rust Learning Notes:
///
/// ### The `thiserror` Crate
/// - `#[derive(Error)]` implements `std::error::Error`
/// - `#[error("...")]` provides the `Display` message
/// - `#[source]` and `#[from]` keep the underlying cause in the error chain
#[derive(Error, Debug)]
pub enum FlowError {
    /// A transition was attempted from a status that does not permit it
    #[error("Transition `{transition}` not allowed for task {task} in status {status}")]
    TransitionNotAllowed {
        task: TaskId,
        transition: Transition,
        status: TaskStatus,
    },

    /// The permission policy refused the acting user
    #[error("Permission denied: {user} may not {action} task {task}")]
    PermissionDenied {
        user: String,
        action: &'static str,
        task: TaskId,
    },

    /// The permission policy refused to let the user start a process
    #[error("Permission denied: {user} may not start a process at `{node}`")]
    StartDenied { user: String, node: String },

    /// A user-supplied callback (handler, condition or job) failed
    #[error("Callback failed on node `{node}`: {source}")]
    Callback {
        node: String,
        #[source]
        source: anyhow::Error,
    },

    /// A Split or Switch had no successor to activate
    #[error("No active branch out of node `{node}` in task {task}")]
    NoActiveBranch { node: String, task: TaskId },

    /// More than one live Join task exists for one node of one process
    #[error("Found {count} live instances of join `{node}` in process {process}")]
    MultipleJoinInstances {
        node: String,
        process: ProcessId,
        count: usize,
    },

    /// Tasks arriving at a Join came from different split operations
    #[error("Join `{node}` received tokens from different splits: {prefixes:?}")]
    InconsistentJoinTokens { node: String, prefixes: Vec<String> },

    /// The process is already DONE or CANCELED
    #[error("Process {process} is already {status}")]
    ProcessFinished { process: ProcessId, status: ProcessStatus },

    /// The process lock could not be taken within the attempt budget
    #[error("Could not acquire lock `{key}` after {attempts} attempts")]
    LockAcquisitionFailed { key: String, attempts: u32 },

    #[error("Unknown flow: {0}")]
    UnknownFlow(String),

    #[error("Unknown node `{node}` in flow {flow}")]
    UnknownNode { flow: String, node: String },

    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    /// The flow graph is malformed
    #[error("Invalid flow definition: {0}")]
    FlowDefinition(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl FlowError {
    pub(crate) fn callback(node: &str, source: anyhow::Error) -> Self {
        FlowError::Callback {
            node: node.to_string(),
            source,
        }
    }

    /// Errors that indicate a malformed graph or a locking bug. Always fatal.
    pub fn is_graph_inconsistency(&self) -> bool {
        matches!(
            self,
            FlowError::NoActiveBranch { .. }
                | FlowError::MultipleJoinInstances { .. }
                | FlowError::InconsistentJoinTokens { .. }
        )
    }

    /// Errors that may be recorded on a task as ERROR under a capturing caller.
    pub fn is_capturable(&self) -> bool {
        matches!(self, FlowError::Callback { .. })
    }
}

/// Type alias for Results that use the crate error type
pub type Result<T> = std::result::Result<T, FlowError>;
