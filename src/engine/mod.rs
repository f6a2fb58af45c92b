// Flowkeeper Engine
// Activation state machine, locking, persistence contract and side channels

//! # Engine Module
//!
//! The engine is the layer between the static [`Flow`](crate::Flow) graph and
//! the persisted [`Process`](crate::Process) / [`Task`](crate::Task) records.
//!
//! ## Engine Components
//!
//! - [`flow_engine`]: the [`FlowEngine`](flow_engine::FlowEngine) facade. Every
//!   public operation acquires the process lock, mutates, releases, and only
//!   then publishes events and dispatches jobs.
//! - `activation`: the per-node-kind task state machines and the
//!   `activate_next` driver that walks the graph.
//! - [`lock`] / [`nats_lock`]: process lock backends.
//! - [`storage`]: the repository trait and an in-memory implementation.
//! - [`events`], [`jobs`], [`permissions`], [`config`]: collaborators.
//!
//! ## Rust Learning Notes:
//!
//! ### Request-Scoped Settings
//! Whether callback errors propagate or are captured onto the task is a
//! property of the *call*, so it travels in the [`Caller`] value passed to
//! each entry point instead of living in global state.

pub(crate) mod activation;
pub mod config;
pub mod events;
pub mod flow_engine;
pub mod jobs;
pub mod lock;
pub mod nats_lock;
pub mod permissions;
pub mod storage;

#[cfg(test)]
mod scenario_tests;

pub use config::{EngineConfig, LockBackend, LockSettings};
pub use events::{EventBus, FlowEvent};
pub use flow_engine::{FlowEngine, FlowEngineBuilder};
pub use jobs::{spawn_job_worker, ChannelJobDispatcher, JobDispatcher, JobRequest, QueuedJobDispatcher};
pub use lock::{CacheLock, LockKey, LockLease, LockRetryPolicy, NoLock, PgRowLocker, ProcessLock, RowLock, RowLocker};
pub use nats_lock::NatsLock;
pub use permissions::{AllowAll, PermissionPolicy, RolePermissions};
pub use storage::{Checkpoint, FlowStorage, InMemoryStorage};

/// What to do when a user callback fails during an activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Return the error to the caller.
    #[default]
    Propagate,
    /// Record it on the task as ERROR, emit `TaskFailed` and carry on.
    Capture,
}

/// Identity and error policy of whoever invoked an engine operation.
#[derive(Debug, Clone, Default)]
pub struct Caller {
    /// `None` means the system itself; permission checks are skipped.
    pub user: Option<String>,
    pub error_policy: ErrorPolicy,
}

impl Caller {
    pub fn system() -> Self {
        Caller::default()
    }

    pub fn user<U: Into<String>>(user: U) -> Self {
        Caller {
            user: Some(user.into()),
            error_policy: ErrorPolicy::Propagate,
        }
    }

    /// System caller that captures callback failures, as job workers do.
    pub fn worker() -> Self {
        Caller {
            user: None,
            error_policy: ErrorPolicy::Capture,
        }
    }

    pub fn capturing(mut self) -> Self {
        self.error_policy = ErrorPolicy::Capture;
        self
    }

    pub fn is_system(&self) -> bool {
        self.user.is_none()
    }

    /// Name for logs.
    pub fn name(&self) -> &str {
        self.user.as_deref().unwrap_or("system")
    }
}
