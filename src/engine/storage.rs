// Storage abstraction for the flow engine
// This defines the interface for persisting processes and tasks

//! # Storage Abstraction Layer
//!
//! The engine never talks to a database directly. Everything goes through
//! the [`FlowStorage`] repository trait so the same activation code runs
//! against memory in tests and against a real store in production.
//!
//! ## Contract
//!
//! - Records are created once, then replaced wholesale by `update_*`.
//! - Every write performed while a process lock is held must be durable
//!   before the lock is released.
//! - Task records are never deleted, except by [`FlowStorage::rollback`]
//!   undoing a failed operation.
//!
//! ## Rollback
//!
//! A locked operation starts from a [`Checkpoint`] of its process. If the
//! operation fails, the engine hands the checkpoint back to `rollback`,
//! which restores the process and its tasks and drops tasks created since.
//! This relies on the process lock: with `NoLock`, a rollback can discard a
//! concurrent caller's writes.
//!
//! ## Rust Learning Notes:
//!
//! ### Async Traits
//! The `async-trait` crate turns `async fn` in a trait into methods that
//! return boxed futures, which keeps the trait usable as `Arc<dyn FlowStorage>`.
//!
//! ### Default Trait Methods
//! `load_task` and `load_process` are written once in the trait on top of
//! `get_task` / `get_process`; implementors get them for free.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use dashmap::DashMap;

use super::lock::{LockKey, LockLease, RowLocker};
use crate::models::{Process, ProcessId, Task, TaskId, TaskStatus};
use crate::{FlowError, Result};

/// Records of one process as they stood when a locked operation began.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub process_id: ProcessId,
    /// `None` when the operation itself created the process.
    pub process: Option<Process>,
    pub tasks: Vec<Task>,
}

impl Checkpoint {
    /// Checkpoint of a process that did not exist before the operation.
    pub fn absent(process_id: ProcessId) -> Self {
        Checkpoint {
            process_id,
            process: None,
            tasks: Vec::new(),
        }
    }
}

/// Repository for process and task records.
#[async_trait::async_trait]
pub trait FlowStorage: Send + Sync {
    /// Persist a new process and return it with its assigned id.
    async fn create_process(&self, process: Process) -> Result<Process>;

    async fn get_process(&self, id: ProcessId) -> Result<Option<Process>>;

    /// Replace an existing process record.
    async fn update_process(&self, process: Process) -> Result<Process>;

    /// Persist a new task and return it with its assigned id.
    async fn create_task(&self, task: Task) -> Result<Task>;

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>>;

    /// Replace an existing task record.
    async fn update_task(&self, task: Task) -> Result<Task>;

    /// Every task of a process, oldest first.
    async fn process_tasks(&self, process: ProcessId) -> Result<Vec<Task>>;

    /// Tasks of one node in one process. An empty `statuses` slice matches any status.
    async fn find_tasks(&self, process: ProcessId, node: &str, statuses: &[TaskStatus]) -> Result<Vec<Task>>;

    /// Tasks created directly from `task`.
    async fn leading_tasks(&self, task: TaskId) -> Result<Vec<Task>>;

    /// Child processes spawned by a subprocess task.
    async fn processes_by_parent(&self, parent: TaskId) -> Result<Vec<Process>>;

    async fn load_task(&self, id: TaskId) -> Result<Task> {
        self.get_task(id)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("task {}", id)))
    }

    async fn load_process(&self, id: ProcessId) -> Result<Process> {
        self.get_process(id)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("process {}", id)))
    }

    /// Snapshot a process and its tasks.
    async fn checkpoint(&self, process: ProcessId) -> Result<Checkpoint> {
        Ok(Checkpoint {
            process_id: process,
            process: Some(self.load_process(process).await?),
            tasks: self.process_tasks(process).await?,
        })
    }

    /// Restore a process and its tasks to `checkpoint`, removing tasks
    /// created since. An absent process is removed along with its tasks.
    async fn rollback(&self, checkpoint: Checkpoint) -> Result<()>;
}

/// In-memory storage implementation for development and testing
///
/// ## Limitations
///
/// - **Not persistent**: data is lost when the process restarts
/// - **Not distributed**: row locks only exclude callers in this process
///
/// ## Rust Learning Notes:
///
/// ### RwLock Poisoning
/// A `std::sync::RwLock` becomes "poisoned" if a thread panics while
/// holding it. Rather than `unwrap()`, poison is mapped into a
/// `FlowError::Storage` so callers see an ordinary error.
#[derive(Default)]
pub struct InMemoryStorage {
    processes: RwLock<BTreeMap<ProcessId, Process>>,
    tasks: RwLock<BTreeMap<TaskId, Task>>,
    next_process: AtomicU64,
    next_task: AtomicU64,

    /// One async mutex per process, standing in for a database row lock
    rows: DashMap<ProcessId, Arc<tokio::sync::Mutex<()>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: PoisonError<T>) -> FlowError {
    FlowError::Storage(anyhow::anyhow!("in-memory storage lock poisoned"))
}

#[async_trait::async_trait]
impl FlowStorage for InMemoryStorage {
    async fn create_process(&self, mut process: Process) -> Result<Process> {
        process.id = ProcessId(self.next_process.fetch_add(1, Ordering::SeqCst) + 1);
        let mut processes = self.processes.write().map_err(poisoned)?;
        processes.insert(process.id, process.clone());
        Ok(process)
    }

    async fn get_process(&self, id: ProcessId) -> Result<Option<Process>> {
        let processes = self.processes.read().map_err(poisoned)?;
        Ok(processes.get(&id).cloned())
    }

    async fn update_process(&self, process: Process) -> Result<Process> {
        let mut processes = self.processes.write().map_err(poisoned)?;
        match processes.get_mut(&process.id) {
            Some(slot) => {
                *slot = process.clone();
                Ok(process)
            }
            None => Err(FlowError::NotFound(format!("process {}", process.id))),
        }
    }

    async fn create_task(&self, mut task: Task) -> Result<Task> {
        task.id = TaskId(self.next_task.fetch_add(1, Ordering::SeqCst) + 1);
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        let tasks = self.tasks.read().map_err(poisoned)?;
        Ok(tasks.get(&id).cloned())
    }

    async fn update_task(&self, task: Task) -> Result<Task> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        match tasks.get_mut(&task.id) {
            Some(slot) => {
                *slot = task.clone();
                Ok(task)
            }
            None => Err(FlowError::NotFound(format!("task {}", task.id))),
        }
    }

    async fn process_tasks(&self, process: ProcessId) -> Result<Vec<Task>> {
        let tasks = self.tasks.read().map_err(poisoned)?;
        Ok(tasks.values().filter(|t| t.process_id == process).cloned().collect())
    }

    async fn find_tasks(&self, process: ProcessId, node: &str, statuses: &[TaskStatus]) -> Result<Vec<Task>> {
        let tasks = self.tasks.read().map_err(poisoned)?;
        Ok(tasks
            .values()
            .filter(|t| t.process_id == process && t.node == node)
            .filter(|t| statuses.is_empty() || statuses.contains(&t.status))
            .cloned()
            .collect())
    }

    async fn leading_tasks(&self, task: TaskId) -> Result<Vec<Task>> {
        let tasks = self.tasks.read().map_err(poisoned)?;
        Ok(tasks.values().filter(|t| t.previous.contains(&task)).cloned().collect())
    }

    async fn processes_by_parent(&self, parent: TaskId) -> Result<Vec<Process>> {
        let processes = self.processes.read().map_err(poisoned)?;
        Ok(processes
            .values()
            .filter(|p| p.parent_task == Some(parent))
            .cloned()
            .collect())
    }

    async fn rollback(&self, checkpoint: Checkpoint) -> Result<()> {
        let Checkpoint {
            process_id,
            process,
            tasks: saved,
        } = checkpoint;
        {
            let mut tasks = self.tasks.write().map_err(poisoned)?;
            tasks.retain(|_, task| task.process_id != process_id);
            tasks.extend(saved.into_iter().map(|task| (task.id, task)));
        }
        let mut processes = self.processes.write().map_err(poisoned)?;
        match process {
            Some(process) => {
                processes.insert(process_id, process);
            }
            None => {
                processes.remove(&process_id);
            }
        }
        Ok(())
    }
}

/// Lease on an in-memory "row": the owned mutex guard.
struct MemoryRowLease(Option<tokio::sync::OwnedMutexGuard<()>>);

#[async_trait::async_trait]
impl LockLease for MemoryRowLease {
    async fn release(&mut self) -> Result<()> {
        self.0.take();
        Ok(())
    }
}

#[async_trait::async_trait]
impl RowLocker for InMemoryStorage {
    async fn try_lock_row(&self, key: &LockKey) -> Result<Option<Box<dyn LockLease>>> {
        let row = self
            .rows
            .entry(key.process)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        Ok(row
            .try_lock_owned()
            .ok()
            .map(|guard| Box::new(MemoryRowLease(Some(guard))) as Box<dyn LockLease>))
    }
}
