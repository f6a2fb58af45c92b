// Job dispatch - hands scheduled Job tasks to background workers

//! # Job Dispatch
//!
//! A Job activation only records *what* must run. The engine turns each
//! [`JobRequest`] collected under the process lock into a dispatch after
//! the lock is released. Dispatchers decide where the work goes:
//!
//! - [`QueuedJobDispatcher`]: keeps requests in memory until someone drains
//!   them (tests, the CLI demo, hand-cranked workers)
//! - [`ChannelJobDispatcher`]: pushes requests into a Tokio channel that a
//!   worker spawned with [`spawn_job_worker`] consumes
//!
//! A real deployment would put a broker behind [`JobDispatcher`]; the
//! request is plain serde data so it can cross a process boundary.
//!
//! ## Rust Learning Notes:
//!
//! ### Unbounded Channels
//! `mpsc::unbounded_channel` never blocks the sender. Dispatch happens
//! right after an engine operation, so a slow worker must not stall it.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::flow_engine::FlowEngine;
use super::Caller;
use crate::models::{ProcessId, TaskId};
use crate::{FlowError, Result};

/// A scheduled Job task waiting for a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Node reference of the job, `app/path.Flow.node`
    pub job: String,
    pub process: ProcessId,
    pub task: TaskId,
}

/// Destination for scheduled jobs.
#[async_trait::async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn dispatch(&self, request: JobRequest) -> Result<()>;
}

/// Holds requests in memory until drained.
#[derive(Debug, Default)]
pub struct QueuedJobDispatcher {
    queue: Mutex<VecDeque<JobRequest>>,
}

impl QueuedJobDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every queued request, oldest first.
    pub fn drain(&self) -> Vec<JobRequest> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl JobDispatcher for QueuedJobDispatcher {
    async fn dispatch(&self, request: JobRequest) -> Result<()> {
        debug!(job = %request.job, task_id = %request.task, "job queued");
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(request);
        Ok(())
    }
}

/// Sends requests to a worker over a Tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelJobDispatcher {
    sender: mpsc::UnboundedSender<JobRequest>,
}

impl ChannelJobDispatcher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<JobRequest>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait::async_trait]
impl JobDispatcher for ChannelJobDispatcher {
    async fn dispatch(&self, request: JobRequest) -> Result<()> {
        self.sender
            .send(request)
            .map_err(|e| FlowError::Storage(anyhow::anyhow!("job channel closed: {}", e)))
    }
}

/// Run jobs from `receiver` until every sender is dropped.
///
/// The worker calls [`FlowEngine::run_job`] as a capturing system caller,
/// so a failing job ends up as an ERROR task instead of killing the loop.
pub fn spawn_job_worker(engine: FlowEngine, mut receiver: mpsc::UnboundedReceiver<JobRequest>) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("job worker started");
        while let Some(request) = receiver.recv().await {
            if let Err(e) = engine.run_job(&request, &Caller::worker()).await {
                error!(job = %request.job, task_id = %request.task, error = %e, "job run failed");
            }
        }
        info!("job worker stopped");
    })
}
