// Parallel gateways: Split fans out on fresh branch tokens, Join fans back in

//! ## Split
//!
//! Each Split task draws from its own [`SplitTokenSource`](crate::models::SplitTokenSource),
//! one token per branch whose guard passes: `"{token}/{split_task}_{n}"`.
//!
//! ## Join
//!
//! A process has at most one live task per Join node. Every arriving branch
//! is added to its `previous` set and the join re-checks:
//!
//! 1. derive the common split prefix from the non-canceled predecessors
//!    (two different prefixes means two different splits feed this join,
//!    which is a graph error)
//! 2. the join is satisfied once no other task of the process carrying that
//!    prefix is still active
//!
//! A `wait_any` join completes on its first arrival; later siblings attach
//! to the finished join task without advancing past it.

use std::collections::BTreeSet;

use super::{single_next, NextActivation, NodeActivation, Progress, Scope};
use crate::flow::{Condition, Node, NodeIndex};
use crate::models::{Task, TaskStatus, Transition};
use crate::{FlowError, Result};

pub(crate) struct SplitActivation<'f> {
    pub node: &'f Node,
    pub branches: &'f [(NodeIndex, Option<Condition>)],
}

#[async_trait::async_trait]
impl NodeActivation for SplitActivation<'_> {
    fn node(&self) -> &Node {
        self.node
    }

    async fn activate(&self, scope: &mut Scope, task: &mut Task) -> Result<Progress> {
        scope.guard(task, Transition::Activate)?;
        scope.mark_started(task);
        Ok(Progress::Complete)
    }

    fn create_next(&self, scope: &Scope, task: &Task) -> Result<Vec<NextActivation>> {
        let mut tokens = task.token.split_token_source(task.id);
        let mut next = Vec::with_capacity(self.branches.len());

        for (node, guard) in self.branches {
            let live = match guard {
                Some(condition) => scope.evaluate(condition, task)?,
                None => true,
            };
            if !live {
                continue;
            }
            if let Some(token) = tokens.next() {
                next.push(NextActivation {
                    node: *node,
                    token,
                    previous: vec![task.id],
                });
            }
        }

        if next.is_empty() {
            return Err(FlowError::NoActiveBranch {
                node: self.node.name().to_string(),
                task: task.id,
            });
        }
        tracing::debug!(task_id = %task.id, node = %task.node, branches = next.len(), "split fanned out");
        Ok(next)
    }
}

pub(crate) struct JoinActivation<'f> {
    pub node: &'f Node,
    pub next: Option<NodeIndex>,
    pub wait_all: bool,
}

impl JoinActivation<'_> {
    /// The single live join task of this node, if any.
    async fn live_instance(&self, scope: &Scope) -> Result<Option<Task>> {
        let mut live = scope
            .storage()
            .find_tasks(scope.process.id, self.node.name(), &[TaskStatus::New, TaskStatus::Started])
            .await?;
        match live.len() {
            0 => Ok(None),
            1 => Ok(live.pop()),
            count => Err(FlowError::MultipleJoinInstances {
                node: self.node.name().to_string(),
                process: scope.process.id,
                count,
            }),
        }
    }

    async fn is_satisfied(&self, scope: &Scope, task: &Task) -> Result<bool> {
        if !self.wait_all {
            return Ok(true);
        }

        let mut prefixes = BTreeSet::new();
        let mut canceled = BTreeSet::new();
        for id in &task.previous {
            let previous = scope.storage().load_task(*id).await?;
            let prefix = previous.token.common_split_prefix();
            if previous.status == TaskStatus::Canceled {
                canceled.insert(prefix);
            } else {
                prefixes.insert(prefix);
            }
        }
        if prefixes.is_empty() {
            prefixes = canceled;
        }
        if prefixes.len() > 1 {
            return Err(FlowError::InconsistentJoinTokens {
                node: self.node.name().to_string(),
                prefixes: prefixes.into_iter().collect(),
            });
        }
        let Some(prefix) = prefixes.into_iter().next() else {
            return Ok(false);
        };

        let pending = scope
            .storage()
            .process_tasks(scope.process.id)
            .await?
            .into_iter()
            .filter(|t| t.id != task.id && t.is_active() && t.token.as_str().starts_with(prefix.as_str()))
            .count();
        tracing::debug!(task_id = %task.id, node = %task.node, prefix = %prefix, pending, "join checked");
        Ok(pending == 0)
    }
}

#[async_trait::async_trait]
impl NodeActivation for JoinActivation<'_> {
    fn node(&self) -> &Node {
        self.node
    }

    /// Find or create the join task and record the arriving branch on it.
    async fn enter(&self, scope: &mut Scope, next: NextActivation) -> Result<Task> {
        let joined = match self.live_instance(scope).await? {
            Some(task) => Some(task),
            None if !self.wait_all => {
                let base = next.token.base_split_token();
                scope
                    .storage()
                    .find_tasks(scope.process.id, self.node.name(), &[TaskStatus::Done])
                    .await?
                    .into_iter()
                    .find(|t| t.token == base)
            }
            None => None,
        };

        match joined {
            Some(mut task) => {
                for previous in next.previous {
                    task.add_previous(previous);
                }
                scope.save(&task).await?;
                Ok(task)
            }
            None => {
                let base = next.token.base_split_token();
                let arrival = NextActivation { token: base, ..next };
                scope.create_task(self.node, arrival).await
            }
        }
    }

    async fn activate(&self, scope: &mut Scope, task: &mut Task) -> Result<Progress> {
        match task.status {
            // Late arrival at an already finished wait_any join.
            TaskStatus::Done => return Ok(Progress::Wait),
            TaskStatus::New => scope.mark_started(task),
            TaskStatus::Started => {}
            _ => return Err(super::not_allowed(task, Transition::Activate)),
        }
        if self.is_satisfied(scope, task).await? {
            Ok(Progress::Complete)
        } else {
            Ok(Progress::Wait)
        }
    }

    fn create_next(&self, _scope: &Scope, task: &Task) -> Result<Vec<NextActivation>> {
        single_next(self.node, self.next, task)
    }
}
