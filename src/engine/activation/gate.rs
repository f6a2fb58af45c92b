// Decision gates: If and Switch route to exactly one successor

//! Gates do all their work in `create_next`. Because successors are
//! computed before the gate task is marked DONE, a Switch with no viable
//! case fails without completing and without creating anything.
//!
//! Reviving a gate re-evaluates its conditions against the *current*
//! process data, which may pick a different branch than the first time.

use super::{NextActivation, NodeActivation, Progress, Scope};
use crate::flow::{Condition, Node, NodeIndex};
use crate::models::{Task, Transition};
use crate::{FlowError, Result};

pub(crate) struct IfActivation<'f> {
    pub node: &'f Node,
    pub condition: &'f Condition,
    pub on_true: Option<NodeIndex>,
    pub on_false: Option<NodeIndex>,
}

#[async_trait::async_trait]
impl NodeActivation for IfActivation<'_> {
    fn node(&self) -> &Node {
        self.node
    }

    async fn activate(&self, scope: &mut Scope, task: &mut Task) -> Result<Progress> {
        scope.guard(task, Transition::Activate)?;
        scope.mark_started(task);
        Ok(Progress::Complete)
    }

    fn create_next(&self, scope: &Scope, task: &Task) -> Result<Vec<NextActivation>> {
        let branch = if scope.evaluate(self.condition, task)? {
            self.on_true
        } else {
            self.on_false
        };
        tracing::debug!(task_id = %task.id, node = %task.node, branch = ?branch, "if evaluated");
        branch
            .map(|node| vec![NextActivation::follow(node, task)])
            .ok_or_else(|| FlowError::NoActiveBranch {
                node: self.node.name().to_string(),
                task: task.id,
            })
    }
}

pub(crate) struct SwitchActivation<'f> {
    pub node: &'f Node,
    pub cases: &'f [(NodeIndex, Condition)],
    pub default: Option<NodeIndex>,
}

#[async_trait::async_trait]
impl NodeActivation for SwitchActivation<'_> {
    fn node(&self) -> &Node {
        self.node
    }

    async fn activate(&self, scope: &mut Scope, task: &mut Task) -> Result<Progress> {
        scope.guard(task, Transition::Activate)?;
        scope.mark_started(task);
        Ok(Progress::Complete)
    }

    fn create_next(&self, scope: &Scope, task: &Task) -> Result<Vec<NextActivation>> {
        for (node, condition) in self.cases {
            if scope.evaluate(condition, task)? {
                return Ok(vec![NextActivation::follow(*node, task)]);
            }
        }
        match self.default {
            Some(node) => Ok(vec![NextActivation::follow(node, task)]),
            None => Err(FlowError::NoActiveBranch {
                node: self.node.name().to_string(),
                task: task.id,
            }),
        }
    }
}
