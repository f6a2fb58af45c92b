// Flow graph - static definition shared by every process of one flow type

//! # Flow Graph Module
//!
//! A [`Flow`] is an immutable directed graph of [`Node`]s built once per
//! flow type and shared (behind `Arc`) by every running process.
//!
//! ## Two-Phase Build
//!
//! Nodes may refer to siblings that are declared later:
//!
//! ```rust
//! use flowkeeper::flow::{Flow, NodeSpec};
//!
//! let flow = Flow::builder("helpdesk", "tickets.flows.TicketFlow")
//!     .node("start", NodeSpec::start().next("triage"))   // `triage` not declared yet
//!     .node("triage", NodeSpec::handle().next("end"))
//!     .node("end", NodeSpec::end())
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(flow.reference(), "helpdesk/tickets.flows.TicketFlow");
//! ```
//!
//! [`FlowBuilder::build`] first collects every [`NodeSpec`] under its name,
//! then resolves names into [`NodeIndex`] handles, then computes each node's
//! incoming edges exactly once. The result is read-only for its lifetime.
//!
//! ## Rust Learning Notes:
//!
//! ### Index Handles Instead of Pointers
//! Nodes point at each other through `usize` indices into `Flow::nodes`.
//! This avoids reference cycles and lifetimes entirely: a graph of
//! `Arc<Node>` pointing at each other could never be freed.

pub mod node;
pub mod registry;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;

use crate::{FlowError, Result};

pub use node::{
    Behavior, Condition, EdgeKind, JobCallback, JobContext, Node, NodeIndex, NodeKind, NodeSpec,
    TaskCallback, TaskContext,
};
pub use registry::{parse_node_reference, FlowRegistry};

/// Directed edge between two nodes, with a diagnostic class tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Edge {
    pub src: NodeIndex,
    pub dst: NodeIndex,
    pub kind: EdgeKind,
}

/// Resolved, immutable flow definition.
#[derive(Debug)]
pub struct Flow {
    app: String,
    path: String,
    nodes: Vec<Node>,
    index: HashMap<String, NodeIndex>,
    incoming: Vec<Vec<Edge>>,
}

impl Flow {
    /// Start declaring a flow. `path` is the dotted `module.path.FlowName`.
    pub fn builder<A: Into<String>, P: Into<String>>(app: A, path: P) -> FlowBuilder {
        FlowBuilder {
            app: app.into(),
            path: path.into(),
            nodes: Vec::new(),
        }
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    /// Short flow name, the last segment of the dotted path.
    pub fn name(&self) -> &str {
        self.path.rsplit('.').next().unwrap_or(&self.path)
    }

    /// Stable textual reference: `{app}/{module.path}.{FlowName}`.
    pub fn reference(&self) -> String {
        format!("{}/{}", self.app, self.path)
    }

    /// Stable textual reference of a node: `{flow reference}.{node_name}`.
    pub fn node_reference(&self, index: NodeIndex) -> String {
        format!("{}.{}", self.reference(), self.nodes[index].name)
    }

    pub fn node(&self, index: NodeIndex) -> &Node {
        &self.nodes[index]
    }

    pub fn node_index(&self, name: &str) -> Result<NodeIndex> {
        self.index.get(name).copied().ok_or_else(|| FlowError::UnknownNode {
            flow: self.reference(),
            node: name.to_string(),
        })
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeIndex, &Node)> {
        self.nodes.iter().enumerate()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn start_nodes(&self) -> Vec<NodeIndex> {
        self.nodes()
            .filter(|(_, n)| n.kind() == NodeKind::Start)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn outgoing(&self, index: NodeIndex) -> Vec<Edge> {
        self.nodes[index]
            .behavior
            .outgoing()
            .into_iter()
            .map(|(dst, kind)| Edge { src: index, dst: *dst, kind })
            .collect()
    }

    pub fn incoming(&self, index: NodeIndex) -> &[Edge] {
        &self.incoming[index]
    }

    /// Every edge of the graph in node declaration order.
    pub fn edges(&self) -> Vec<Edge> {
        (0..self.nodes.len()).flat_map(|i| self.outgoing(i)).collect()
    }
}

/// Collects node declarations until [`build`](FlowBuilder::build) resolves them.
#[derive(Debug)]
pub struct FlowBuilder {
    app: String,
    path: String,
    nodes: Vec<NodeSpec>,
}

impl FlowBuilder {
    pub fn node<N: Into<String>>(mut self, name: N, mut spec: NodeSpec) -> Self {
        spec.name = name.into();
        self.nodes.push(spec);
        self
    }

    /// Resolve symbolic references, compute incoming edges and validate.
    pub fn build(self) -> Result<Arc<Flow>> {
        let reference = format!("{}/{}", self.app, self.path);
        if self.app.is_empty() || self.app.contains('/') || self.path.is_empty() {
            return Err(FlowError::InvalidReference(reference));
        }

        let mut index = HashMap::with_capacity(self.nodes.len());
        for (i, spec) in self.nodes.iter().enumerate() {
            if spec.name.is_empty() || spec.name.contains('.') {
                return Err(FlowError::FlowDefinition(format!(
                    "{}: invalid node name `{}`",
                    reference, spec.name
                )));
            }
            if index.insert(spec.name.clone(), i).is_some() {
                return Err(FlowError::FlowDefinition(format!(
                    "{}: duplicate node `{}`",
                    reference, spec.name
                )));
            }
        }

        let mut nodes = Vec::with_capacity(self.nodes.len());
        for spec in self.nodes {
            let missing = spec.behavior.missing_successors();
            if !missing.is_empty() {
                return Err(FlowError::FlowDefinition(format!(
                    "{}: node `{}` is missing {}",
                    reference,
                    spec.name,
                    missing.join(", ")
                )));
            }

            let owner = spec.name.clone();
            let behavior = spec.behavior.try_map(|target: String| {
                index.get(&target).copied().ok_or_else(|| {
                    FlowError::FlowDefinition(format!(
                        "{}: node `{}` refers to unknown node `{}`",
                        reference, owner, target
                    ))
                })
            })?;

            nodes.push(Node {
                name: spec.name,
                behavior,
                permission: spec.permission,
                description: spec.description,
            });
        }

        let mut flow = Flow {
            app: self.app,
            path: self.path,
            incoming: vec![Vec::new(); nodes.len()],
            nodes,
            index,
        };

        for edge in flow.edges() {
            flow.incoming[edge.dst].push(edge);
        }

        flow.validate()?;
        tracing::debug!(flow = %flow.reference(), nodes = flow.len(), "flow resolved");
        Ok(Arc::new(flow))
    }
}

impl Flow {
    /// Structural checks run once after resolution.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(FlowError::FlowDefinition(format!("{}: {}", self.reference(), msg)));

        if self.start_nodes().is_empty() {
            return fail("flow has no start node".into());
        }
        if !self.nodes.iter().any(|n| n.kind() == NodeKind::End) {
            return fail("flow has no end node".into());
        }

        for (i, node) in self.nodes() {
            if node.kind() != NodeKind::Start && self.incoming[i].is_empty() {
                return fail(format!("node `{}` is unreachable", node.name));
            }
            if node.kind() == NodeKind::Start && !self.incoming[i].is_empty() {
                return fail(format!("start node `{}` has incoming edges", node.name));
            }
            if let Behavior::Split { branches } = &node.behavior {
                let distinct: HashSet<_> = branches.iter().map(|(dst, _)| *dst).collect();
                if distinct.len() != branches.len() {
                    return fail(format!("split `{}` lists a branch twice", node.name));
                }
            }
        }
        Ok(())
    }
}
