// Flow registry - resolves textual references back to flow definitions

//! Processes and queued jobs only store strings. A job may run on another
//! worker than the one that scheduled it, so everything the engine needs
//! must be recoverable from `"{app}/{module.path}.{FlowName}.{node}"`.

use std::sync::Arc;

use dashmap::DashMap;

use super::{Flow, NodeIndex};
use crate::{FlowError, Result};

/// Split a node reference into its flow reference and node name.
pub fn parse_node_reference(reference: &str) -> Result<(&str, &str)> {
    let invalid = || FlowError::InvalidReference(reference.to_string());
    let (app, rest) = reference.split_once('/').ok_or_else(invalid)?;
    if app.is_empty() {
        return Err(invalid());
    }
    let (flow_path, node) = rest.rsplit_once('.').ok_or_else(invalid)?;
    if flow_path.is_empty() || node.is_empty() {
        return Err(invalid());
    }
    Ok((&reference[..app.len() + 1 + flow_path.len()], node))
}

/// Concurrent map of flow reference to definition.
#[derive(Debug, Default)]
pub struct FlowRegistry {
    flows: DashMap<String, Arc<Flow>>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a flow, replacing any previous definition under the same reference.
    pub fn register(&self, flow: Arc<Flow>) -> Arc<Flow> {
        let reference = flow.reference();
        if self.flows.insert(reference.clone(), flow.clone()).is_some() {
            tracing::warn!(flow = %reference, "flow definition replaced");
        } else {
            tracing::debug!(flow = %reference, "flow registered");
        }
        flow
    }

    pub fn get(&self, reference: &str) -> Result<Arc<Flow>> {
        self.flows
            .get(reference)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| FlowError::UnknownFlow(reference.to_string()))
    }

    /// Resolve a full node reference to its flow and node handle.
    pub fn resolve_node(&self, reference: &str) -> Result<(Arc<Flow>, NodeIndex)> {
        let (flow_ref, node) = parse_node_reference(reference)?;
        let flow = self.get(flow_ref)?;
        let index = flow.node_index(node)?;
        Ok((flow, index))
    }

    pub fn references(&self) -> Vec<String> {
        let mut refs: Vec<String> = self.flows.iter().map(|e| e.key().clone()).collect();
        refs.sort();
        refs
    }
}
