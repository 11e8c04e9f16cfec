//! Workflow graph definition and routing.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use forgeline_core::ticket::TicketStatus;
use forgeline_core::types::WorkflowId;

use super::{WorkflowError, WorkflowNode};

/// Routing target that ends the run.
pub const FINALIZE: &str = "__end__";

/// Edge connecting two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowEdge {
    /// Source node ID.
    pub from: String,
    /// Target node ID.
    pub to: String,
    /// Label a result's `next_step` must carry to take this edge.
    pub condition: Option<String>,
}

/// Workflow definition.
pub struct WorkflowGraph {
    /// Workflow ID, half of the checkpoint key.
    pub id: WorkflowId,
    /// Display name.
    pub name: String,
    /// Nodes in the workflow.
    pub nodes: Vec<Arc<dyn WorkflowNode>>,
    /// Edges connecting nodes.
    pub edges: Vec<WorkflowEdge>,
    /// Starting node ID.
    pub start_node: String,
    /// Ticket status set when the run finalizes.
    pub completion_status: TicketStatus,
}

impl WorkflowGraph {
    /// Create an empty workflow.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        start_node: impl Into<String>,
        completion_status: TicketStatus,
    ) -> Self {
        Self {
            id: WorkflowId::new(id),
            name: name.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
            start_node: start_node.into(),
            completion_status,
        }
    }

    /// Add a node.
    #[must_use]
    pub fn with_node(mut self, node: Arc<dyn WorkflowNode>) -> Self {
        self.nodes.push(node);
        self
    }

    /// Add an unconditional edge.
    #[must_use]
    pub fn with_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push(WorkflowEdge {
            from: from.into(),
            to: to.into(),
            condition: None,
        });
        self
    }

    /// Add a conditional edge.
    #[must_use]
    pub fn with_conditional_edge(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        condition: impl Into<String>,
    ) -> Self {
        self.edges.push(WorkflowEdge {
            from: from.into(),
            to: to.into(),
            condition: Some(condition.into()),
        });
        self
    }

    /// Find node by ID.
    #[must_use]
    pub fn find_node(&self, id: &str) -> Option<&Arc<dyn WorkflowNode>> {
        self.nodes.iter().find(|n| n.id() == id)
    }

    /// Outgoing edges from a node.
    pub fn outgoing_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a WorkflowEdge> {
        self.edges.iter().filter(move |e| e.from == node_id)
    }

    /// Check the graph is well-formed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidWorkflow` for duplicate node IDs, a missing start
    /// node, or edges touching unknown nodes.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id()) {
                return Err(WorkflowError::InvalidWorkflow(format!(
                    "duplicate node id '{}'",
                    node.id()
                )));
            }
        }
        if !seen.contains(self.start_node.as_str()) {
            return Err(WorkflowError::InvalidWorkflow(format!(
                "start node '{}' is not in the graph",
                self.start_node
            )));
        }
        for edge in &self.edges {
            for end in [&edge.from, &edge.to] {
                if !seen.contains(end.as_str()) {
                    return Err(WorkflowError::InvalidWorkflow(format!(
                        "edge {} -> {} references unknown node '{end}'",
                        edge.from, edge.to
                    )));
                }
            }
        }
        Ok(())
    }

    /// Pick the node after `from`.
    ///
    /// A `next_step` matching an outgoing edge label takes that edge;
    /// otherwise it must name a node (or [`FINALIZE`]). Without a
    /// `next_step` the first unconditional edge is taken. `None` means the
    /// run finalizes.
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` if `next_step` names neither a label nor a node.
    pub fn route(&self, from: &str, next_step: Option<&str>) -> Result<Option<String>, WorkflowError> {
        match next_step {
            Some(FINALIZE) => Ok(None),
            Some(label) => {
                if let Some(edge) = self
                    .outgoing_edges(from)
                    .find(|e| e.condition.as_deref() == Some(label))
                {
                    return Ok(Some(edge.to.clone()));
                }
                if self.find_node(label).is_some() {
                    return Ok(Some(label.to_string()));
                }
                Err(WorkflowError::NodeNotFound(label.to_string()))
            }
            None => Ok(self
                .outgoing_edges(from)
                .find(|e| e.condition.is_none())
                .map(|e| e.to.clone())),
        }
    }
}
