use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::ItemId;
use crate::types::WorkItem;

/// A directed edge `from -> to` meaning `to` depends on `from`
/// (`from` must complete before `to` is ready).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: ItemId,
    pub to: ItemId,
}

/// Borrowed input to the Priority Analyzer. The core never
/// mutates a graph in place; `analyze()` takes a reference and returns a
/// derived `AnalysisResult`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DependencyGraph {
    pub nodes: BTreeMap<ItemId, WorkItem>,
    pub edges: Vec<Edge>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nodes(nodes: impl IntoIterator<Item = WorkItem>) -> Self {
        let mut graph = Self::default();
        for node in nodes {
            graph.nodes.insert(node.id.clone(), node);
        }
        graph
    }

    pub fn add_edge(&mut self, from: impl Into<ItemId>, to: impl Into<ItemId>) {
        self.edges.push(Edge {
            from: from.into(),
            to: to.into(),
        });
    }

    /// Validate the ingestion invariants: every edge endpoint
    /// exists, no self-edges, node ids unique (guaranteed by `BTreeMap`).
    pub fn validate(&self) -> Result<(), GraphValidationError> {
        if self.nodes.is_empty() {
            return Err(GraphValidationError::Empty);
        }
        for edge in &self.edges {
            if edge.from == edge.to {
                return Err(GraphValidationError::SelfEdge(edge.from.clone()));
            }
            if !self.nodes.contains_key(&edge.from) {
                return Err(GraphValidationError::UnknownEndpoint(edge.from.clone()));
            }
            if !self.nodes.contains_key(&edge.to) {
                return Err(GraphValidationError::UnknownEndpoint(edge.to.clone()));
            }
        }
        Ok(())
    }

    /// Adjacency list from `item` to the items that depend on it
    /// (i.e. edges `item -> dependent`).
    pub fn dependents_of(&self, item: &ItemId) -> Vec<ItemId> {
        self.edges
            .iter()
            .filter(|e| &e.from == item)
            .map(|e| e.to.clone())
            .collect()
    }

    /// Items that `item` depends on (edges `dependency -> item`).
    pub fn dependencies_of(&self, item: &ItemId) -> Vec<ItemId> {
        self.edges
            .iter()
            .filter(|e| &e.to == item)
            .map(|e| e.from.clone())
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GraphValidationError {
    #[error("graph has no nodes")]
    Empty,
    #[error("self-edge on item {0}")]
    SelfEdge(ItemId),
    #[error("edge references unknown item {0}")]
    UnknownEndpoint(ItemId),
}
